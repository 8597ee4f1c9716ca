//! Cluster lifecycle pipelines.
//!
//! Every operation is a fixed sequence of steps. Steps fan out over hosts and
//! a failing step aborts the operation with the step name attached. Nothing
//! is rolled back: re-running the same operation is how a failure is retried,
//! so every step is safe to repeat.

mod scale;

use crate::cluster::LocalRegistry;
use crate::clusterfile;
use crate::config::{ClusterPaths, RuntimeConfig};
use crate::container_runtime::{ContainerRuntimeInstaller, Info};
use crate::error::{Result, StepContext};
use crate::hooks::{HookRunner, HookRunnerBuilder, Phase};
use crate::infradriver::{InfraDriver, check_ssh};
use crate::kube::{KubeDriver, KubeadmRuntime};
use crate::registry::{Configurator, LocalInstaller, RegistryDriver};
use kubefleet_infra::hosts;
use std::{collections::HashMap, fs, io, net::IpAddr, path::Path, sync::Arc};
use tracing::{info, warn};

pub const REGISTRY_CONFIGMAP: &str = "kubefleet-registry";
const REGISTRY_CONFIGMAP_NAMESPACE: &str = "kube-system";
const REGISTRY_CONFIGMAP_KEY: &str = "registry";

pub struct Installer {
	driver: Arc<dyn InfraDriver>,
	config: RuntimeConfig,
	paths: ClusterPaths,
	hooks: HookRunner,
	runtime: ContainerRuntimeInstaller,
}

impl Installer {
	/// Plugins declared in `config` become hooks here.
	pub fn new(driver: Arc<dyn InfraDriver>, config: RuntimeConfig, paths: ClusterPaths) -> Self {
		let hooks = HookRunner::builder()
			.plugins(&config.plugins, driver.clone())
			.build();
		let runtime = ContainerRuntimeInstaller::new(config.container_runtime.clone(), driver.clone());
		Self {
			driver,
			config,
			paths,
			hooks,
			runtime,
		}
	}

	/// Replaces the hooks with `builder`, plugins registered after its own hooks.
	pub fn with_hooks(mut self, builder: HookRunnerBuilder) -> Self {
		self.hooks = builder
			.plugins(&self.config.plugins, self.driver.clone())
			.build();
		self
	}

	/// First bring-up of the whole cluster.
	pub async fn install(&self) -> Result<(RegistryDriver, KubeDriver)> {
		let all = self.driver.host_ips();
		let masters = self.driver.masters();
		let workers = self.driver.workers();
		info!("Installing cluster {} on {} hosts.", self.driver.cluster_name(), all.len());

		self.driver.set_host_aliases(&all).await.step("set host aliases")?;
		self.config
			.distributor
			.distribute(&all, &self.driver.rootfs_path())
			.await
			.step("distribute rootfs")?;
		self.hooks.run_phase(Phase::PreInstall).await?;
		self.hooks.run_host_phase(Phase::PreInitHost, &all).await?;
		self.runtime.install_on(&all).await.step("install container runtime")?;
		let info = self.runtime.info();

		let deploy_hosts = self
			.reconcile_registry(self.persisted_registry_hosts(), &masters)
			.await
			.step("reconcile registry")?;
		let registry = self.configurator(deploy_hosts, info.clone());
		registry
			.install_on(&masters, &workers)
			.await
			.step("configure registry clients")?;

		let kube = self.kube_runtime(info);
		kube.install().await.step("install kubernetes")?;
		self.hooks.run_host_phase(Phase::PostInitHost, &all).await?;
		self.hooks.run_phase(Phase::PostInstall).await?;

		let kube_driver = kube.current_driver()?;
		self.apply_node_metadata(&kube_driver, &all)
			.await
			.step("apply node labels and taints")?;
		self.save_registry_info(&kube_driver, &registry)
			.await
			.step("save registry info")?;
		self.launch().await.step("launch applications")?;
		info!("Cluster {} is installed.", self.driver.cluster_name());
		Ok((registry.driver(), kube_driver))
	}

	/// Moves the cluster to the image the driver was built with.
	///
	/// Returns the registry driver so the caller can persist its deploy hosts.
	pub async fn upgrade(&self) -> Result<RegistryDriver> {
		info!("Upgrading cluster {}.", self.driver.cluster_name());
		self.config
			.distributor
			.distribute(&self.driver.host_ips(), &self.driver.rootfs_path())
			.await
			.step("distribute rootfs")?;
		let registry = self.refresh_registry().await?;
		self.hooks.run_phase(Phase::Upgrade).await?;
		self.kube_runtime(self.runtime.info())
			.upgrade()
			.await
			.step("upgrade kubernetes")?;
		self.launch().await.step("launch applications")?;
		Ok(registry)
	}

	/// Restores a previous image. Kubernetes itself is left as is.
	pub async fn rollback(&self) -> Result<RegistryDriver> {
		info!("Rolling back cluster {}.", self.driver.cluster_name());
		self.config
			.distributor
			.distribute(&self.driver.host_ips(), &self.driver.rootfs_path())
			.await
			.step("distribute rootfs")?;
		let registry = self.refresh_registry().await?;
		self.hooks.run_phase(Phase::Rollback).await?;
		self.launch().await.step("launch applications")?;
		Ok(registry)
	}

	/// Tears the whole cluster down and forgets it locally.
	///
	/// Unreachable hosts fail the operation unless `force` is set, in which
	/// case they are skipped.
	pub async fn uninstall(&self) -> Result<()> {
		let all = self.driver.host_ips();
		let masters = self.driver.masters();
		let workers = self.driver.workers();
		info!("Deleting cluster {}.", self.driver.cluster_name());

		let (unreachable, checked) = check_ssh(&*self.driver, &all).await;
		if !self.config.options.force {
			checked.step("check host connectivity")?;
		} else if !unreachable.is_empty() {
			warn!("Skipping unreachable hosts {unreachable:?}.");
		}
		let reachable = hosts::remove(&all, &unreachable);

		self.hooks.run_phase(Phase::PreUnInstall).await?;
		self.hooks.run_host_phase(Phase::PreCleanHost, &reachable).await?;
		let info = self.runtime.info();
		self.kube_runtime(info.clone())
			.reset(&reachable)
			.await
			.step("reset kubernetes")?;

		let deployed = hosts::remove(&self.deployed_registry_hosts(&masters), &unreachable);
		self.configurator(deployed.clone(), info)
			.uninstall_from(&masters, &workers, &unreachable)
			.await
			.step("remove registry clients")?;
		if let Some(installer) = self.registry_installer(deployed) {
			installer.clean_all().await.step("remove registry")?;
		}

		self.runtime
			.uninstall_from(&reachable)
			.await
			.step("uninstall container runtime")?;
		self.hooks.run_host_phase(Phase::PostCleanHost, &reachable).await?;
		self.driver
			.delete_host_aliases(&reachable)
			.await
			.step("delete host aliases")?;
		self.config
			.distributor
			.restore(&self.driver.base_path(), &reachable)
			.await
			.step("restore hosts")?;
		self.hooks.run_phase(Phase::PostUnInstall).await?;
		self.remove_local_files().step("remove local files")?;
		info!("Cluster {} is deleted.", self.driver.cluster_name());
		Ok(())
	}

	fn local_registry(&self) -> Option<&LocalRegistry> {
		self.driver.cluster().local_registry()
	}

	fn is_ha_registry(&self) -> bool {
		self.local_registry().is_some_and(|registry| registry.ha)
	}

	/// Deploy hosts recorded in the Clusterfile. Empty before the first install.
	fn persisted_registry_hosts(&self) -> Vec<IpAddr> {
		self.local_registry()
			.map(|registry| registry.deploy_hosts.clone())
			.unwrap_or_default()
	}

	/// Where the local registry should run given `masters`.
	fn desired_registry_hosts(&self, masters: &[IpAddr]) -> Vec<IpAddr> {
		match self.local_registry() {
			Some(registry) if registry.ha => masters.to_vec(),
			Some(_) => masters.iter().take(1).copied().collect(),
			None => Vec::new(),
		}
	}

	/// Persisted deploy hosts, or where install put the registry when a
	/// Clusterfile predates deploy host tracking.
	fn deployed_registry_hosts(&self, masters: &[IpAddr]) -> Vec<IpAddr> {
		let persisted = self.persisted_registry_hosts();
		if persisted.is_empty() {
			self.desired_registry_hosts(masters)
		} else {
			persisted
		}
	}

	fn registry_installer(&self, current: Vec<IpAddr>) -> Option<LocalInstaller> {
		let registry = self.local_registry()?;
		Some(LocalInstaller::new(
			current,
			registry.clone(),
			self.driver.clone(),
			self.config.distributor.clone(),
			self.paths.registry_dir(self.driver.cluster_name()),
		))
	}

	/// Converges the local registry onto the registry hosts for `masters`.
	/// External registries have no deploy hosts.
	async fn reconcile_registry(
		&self,
		current: Vec<IpAddr>,
		masters: &[IpAddr],
	) -> Result<Vec<IpAddr>> {
		let desired = self.desired_registry_hosts(masters);
		match self.registry_installer(current) {
			Some(installer) => installer.reconcile(&desired).await,
			None => Ok(Vec::new()),
		}
	}

	/// Keeps the registry topology and pushes the current image's content.
	async fn refresh_registry(&self) -> Result<RegistryDriver> {
		let masters = self.driver.masters();
		let deployed = self.deployed_registry_hosts(&masters);
		let deploy_hosts = match self.registry_installer(deployed.clone()) {
			Some(installer) => installer
				.reconcile(&deployed)
				.await
				.step("reconcile registry")?,
			None => Vec::new(),
		};
		let registry = self.configurator(deploy_hosts, self.runtime.info()).driver();
		registry
			.upload_container_images()
			.await
			.step("upload container images")?;
		Ok(registry)
	}

	fn configurator(&self, deploy_hosts: Vec<IpAddr>, info: Info) -> Configurator {
		Configurator::new(
			&self.driver.cluster().registry,
			deploy_hosts,
			info,
			self.driver.clone(),
			self.config.distributor.clone(),
			self.paths.registry_dir(self.driver.cluster_name()),
		)
	}

	fn kube_runtime(&self, info: Info) -> KubeadmRuntime {
		KubeadmRuntime::new(
			self.driver.clone(),
			self.config.kubeadm.clone(),
			info,
			self.driver.cluster().registry.config().endpoint(),
			self.paths.kubeconfig(),
		)
	}

	/// Role labels, host group labels and taints for every target node.
	async fn apply_node_metadata(&self, kube: &KubeDriver, targets: &[IpAddr]) -> Result<()> {
		let names = kube.node_names().await?;
		for host in targets {
			self.apply_host_metadata(kube, &names, host)
				.await
				.map_err(|err| err.on_host(*host))?;
		}
		Ok(())
	}

	async fn apply_host_metadata(
		&self,
		kube: &KubeDriver,
		names: &HashMap<IpAddr, String>,
		host: &IpAddr,
	) -> Result<()> {
		kube.label_node(names, host, &self.driver.roles_of(host), &self.driver.host_labels(host))
			.await?;
		for taint in self.driver.host_taints(host)? {
			kube.taint_node(names, host, &taint).await?;
		}
		Ok(())
	}

	async fn save_registry_info(&self, kube: &KubeDriver, registry: &Configurator) -> Result<()> {
		let yaml = registry.info()?.to_yaml()?;
		kube.apply_configmap(
			REGISTRY_CONFIGMAP_NAMESPACE,
			REGISTRY_CONFIGMAP,
			REGISTRY_CONFIGMAP_KEY,
			&yaml,
		)
		.await
	}

	/// Runs the cluster's launch commands on master0 from the rootfs.
	async fn launch(&self) -> Result<()> {
		let cmds = self.driver.launch_cmds();
		if cmds.is_empty() {
			return Ok(());
		}
		let master0 = self.driver.master0()?;
		let env = self.driver.cluster_env();
		for cmd in cmds {
			info!("Launching {cmd}.");
			let cmd = format!("cd {} && {cmd}", self.driver.rootfs_path());
			self.driver.cmd_async(master0, &env, &cmd).await?;
		}
		Ok(())
	}

	fn remove_local_files(&self) -> Result<()> {
		let name = self.driver.cluster_name();
		clusterfile::remove(&self.paths.clusterfile(name))?;
		clusterfile::remove(&self.paths.kubeconfig())?;
		if self.config.options.prune {
			remove_dir(&self.paths.registry_dir(name))?;
		}
		Ok(())
	}
}

fn remove_dir(dir: &Path) -> Result<()> {
	match fs::remove_dir_all(dir) {
		Ok(()) => {
			info!("Removed {}.", dir.display());
			Ok(())
		}
		Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
		Err(err) => Err(err.into()),
	}
}

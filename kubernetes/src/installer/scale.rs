use super::Installer;
use crate::error::{ClusterError, Result, StepContext};
use crate::hooks::Phase;
use crate::infradriver::check_ssh;
use crate::kube::KubeDriver;
use crate::registry::RegistryDriver;
use kubefleet_infra::hosts;
use std::net::IpAddr;
use tracing::{info, warn};

impl Installer {
	/// Joins new hosts. The driver must already describe the grown cluster.
	pub async fn scale_up(
		&self,
		masters: &[IpAddr],
		nodes: &[IpAddr],
	) -> Result<(RegistryDriver, KubeDriver)> {
		let joining = hosts::union(masters, nodes);
		if joining.is_empty() {
			return Err(ClusterError::Config("no hosts to join".into()));
		}
		info!("Scaling up cluster {} with {joining:?}.", self.driver.cluster_name());

		// Joining masters re-point every existing worker at the control plane.
		let probe = if masters.is_empty() {
			joining.clone()
		} else {
			hosts::union(&joining, &self.driver.workers())
		};
		let (_, ready) = check_ssh(&*self.driver, &probe).await;
		ready.step("check host connectivity")?;

		self.driver.set_host_aliases(&joining).await.step("set host aliases")?;
		self.config
			.distributor
			.distribute(&joining, &self.driver.rootfs_path())
			.await
			.step("distribute rootfs")?;
		self.hooks.run_phase(Phase::PreScaleUp).await?;
		self.hooks.run_host_phase(Phase::PreInitHost, &joining).await?;
		self.runtime
			.install_on(&joining)
			.await
			.step("install container runtime")?;
		let info = self.runtime.info();

		let all_masters = self.driver.masters();
		let previous_masters = hosts::remove(&all_masters, masters);
		let deployed = self.deployed_registry_hosts(&previous_masters);
		let deploy_hosts = if self.is_ha_registry() {
			self.reconcile_registry(deployed, &all_masters)
				.await
				.step("reconcile registry")?
		} else {
			deployed
		};
		let registry = self.configurator(deploy_hosts, info.clone());
		registry
			.install_on(masters, nodes)
			.await
			.step("configure registry clients")?;

		self.hooks.run_host_phase(Phase::PreJoin, &joining).await?;
		let kube = self.kube_runtime(info);
		kube.scale_up(masters, nodes).await.step("join hosts")?;
		self.hooks.run_host_phase(Phase::PostInitHost, &joining).await?;
		self.hooks.run_phase(Phase::PostScaleUp).await?;

		let kube_driver = kube.current_driver()?;
		self.apply_node_metadata(&kube_driver, &joining)
			.await
			.step("apply node labels and taints")?;
		if self.is_ha_registry() {
			self.save_registry_info(&kube_driver, &registry)
				.await
				.step("save registry info")?;
		}
		Ok((registry.driver(), kube_driver))
	}

	/// Removes hosts. The driver must still describe the cluster before removal.
	///
	/// Departing hosts that cannot be reached are removed from Kubernetes only
	/// and skipped by every host-local cleanup step.
	pub async fn scale_down(
		&self,
		masters: &[IpAddr],
		nodes: &[IpAddr],
	) -> Result<(RegistryDriver, KubeDriver)> {
		let departing = hosts::union(masters, nodes);
		if departing.is_empty() {
			return Err(ClusterError::Config("no hosts to remove".into()));
		}
		let remaining_masters = hosts::remove(&self.driver.masters(), masters);
		let Some(&anchor) = remaining_masters.first() else {
			return Err(ClusterError::Config(
				"removing every master requires deleting the whole cluster".into(),
			));
		};
		let deployed = self.deployed_registry_hosts(&self.driver.masters());
		if !self.is_ha_registry() {
			if let Some(host) = deployed.iter().find(|host| hosts::contains(masters, host)) {
				return Err(ClusterError::Config(format!(
					"{host} runs the registry and cannot be removed while the registry is not highly available"
				)));
			}
		}
		info!("Scaling down cluster {} by {departing:?}.", self.driver.cluster_name());

		if !masters.is_empty() {
			let workers = hosts::remove(&self.driver.workers(), nodes);
			let (_, ready) = check_ssh(&*self.driver, &workers).await;
			ready.step("check remaining workers")?;
		}
		let (unreachable, _) = check_ssh(&*self.driver, &departing).await;
		if !unreachable.is_empty() {
			warn!("Hosts {unreachable:?} are unreachable, they are only removed from Kubernetes.");
		}
		let reachable = hosts::remove(&departing, &unreachable);

		self.driver
			.delete_host_aliases(&reachable)
			.await
			.step("delete host aliases")?;
		self.hooks.run_host_phase(Phase::PreCleanHost, &reachable).await?;
		let info = self.runtime.info();

		let live = hosts::remove(&deployed, &unreachable);
		let deploy_hosts = if self.is_ha_registry() {
			self.reconcile_registry(live, &remaining_masters)
				.await
				.step("reconcile registry")?
		} else {
			live
		};

		self.kube_runtime(info.clone())
			.scale_down(masters, nodes, &unreachable)
			.await
			.step("remove hosts from kubernetes")?;
		let registry = self.configurator(deploy_hosts, info);
		registry
			.uninstall_from(masters, nodes, &unreachable)
			.await
			.step("remove registry clients")?;
		self.runtime
			.uninstall_from(&reachable)
			.await
			.step("uninstall container runtime")?;
		self.hooks.run_host_phase(Phase::PostCleanHost, &reachable).await?;
		self.config
			.distributor
			.restore(&self.driver.base_path(), &reachable)
			.await
			.step("restore hosts")?;

		let kube_driver = KubeDriver::new(anchor, self.driver.clone());
		if self.is_ha_registry() {
			self.save_registry_info(&kube_driver, &registry)
				.await
				.step("save registry info")?;
		}
		Ok((registry.driver(), kube_driver))
	}
}

#[cfg(test)]
mod tests {
	use super::super::tests::{Fixture, cluster, insecure, ip};
	use super::*;
	use crate::config::InstallerOptions;
	use crate::hooks::HookRunner;
	use crate::testing::DistributorCall;
	use futures::FutureExt;
	use std::sync::{Arc, Mutex};

	const ROOTFS: &str = "/var/lib/kubefleet/data/prod/rootfs";
	const BASE: &str = "/var/lib/kubefleet/data/prod";

	#[tokio::test]
	async fn scale_up_spreads_ha_registry_to_new_masters() {
		// driver already holds the grown cluster: ip(4) and ip(5) are new
		let fixture = Fixture::new(cluster(
			&[ip(1), ip(2), ip(4)],
			&[ip(3), ip(5)],
			insecure(true, &[ip(1), ip(2)]),
		));
		fixture
			.driver
			.reply("get nodes", "172.16.0.1 m1\n172.16.0.2 m2\n172.16.0.3 n3\n172.16.0.4 m4\n172.16.0.5 n5\n");
		let log = Arc::new(Mutex::new(Vec::new()));
		let join_log = log.clone();
		let hooks = HookRunner::builder().host_hook(Phase::PreJoin, "log", move |hosts| {
			let log = join_log.clone();
			async move {
				log.lock().unwrap().push(hosts);
				Ok(())
			}
			.boxed()
		});
		let installer = fixture.installer(InstallerOptions::default()).with_hooks(hooks);

		let (registry, kube) = installer.scale_up(&[ip(4)], &[ip(5)]).await.unwrap();

		assert_eq!(registry.deploy_hosts(), &[ip(1), ip(2), ip(4)]);
		assert_eq!(kube.anchor(), ip(1));
		assert_eq!(*log.lock().unwrap(), vec![vec![ip(4), ip(5)]]);
		assert_eq!(
			fixture.distributor.calls(),
			vec![
				DistributorCall::Distribute(vec![ip(4), ip(5)], ROOTFS.into()),
				DistributorCall::Registry(vec![ip(4)], format!("{ROOTFS}/registry")),
			]
		);
		assert_eq!(fixture.driver.hosts_running("init-registry.sh"), vec![ip(4)]);
		assert_eq!(fixture.driver.hosts_running("kubeadm join"), vec![ip(4), ip(5)]);
		// existing worker follows both the new registry and apiserver backends
		let worker = fixture.driver.commands(ip(3));
		assert!(worker.iter().any(|cmd| cmd.contains("--vs 10.103.97.2:5000") && cmd.contains("172.16.0.4:5000")));
		assert!(worker.iter().any(|cmd| cmd.contains("--vs 10.103.97.2:6443") && cmd.contains("172.16.0.4:6443")));
	}

	#[tokio::test]
	async fn scale_up_of_nodes_keeps_singleton_registry() {
		let fixture = Fixture::new(cluster(&[ip(1)], &[ip(2)], insecure(false, &[ip(1)])));
		fixture.driver.reply("get nodes", "172.16.0.1 m1\n172.16.0.2 n2\n");
		let (registry, _) = fixture
			.installer(InstallerOptions::default())
			.scale_up(&[], &[ip(2)])
			.await
			.unwrap();
		assert_eq!(registry.deploy_hosts(), &[ip(1)]);
		assert!(fixture.driver.hosts_running("init-registry.sh").is_empty());
		assert_eq!(fixture.driver.hosts_running("#kubefleet:fleet.hub"), vec![ip(2)]);
		assert!(
			fixture
				.driver
				.commands(ip(1))
				.iter()
				.any(|cmd| cmd.contains("label nodes n2 'node-role.kubernetes.io/node='"))
		);
	}

	#[tokio::test(start_paused = true)]
	async fn scale_up_waits_for_every_new_host() {
		let fixture = Fixture::new(cluster(&[ip(1)], &[ip(2), ip(3)], insecure(false, &[ip(1)])));
		fixture.driver.unreachable(ip(3));
		let err = fixture
			.installer(InstallerOptions::default())
			.scale_up(&[], &[ip(2), ip(3)])
			.await
			.unwrap_err();
		assert!(err.to_string().starts_with("Step 'check host connectivity' failed"));
		assert_eq!(err.hosts(), vec![ip(3)]);
		assert!(fixture.distributor.calls().is_empty());
	}

	#[tokio::test]
	async fn removing_master0_promotes_the_next_master() {
		let mut grown = cluster(&[ip(1), ip(2), ip(3)], &[ip(4)], insecure(true, &[ip(1), ip(2), ip(3)]));
		let fixture = Fixture::new(grown.clone());
		fixture
			.driver
			.reply("get nodes", "172.16.0.1 m1\n172.16.0.2 m2\n172.16.0.3 m3\n172.16.0.4 n4\n");

		let (registry, kube) = fixture
			.installer(InstallerOptions::default())
			.scale_down(&[ip(1)], &[])
			.await
			.unwrap();

		assert_eq!(kube.anchor(), ip(2));
		assert_eq!(registry.deploy_hosts(), &[ip(2), ip(3)]);
		assert_eq!(fixture.driver.hosts_running("docker inspect kubefleet-registry"), vec![ip(1)]);
		assert_eq!(fixture.driver.hosts_running("kubeadm reset -f"), vec![ip(1)]);
		assert!(
			fixture
				.driver
				.commands(ip(2))
				.iter()
				.any(|cmd| cmd.ends_with("delete node 'm1' --ignore-not-found"))
		);
		let worker = fixture.driver.commands(ip(4));
		assert!(worker.iter().any(|cmd| cmd.starts_with(
			"lvscare care --vs 10.103.97.2:5000 --rs 172.16.0.2:5000 --rs 172.16.0.3:5000 "
		)));
		assert!(worker.iter().any(|cmd| cmd.starts_with(
			"lvscare care --vs 10.103.97.2:6443 --rs 172.16.0.2:6443 --rs 172.16.0.3:6443 "
		)));
		assert_eq!(
			fixture.distributor.calls(),
			vec![DistributorCall::Restore(BASE.into(), vec![ip(1)])]
		);

		grown.construct_for_scale_down(&[ip(1)], &[]).unwrap();
		assert_eq!(grown.master0().unwrap(), ip(2));
	}

	#[tokio::test]
	async fn singleton_registry_host_cannot_leave() {
		let fixture = Fixture::new(cluster(&[ip(1), ip(2)], &[], insecure(false, &[ip(1)])));
		let err = fixture
			.installer(InstallerOptions::default())
			.scale_down(&[ip(1)], &[])
			.await
			.unwrap_err();
		assert!(matches!(err, ClusterError::Config(_)));
		assert!(fixture.driver.calls(ip(1)).is_empty());
		assert!(fixture.driver.calls(ip(2)).is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn unreachable_departing_host_is_only_removed_from_kubernetes() {
		let fixture = Fixture::new(cluster(&[ip(1)], &[ip(2), ip(3)], insecure(false, &[ip(1)])));
		fixture.driver.reply("get nodes", "172.16.0.1 m1\n172.16.0.2 n2\n172.16.0.3 n3\n");
		fixture.driver.unreachable(ip(3));

		fixture
			.installer(InstallerOptions::default())
			.scale_down(&[], &[ip(2), ip(3)])
			.await
			.unwrap();

		assert!(fixture.driver.calls(ip(3)).is_empty());
		assert_eq!(fixture.driver.hosts_running("kubeadm reset -f"), vec![ip(2)]);
		assert!(
			fixture
				.driver
				.commands(ip(1))
				.iter()
				.any(|cmd| cmd.ends_with("delete node 'n3' --ignore-not-found"))
		);
		assert_eq!(
			fixture.distributor.calls(),
			vec![DistributorCall::Restore(BASE.into(), vec![ip(2)])]
		);
	}
}

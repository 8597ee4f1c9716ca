//! Client side of the registry: how every node resolves, trusts and logs into it.

use super::{RegistryDriver, RegistryInfo, cert_paths, registry_vip};
use crate::cluster::{LocalRegistry, Registry, RegistryConfig, RuntimeKind};
use crate::container_runtime::Info;
use crate::distributor::Distributor;
use crate::error::{ClusterError, Result, StepContext};
use crate::infradriver::{Env, InfraDriver, set_host_alias_cmd, unset_host_alias_cmd};
use crate::ipvs::{LVSCARE_IMAGE, LvsRule};
use kubefleet_infra::{exec, hosts, quote};
use serde::Serialize;
use serde_json::{Value, json};
use std::{collections::BTreeMap, net::IpAddr, path::PathBuf, sync::Arc};
use tracing::info;

pub const LVS_POD_NAME: &str = "reg-lvscare";
const DOCKER_DAEMON_FILE: &str = "/etc/docker/daemon.json";
const KUBELET_AUTH_FILE: &str = "/var/lib/kubelet/config.json";

/// Registry client configuration, selected once from the cluster's registry kind.
pub enum Configurator {
	Local(LocalConfigurator),
	External(ExternalConfigurator),
}

impl Configurator {
	/// `deploy_hosts` is the reconciled registry host set. `local_dir` holds
	/// the generated registry certificate.
	pub fn new(
		registry: &Registry,
		deploy_hosts: Vec<IpAddr>,
		runtime: Info,
		driver: Arc<dyn InfraDriver>,
		distributor: Arc<dyn Distributor>,
		local_dir: PathBuf,
	) -> Self {
		match registry {
			Registry::Local(local) => Configurator::Local(LocalConfigurator {
				registry: local.clone(),
				deploy_hosts,
				runtime,
				driver,
				distributor,
				local_dir,
			}),
			Registry::External(config) => Configurator::External(ExternalConfigurator {
				config: config.clone(),
				runtime,
				driver,
			}),
		}
	}

	pub async fn install_on(&self, masters: &[IpAddr], nodes: &[IpAddr]) -> Result<()> {
		match self {
			Configurator::Local(local) => local.install_on(masters, nodes).await,
			Configurator::External(external) => external.install_on(masters, nodes).await,
		}
	}

	/// Removes client configuration from departing hosts, skipping `unreachable` ones.
	pub async fn uninstall_from(
		&self,
		masters: &[IpAddr],
		nodes: &[IpAddr],
		unreachable: &[IpAddr],
	) -> Result<()> {
		match self {
			Configurator::Local(local) => local.uninstall_from(masters, nodes, unreachable).await,
			Configurator::External(external) => {
				let reachable = hosts::remove(&hosts::union(masters, nodes), unreachable);
				external.uninstall_from(&reachable).await
			}
		}
	}

	pub fn driver(&self) -> RegistryDriver {
		match self {
			Configurator::Local(local) => RegistryDriver::local(
				local.registry.config.endpoint(),
				local.registry.data_dir(&local.driver.rootfs_path()),
				local.deploy_hosts.clone(),
				local.distributor.clone(),
			),
			Configurator::External(external) => RegistryDriver::external(external.config.endpoint()),
		}
	}

	pub fn info(&self) -> Result<RegistryInfo> {
		match self {
			Configurator::Local(local) => local.info(),
			Configurator::External(external) => {
				let mut config = external.config.clone();
				config.password = None;
				Ok(RegistryInfo::External(config))
			}
		}
	}
}

pub struct LocalConfigurator {
	registry: LocalRegistry,
	deploy_hosts: Vec<IpAddr>,
	runtime: Info,
	driver: Arc<dyn InfraDriver>,
	distributor: Arc<dyn Distributor>,
	local_dir: PathBuf,
}

impl LocalConfigurator {
	fn domain(&self) -> &str {
		&self.registry.config.domain
	}

	fn endpoint(&self) -> String {
		self.registry.config.endpoint()
	}

	async fn install_on(&self, masters: &[IpAddr], nodes: &[IpAddr]) -> Result<()> {
		let targets = hosts::union(masters, nodes);
		info!("Configuring registry clients on {targets:?}.");
		self.configure_network(masters, nodes)
			.await
			.step("configure registry network")?;
		self.configure_cert(&targets).await.step("install registry CA")?;
		self.configure_daemon(&targets)
			.await
			.step("configure container runtime mirror")?;
		if let Some((user, password)) = self.registry.config.credentials() {
			login(&*self.driver, &self.runtime, &self.endpoint(), user, password, &targets)
				.await
				.step("log into registry")?;
		}
		Ok(())
	}

	async fn configure_network(&self, masters: &[IpAddr], nodes: &[IpAddr]) -> Result<()> {
		if !self.registry.ha {
			let Some(deploy_host) = self.deploy_hosts.first() else {
				return Err(ClusterError::Config("local registry has no deploy host".into()));
			};
			let cmd = set_host_alias_cmd(self.domain(), deploy_host);
			return run_on(&*self.driver, &hosts::union(masters, nodes), &cmd).await;
		}
		exec::execute(masters, |master| async move {
			let cmd = set_host_alias_cmd(self.domain(), &master);
			self.driver.cmd_async(master, &Env::new(), &cmd).await
		})
		.await?;
		// Joining masters change the backends of every worker.
		let clients = if masters.is_empty() {
			nodes.to_vec()
		} else {
			self.driver.workers()
		};
		self.configure_lvs(&clients).await
	}

	/// Points `clients` at the VIP balancing over every deploy host.
	async fn configure_lvs(&self, clients: &[IpAddr]) -> Result<()> {
		let vip = registry_vip(&*self.driver)?;
		let scheme = if self.registry.insecure { "http" } else { "https" };
		let rule = LvsRule::new(
			LVS_POD_NAME,
			vip,
			self.registry.config.port,
			&self.deploy_hosts,
			scheme,
		);
		let pod = rule.static_pod(&format!("{}/{LVSCARE_IMAGE}", self.endpoint()))?;
		let alias = set_host_alias_cmd(self.domain(), &vip);
		exec::execute(clients, |host| {
			let (rule, pod, alias) = (&rule, &pod, &alias);
			async move {
				self.driver.cmd_async(host, &Env::new(), &rule.apply_cmd()).await?;
				self.driver.write(host, pod.as_bytes(), &rule.pod_path()).await?;
				self.driver.cmd_async(host, &Env::new(), alias).await
			}
		})
		.await?;
		Ok(())
	}

	async fn configure_cert(&self, targets: &[IpAddr]) -> Result<()> {
		if self.registry.insecure {
			return Ok(());
		}
		let (cert, _) = cert_paths(&self.local_dir, self.domain());
		let dest = format!(
			"{}/{}/{}.crt",
			self.runtime.certs_dir,
			self.endpoint(),
			self.domain()
		);
		exec::execute(targets, |host| {
			let (cert, dest) = (&cert, &dest);
			async move { self.driver.copy(host, cert, dest).await }
		})
		.await?;
		Ok(())
	}

	async fn configure_daemon(&self, targets: &[IpAddr]) -> Result<()> {
		let endpoint = self.endpoint();
		if endpoint == format!("{}:{}", LocalRegistry::DEFAULT_DOMAIN, LocalRegistry::DEFAULT_PORT) {
			// the rootfs ships client configuration for the default endpoint
			return Ok(());
		}
		match self.runtime.kind {
			RuntimeKind::Docker => {
				exec::execute(targets, |host| {
					let endpoint = &endpoint;
					async move {
						let current = self
							.driver
							.cmd(host, &Env::new(), &format!("cat {DOCKER_DAEMON_FILE} 2>/dev/null || true"))
							.await?;
						let merged = with_registry_mirror(&current, &format!("https://{endpoint}"))?;
						self.driver.write(host, merged.as_bytes(), DOCKER_DAEMON_FILE).await
					}
				})
				.await?;
			}
			RuntimeKind::Containerd => {
				let contents = containerd_hosts_toml(
					&endpoint,
					self.registry.insecure,
					&format!("{}/{endpoint}/{}.crt", self.runtime.certs_dir, self.domain()),
				)?;
				let dest = format!("{}/{endpoint}/hosts.toml", RuntimeKind::CONTAINERD_CERTS_DIR);
				exec::execute(targets, |host| {
					let (contents, dest) = (&contents, &dest);
					async move { self.driver.write(host, contents.as_bytes(), dest).await }
				})
				.await?;
			}
		}
		run_on(&*self.driver, targets, "systemctl daemon-reload").await
	}

	async fn uninstall_from(
		&self,
		masters: &[IpAddr],
		nodes: &[IpAddr],
		unreachable: &[IpAddr],
	) -> Result<()> {
		let departing = hosts::remove(&hosts::union(masters, nodes), unreachable);
		let mut cmd = unset_host_alias_cmd(self.domain());
		if self.registry.ha {
			cmd = format!("rm -f {}/{LVS_POD_NAME}.yaml && {cmd}", crate::ipvs::STATIC_POD_DIR);
		}
		if self.registry.config.credentials().is_some() {
			cmd = format!("{} && {cmd}", logout_cmd(&self.runtime, &self.endpoint()));
		}
		run_on(&*self.driver, &departing, &cmd)
			.await
			.step("remove registry client configuration")?;
		if !self.registry.ha || self.deploy_hosts.is_empty() || masters.is_empty() {
			return Ok(());
		}
		let remaining = hosts::remove(&self.driver.workers(), nodes);
		self.configure_lvs(&remaining)
			.await
			.step("re-program registry load balancing")
	}

	fn info(&self) -> Result<RegistryInfo> {
		let mut registry = self.registry.clone();
		registry.config.password = None;
		let vip = if registry.ha {
			registry.deploy_hosts = self.deploy_hosts.clone();
			Some(registry_vip(&*self.driver)?)
		} else {
			registry.deploy_hosts = self.deploy_hosts.iter().take(1).copied().collect();
			None
		};
		Ok(RegistryInfo::Local { registry, vip })
	}
}

/// Registry credentials only; the registry itself is managed elsewhere.
pub struct ExternalConfigurator {
	config: RegistryConfig,
	runtime: Info,
	driver: Arc<dyn InfraDriver>,
}

impl ExternalConfigurator {
	async fn install_on(&self, masters: &[IpAddr], nodes: &[IpAddr]) -> Result<()> {
		let Some((user, password)) = self.config.credentials() else {
			return Ok(());
		};
		let targets = hosts::union(masters, nodes);
		login(&*self.driver, &self.runtime, &self.config.endpoint(), user, password, &targets)
			.await
			.step("log into registry")
	}

	async fn uninstall_from(&self, targets: &[IpAddr]) -> Result<()> {
		if self.config.credentials().is_none() {
			return Ok(());
		}
		let cmd = logout_cmd(&self.runtime, &self.config.endpoint());
		run_on(&*self.driver, targets, &cmd)
			.await
			.step("log out of registry")
	}
}

async fn run_on(driver: &dyn InfraDriver, targets: &[IpAddr], cmd: &str) -> Result<()> {
	exec::execute(targets, |host| async move {
		driver.cmd_async(host, &Env::new(), cmd).await
	})
	.await?;
	Ok(())
}

/// Logs in with the engine CLI and hands the resulting credentials to kubelet.
async fn login(
	driver: &dyn InfraDriver,
	runtime: &Info,
	endpoint: &str,
	user: &str,
	password: &str,
	targets: &[IpAddr],
) -> Result<()> {
	let cmd = format!(
		"echo {} | {} login --username {} --password-stdin {endpoint} && mkdir -p /var/lib/kubelet && cp -f {} {KUBELET_AUTH_FILE}",
		quote(password),
		runtime.kind.client(),
		quote(user),
		runtime.config_file,
	);
	run_on(driver, targets, &cmd).await
}

fn logout_cmd(runtime: &Info, endpoint: &str) -> String {
	format!("{} logout {endpoint}", runtime.kind.client())
}

/// Adds `mirror` to the `registry-mirrors` of a docker daemon.json, keeping every other key.
fn with_registry_mirror(current: &str, mirror: &str) -> Result<String> {
	let mut config: Value = if current.trim().is_empty() {
		json!({})
	} else {
		serde_json::from_str(current)?
	};
	let Some(object) = config.as_object_mut() else {
		return Err(ClusterError::Config(format!("{DOCKER_DAEMON_FILE} is not a JSON object")));
	};
	let mirrors = object
		.entry("registry-mirrors")
		.or_insert_with(|| Value::Array(Vec::new()));
	let Some(mirrors) = mirrors.as_array_mut() else {
		return Err(ClusterError::Config("registry-mirrors is not a list".into()));
	};
	if !mirrors.iter().any(|m| m.as_str() == Some(mirror)) {
		mirrors.push(Value::String(mirror.to_owned()));
	}
	Ok(serde_json::to_string_pretty(&config)?)
}

#[derive(Serialize)]
struct HostsToml {
	server: String,
	host: BTreeMap<String, HostEntry>,
}

#[derive(Serialize)]
struct HostEntry {
	#[serde(skip_serializing_if = "Option::is_none")]
	ca: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	skip_verify: Option<bool>,
}

/// containerd `certs.d/<endpoint>/hosts.toml` for the registry.
fn containerd_hosts_toml(endpoint: &str, insecure: bool, ca: &str) -> Result<String> {
	let server = if insecure {
		format!("http://{endpoint}")
	} else {
		format!("https://{endpoint}")
	};
	let entry = if insecure {
		HostEntry {
			ca: None,
			skip_verify: Some(true),
		}
	} else {
		HostEntry {
			ca: Some(ca.to_owned()),
			skip_verify: None,
		}
	};
	let hosts = HostsToml {
		host: BTreeMap::from([(server.clone(), entry)]),
		server,
	};
	Ok(toml::to_string(&hosts)?)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cluster::{Cluster, ContainerRuntimeConfig, HostGroup, MASTER, NODE};
	use crate::container_runtime::ContainerRuntimeInstaller;
	use crate::testing::{FakeDistributor, FakeDriver};

	fn ip(last: u8) -> IpAddr {
		IpAddr::from([192, 168, 0, last])
	}

	fn cluster(masters: &[IpAddr], nodes: &[IpAddr]) -> Cluster {
		let mut cluster = Cluster::new("dev", "img");
		cluster.hosts = vec![
			HostGroup::new(masters.to_vec(), MASTER),
			HostGroup::new(nodes.to_vec(), NODE),
		];
		cluster
	}

	fn configurator(
		driver: &Arc<FakeDriver>,
		registry: Registry,
		deploy: &[IpAddr],
		kind: RuntimeKind,
	) -> Configurator {
		let runtime = ContainerRuntimeInstaller::new(
			ContainerRuntimeConfig {
				kind,
				..ContainerRuntimeConfig::default()
			},
			driver.clone(),
		)
		.info();
		Configurator::new(
			&registry,
			deploy.to_vec(),
			runtime,
			driver.clone(),
			Arc::new(FakeDistributor::default()),
			"/data/dev/registry".into(),
		)
	}

	fn ha_registry() -> LocalRegistry {
		LocalRegistry {
			ha: true,
			..LocalRegistry::default()
		}
	}

	#[tokio::test]
	async fn singleton_points_every_host_at_the_deploy_host() {
		let driver = Arc::new(FakeDriver::new(cluster(&[ip(1)], &[ip(2)])));
		let configurator = configurator(
			&driver,
			Registry::Local(LocalRegistry::default()),
			&[ip(1)],
			RuntimeKind::Containerd,
		);
		configurator.install_on(&[ip(1)], &[ip(2)]).await.unwrap();
		let alias = set_host_alias_cmd(LocalRegistry::DEFAULT_DOMAIN, &ip(1));
		assert_eq!(driver.commands(ip(2)), vec![alias]);
		assert_eq!(
			driver.copies(ip(2)),
			vec!["/etc/containerd/certs.d/fleet.hub:5000/fleet.hub.crt"]
		);
	}

	#[tokio::test]
	async fn ha_balances_workers_over_every_deploy_host() {
		let driver = Arc::new(FakeDriver::new(cluster(&[ip(1), ip(2)], &[ip(3)])));
		let configurator = configurator(
			&driver,
			Registry::Local(ha_registry()),
			&[ip(2), ip(1)],
			RuntimeKind::Containerd,
		);
		configurator.install_on(&[ip(1), ip(2)], &[ip(3)]).await.unwrap();
		assert_eq!(
			driver.commands(ip(1)),
			vec![set_host_alias_cmd("fleet.hub", &ip(1))]
		);
		let worker = driver.commands(ip(3));
		assert_eq!(
			worker[0],
			"lvscare care --vs 10.103.97.2:5000 --rs 192.168.0.1:5000 --rs 192.168.0.2:5000 \
			 --health-path / --health-schem https --run-once"
		);
		assert_eq!(worker[1], set_host_alias_cmd("fleet.hub", &IpAddr::from([10, 103, 97, 2])));
		let pod = driver
			.written(ip(3), "/etc/kubernetes/manifests/reg-lvscare.yaml")
			.unwrap();
		assert!(pod.contains("fleet.hub:5000/kubefleet/lvscare:v1.1.3"));
	}

	#[tokio::test]
	async fn departing_master_reprograms_remaining_workers() {
		let driver = Arc::new(FakeDriver::new(cluster(&[ip(1), ip(2)], &[ip(3), ip(4)])));
		let configurator = configurator(
			&driver,
			Registry::Local(ha_registry()),
			&[ip(1)],
			RuntimeKind::Containerd,
		);
		configurator.uninstall_from(&[ip(2)], &[ip(4)], &[]).await.unwrap();
		assert_eq!(
			driver.commands(ip(2)),
			vec!["rm -f /etc/kubernetes/manifests/reg-lvscare.yaml && sed -i '/#kubefleet:fleet.hub$/d' /etc/hosts"]
		);
		assert!(driver.hosts_running("lvscare care").contains(&ip(3)));
		assert!(!driver.hosts_running("lvscare care").contains(&ip(4)));
	}

	#[tokio::test]
	async fn custom_endpoint_gets_mirror_and_login() {
		let host = ip(1);
		let driver = Arc::new(FakeDriver::new(cluster(&[host], &[])));
		driver.reply("cat /etc/docker/daemon.json", r#"{"log-driver":"json-file"}"#);
		let mut registry = LocalRegistry::default();
		registry.config.domain = "hub.internal".into();
		registry.config.username = Some("admin".into());
		registry.config.password = Some("p@ss".into());
		let configurator = configurator(&driver, Registry::Local(registry), &[host], RuntimeKind::Docker);
		configurator.install_on(&[host], &[]).await.unwrap();

		let daemon: Value =
			serde_json::from_str(&driver.written(host, DOCKER_DAEMON_FILE).unwrap()).unwrap();
		assert_eq!(daemon["log-driver"], "json-file");
		assert_eq!(daemon["registry-mirrors"], json!(["https://hub.internal:5000"]));
		let commands = driver.commands(host);
		assert!(commands.contains(&"systemctl daemon-reload".to_owned()));
		assert!(commands.iter().any(|cmd| cmd.starts_with(
			"echo 'p@ss' | docker login --username 'admin' --password-stdin hub.internal:5000"
		)));

		let info = configurator.info().unwrap();
		assert!(!info.to_yaml().unwrap().contains("p@ss"));
	}

	#[test]
	fn mirror_merge_is_idempotent() {
		let once = with_registry_mirror("", "https://hub:5000").unwrap();
		let twice = with_registry_mirror(&once, "https://hub:5000").unwrap();
		assert_eq!(once, twice);
		assert!(with_registry_mirror("[]", "https://hub:5000").is_err());
	}

	#[test]
	fn containerd_hosts_file_trusts_the_registry_ca() {
		let secure = containerd_hosts_toml("hub:5000", false, "/etc/containerd/certs.d/hub:5000/hub.crt").unwrap();
		assert!(secure.contains("server = \"https://hub:5000\""));
		assert!(secure.contains("ca = \"/etc/containerd/certs.d/hub:5000/hub.crt\""));
		let insecure = containerd_hosts_toml("hub:5000", true, "unused").unwrap();
		assert!(insecure.contains("server = \"http://hub:5000\""));
		assert!(insecure.contains("skip_verify = true"));
	}

	#[tokio::test]
	async fn external_registry_only_logs_in() {
		let host = ip(1);
		let driver = Arc::new(FakeDriver::new(cluster(&[host], &[])));
		let external = RegistryConfig {
			domain: "hub.example.com".into(),
			port: 443,
			username: None,
			password: None,
		};
		let configurator = configurator(&driver, Registry::External(external), &[], RuntimeKind::Containerd);
		configurator.install_on(&[host], &[]).await.unwrap();
		configurator.uninstall_from(&[host], &[], &[]).await.unwrap();
		assert!(driver.calls(host).is_empty());
		assert_eq!(configurator.driver().endpoint(), "hub.example.com:443");
		assert!(configurator.driver().deploy_hosts().is_empty());
	}
}

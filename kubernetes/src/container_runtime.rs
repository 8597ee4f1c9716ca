use crate::cluster::{ContainerRuntimeConfig, RuntimeKind};
use crate::error::Result;
use crate::infradriver::InfraDriver;
use kubefleet_infra::exec;
use serde::Serialize;
use std::{net::IpAddr, sync::Arc};
use tracing::info;

/// What the rest of the cluster needs to know about the installed engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
	pub kind: RuntimeKind,
	pub socket: String,
	pub certs_dir: String,
	/// Client credential file written by `login`.
	pub config_file: String,
	pub cgroup_driver: String,
	pub limit_nofile: u64,
}

impl RuntimeKind {
	pub const DOCKER_CERTS_DIR: &str = "/etc/docker/certs.d";
	pub const CONTAINERD_CERTS_DIR: &str = "/etc/containerd/certs.d";

	fn socket(self) -> &'static str {
		match self {
			RuntimeKind::Docker => "/var/run/cri-dockerd.sock",
			RuntimeKind::Containerd => "/run/containerd/containerd.sock",
		}
	}

	fn certs_dir(self) -> &'static str {
		match self {
			RuntimeKind::Docker => Self::DOCKER_CERTS_DIR,
			RuntimeKind::Containerd => Self::CONTAINERD_CERTS_DIR,
		}
	}

	/// CLI used for registry login on the host.
	pub fn client(self) -> &'static str {
		match self {
			RuntimeKind::Docker => "docker",
			RuntimeKind::Containerd => "nerdctl",
		}
	}
}

/// Installs the container engine with the scripts shipped in the rootfs.
pub struct ContainerRuntimeInstaller {
	config: ContainerRuntimeConfig,
	driver: Arc<dyn InfraDriver>,
}

impl ContainerRuntimeInstaller {
	pub fn new(config: ContainerRuntimeConfig, driver: Arc<dyn InfraDriver>) -> Self {
		Self { config, driver }
	}

	fn script_cmd(&self, script: &str) -> String {
		format!(
			"cd {}/scripts && bash {script} {} {}",
			self.driver.rootfs_path(),
			self.config.cgroup_driver,
			self.config.limit_nofile
		)
	}

	pub async fn install_on(&self, hosts: &[IpAddr]) -> Result<()> {
		info!("Installing {} on {} hosts.", self.config.kind, hosts.len());
		let cmd = self.script_cmd(&format!("{}.sh", self.config.kind));
		self.run(hosts, &cmd).await
	}

	pub async fn uninstall_from(&self, hosts: &[IpAddr]) -> Result<()> {
		info!("Removing {} from {} hosts.", self.config.kind, hosts.len());
		let cmd = self.script_cmd(&format!("uninstall-{}.sh", self.config.kind));
		self.run(hosts, &cmd).await
	}

	async fn run(&self, hosts: &[IpAddr], cmd: &str) -> Result<()> {
		exec::execute(hosts, |host| async move {
			self.driver.cmd_async(host, &self.driver.host_env(&host), cmd).await
		})
		.await?;
		Ok(())
	}

	pub fn info(&self) -> Info {
		let kind = self.config.kind;
		Info {
			kind,
			socket: kind.socket().to_owned(),
			certs_dir: kind.certs_dir().to_owned(),
			config_file: "/root/.docker/config.json".to_owned(),
			cgroup_driver: self.config.cgroup_driver.clone(),
			limit_nofile: self.config.limit_nofile,
		}
	}
}

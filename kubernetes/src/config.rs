use crate::cluster::{ContainerRuntimeConfig, KubeadmConfig, Plugin};
use crate::distributor::Distributor;
use std::{env, path::PathBuf, sync::Arc};

pub const DATA_DIR_ENV: &str = "KUBEFLEET_DATA_DIR";
pub const DEFAULT_DATA_DIR: &str = "/var/lib/kubefleet";

/// Behaviour switches for one operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallerOptions {
	/// Also remove locally generated registry certificates and credentials on delete.
	pub prune: bool,
	/// Skip unreachable hosts on delete instead of failing.
	pub force: bool,
}

/// Everything an Installer needs besides the cluster itself.
#[derive(Clone)]
pub struct RuntimeConfig {
	pub distributor: Arc<dyn Distributor>,
	pub plugins: Vec<Plugin>,
	pub container_runtime: ContainerRuntimeConfig,
	pub kubeadm: KubeadmConfig,
	pub options: InstallerOptions,
}

/// Local filesystem layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPaths {
	root: PathBuf,
	home: PathBuf,
}

impl ClusterPaths {
	pub fn new(root: PathBuf, home: PathBuf) -> Self {
		Self { root, home }
	}

	/// Reads `KUBEFLEET_DATA_DIR` and `HOME`.
	pub fn from_env() -> Self {
		let root = env::var_os(DATA_DIR_ENV)
			.map(PathBuf::from)
			.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
		let home = env::var_os("HOME")
			.map(PathBuf::from)
			.unwrap_or_else(|| PathBuf::from("/root"));
		Self::new(root, home)
	}

	pub fn cluster_dir(&self, cluster: &str) -> PathBuf {
		self.root.join(cluster)
	}

	pub fn clusterfile(&self, cluster: &str) -> PathBuf {
		self.cluster_dir(cluster).join("Clusterfile")
	}

	/// Locally generated registry files (certificates, htpasswd).
	pub fn registry_dir(&self, cluster: &str) -> PathBuf {
		self.cluster_dir(cluster).join("registry")
	}

	pub fn images_dir(&self) -> PathBuf {
		self.root.join("images")
	}

	pub fn mounts_dir(&self) -> PathBuf {
		self.root.join("mounts")
	}

	pub fn kubeconfig(&self) -> PathBuf {
		self.home.join(".kube").join("config")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn layout_hangs_off_the_data_root() {
		let paths = ClusterPaths::new("/data".into(), "/home/ops".into());
		assert_eq!(paths.clusterfile("dev"), PathBuf::from("/data/dev/Clusterfile"));
		assert_eq!(paths.registry_dir("dev"), PathBuf::from("/data/dev/registry"));
		assert_eq!(paths.kubeconfig(), PathBuf::from("/home/ops/.kube/config"));
	}
}

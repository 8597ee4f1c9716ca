use crate::error::{ClusterError, Result};
use crate::infradriver::{Env, InfraDriver};
use async_trait::async_trait;
use kubefleet_infra::{exec, quote};
use std::{
	fs,
	net::IpAddr,
	path::{Path, PathBuf},
	sync::Arc,
};
use tracing::{info, warn};

/// Pushes a mounted image's content to hosts.
#[async_trait]
pub trait Distributor: Send + Sync {
	/// Copies the image rootfs to `dest` on every host.
	async fn distribute(&self, hosts: &[IpAddr], dest: &str) -> Result<()>;

	/// Copies the image's registry data to `data_dir` on every host.
	async fn distribute_registry(&self, hosts: &[IpAddr], data_dir: &str) -> Result<()>;

	/// Removes `target_dir` from every host.
	async fn restore(&self, target_dir: &str, hosts: &[IpAddr]) -> Result<()>;
}

/// An unpacked cluster image made available on the local machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMount {
	pub image: String,
	pub path: PathBuf,
}

impl ImageMount {
	pub const REGISTRY_DIR: &str = "registry";

	pub fn registry_dir(&self) -> PathBuf {
		self.path.join(Self::REGISTRY_DIR)
	}
}

/// Exposes unpacked images stored under `images/` through links under `mounts/`.
#[derive(Debug, Clone)]
pub struct ImageMounter {
	images: PathBuf,
	mounts: PathBuf,
}

impl ImageMounter {
	pub fn new(images: PathBuf, mounts: PathBuf) -> Self {
		Self { images, mounts }
	}

	fn dir_name(image: &str) -> String {
		image.replace(['/', ':', '@'], "_")
	}

	pub fn mount(&self, image: &str) -> Result<ImageMount> {
		let source = self.images.join(Self::dir_name(image));
		if !is_rootfs(&source) {
			return Err(ClusterError::Config(format!(
				"image {image} is not available under {}",
				self.images.display()
			)));
		}
		fs::create_dir_all(&self.mounts)?;
		let path = self.mounts.join(Self::dir_name(image));
		if fs::symlink_metadata(&path).is_ok() {
			fs::remove_file(&path)?;
		}
		std::os::unix::fs::symlink(&source, &path)?;
		info!("Mounted image {image} at {}.", path.display());
		Ok(ImageMount {
			image: image.to_owned(),
			path,
		})
	}

	/// Best effort: a failure is logged and never fails the caller.
	pub fn umount(&self, mount: &ImageMount) {
		if let Err(err) = fs::remove_file(&mount.path) {
			warn!("Failed to unmount image {}: {err}", mount.image);
		}
	}
}

/// Copies image content host by host over the InfraDriver.
pub struct ScpDistributor {
	mount: ImageMount,
	driver: Arc<dyn InfraDriver>,
}

impl ScpDistributor {
	pub fn new(mount: ImageMount, driver: Arc<dyn InfraDriver>) -> Self {
		Self { mount, driver }
	}

	fn rootfs_entries(&self) -> Result<Vec<PathBuf>> {
		let mut entries = Vec::new();
		for entry in fs::read_dir(&self.mount.path)? {
			let entry = entry?;
			if entry.file_name() != ImageMount::REGISTRY_DIR {
				entries.push(entry.path());
			}
		}
		entries.sort();
		Ok(entries)
	}
}

#[async_trait]
impl Distributor for ScpDistributor {
	async fn distribute(&self, hosts: &[IpAddr], dest: &str) -> Result<()> {
		let entries = self.rootfs_entries()?;
		info!("Distributing {} to {} hosts.", self.mount.image, hosts.len());
		exec::execute(hosts, |host| {
			let entries = &entries;
			async move {
				for entry in entries {
					let Some(name) = entry.file_name() else {
						continue;
					};
					let remote = format!("{dest}/{}", name.to_string_lossy());
					self.driver.copy(host, entry, &remote).await?;
				}
				Ok::<_, ClusterError>(())
			}
		})
		.await?;
		Ok(())
	}

	async fn distribute_registry(&self, hosts: &[IpAddr], data_dir: &str) -> Result<()> {
		let source = self.mount.registry_dir();
		if !source.is_dir() {
			info!("Image {} carries no registry data.", self.mount.image);
			return Ok(());
		}
		exec::execute(hosts, |host| {
			let source = &source;
			async move { self.driver.copy(host, source, data_dir).await }
		})
		.await?;
		Ok(())
	}

	async fn restore(&self, target_dir: &str, hosts: &[IpAddr]) -> Result<()> {
		let cmd = format!("rm -rf {}", quote(target_dir));
		exec::execute(hosts, |host| {
			let cmd = &cmd;
			async move { self.driver.cmd_async(host, &Env::new(), cmd).await }
		})
		.await?;
		Ok(())
	}
}

/// A directory is a usable rootfs when it has a `scripts` folder.
fn is_rootfs(path: &Path) -> bool {
	path.join("scripts").is_dir()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cluster::{Cluster, HostGroup, MASTER};
	use crate::testing::FakeDriver;

	fn image_tree() -> (tempfile::TempDir, ImageMounter) {
		let dir = tempfile::tempdir().unwrap();
		let image = dir.path().join("images").join("kubernetes_v1.30.1");
		fs::create_dir_all(image.join("scripts")).unwrap();
		fs::create_dir_all(image.join("registry/docker")).unwrap();
		fs::write(image.join("scripts/init-kube.sh"), "#!/bin/bash\n").unwrap();
		fs::write(image.join("registry/docker/blob"), "data").unwrap();
		let mounter = ImageMounter::new(dir.path().join("images"), dir.path().join("mounts"));
		(dir, mounter)
	}

	#[test]
	fn mount_links_the_unpacked_image() {
		let (_dir, mounter) = image_tree();
		let mount = mounter.mount("kubernetes:v1.30.1").unwrap();
		assert!(is_rootfs(&mount.path));
		mounter.umount(&mount);
		assert!(!mount.path.exists());
		assert!(mounter.mount("missing:v1").is_err());
	}

	#[tokio::test]
	async fn rootfs_excludes_registry_data() {
		let (_dir, mounter) = image_tree();
		let mount = mounter.mount("kubernetes:v1.30.1").unwrap();
		let host = IpAddr::from([10, 0, 0, 1]);
		let mut cluster = Cluster::new("dev", "kubernetes:v1.30.1");
		cluster.hosts.push(HostGroup::new(vec![host], MASTER));
		let driver = Arc::new(FakeDriver::new(cluster));
		let distributor = ScpDistributor::new(mount, driver.clone());
		distributor.distribute(&[host], "/opt/rootfs").await.unwrap();
		distributor.distribute_registry(&[host], "/opt/registry").await.unwrap();
		assert_eq!(driver.copies(host), vec!["/opt/rootfs/scripts", "/opt/registry"]);
	}
}

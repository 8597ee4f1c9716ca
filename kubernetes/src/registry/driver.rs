use crate::distributor::Distributor;
use crate::error::Result;
use std::{fmt, net::IpAddr, sync::Arc};
use tracing::info;

#[derive(Clone)]
struct LocalStore {
	data_dir: String,
	deploy_hosts: Vec<IpAddr>,
	distributor: Arc<dyn Distributor>,
}

/// Handle on the registry the cluster pulls from.
#[derive(Clone)]
pub struct RegistryDriver {
	endpoint: String,
	local: Option<LocalStore>,
}

impl fmt::Debug for RegistryDriver {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RegistryDriver")
			.field("endpoint", &self.endpoint)
			.field("data_dir", &self.data_dir())
			.field("deploy_hosts", &self.deploy_hosts())
			.finish()
	}
}

impl RegistryDriver {
	pub fn local(
		endpoint: String,
		data_dir: String,
		deploy_hosts: Vec<IpAddr>,
		distributor: Arc<dyn Distributor>,
	) -> Self {
		Self {
			endpoint,
			local: Some(LocalStore {
				data_dir,
				deploy_hosts,
				distributor,
			}),
		}
	}

	pub fn external(endpoint: String) -> Self {
		Self { endpoint, local: None }
	}

	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}

	pub fn deploy_hosts(&self) -> &[IpAddr] {
		self.local.as_ref().map_or(&[][..], |local| local.deploy_hosts.as_slice())
	}

	pub fn data_dir(&self) -> Option<&str> {
		self.local.as_ref().map(|local| local.data_dir.as_str())
	}

	/// Pushes the mounted image's registry content to every deploy host.
	///
	/// External registries are filled by their owner, so this is a no-op for them.
	pub async fn upload_container_images(&self) -> Result<()> {
		let Some(local) = &self.local else {
			info!("Skipping image upload to external registry {}.", self.endpoint);
			return Ok(());
		};
		info!("Uploading container images to {}.", self.endpoint);
		local
			.distributor
			.distribute_registry(&local.deploy_hosts, &local.data_dir)
			.await
	}
}

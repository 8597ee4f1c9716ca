//! Private image registry: where it runs, how nodes reach it, what it serves.

mod configurator;
mod driver;
mod installer;

pub use configurator::Configurator;
pub use driver::RegistryDriver;
pub use installer::{CONTAINER_NAME, LocalInstaller, cert_paths};

use crate::cluster::{LocalRegistry, RegistryConfig};
use crate::error::{ClusterError, Result};
use crate::infradriver::InfraDriver;
use crate::ipvs;
use serde::Serialize;
use std::net::IpAddr;

pub const VIP_ENV: &str = "RegistryVIP";
pub const VIP_V6_ENV: &str = "RegistryVIPv6";

/// Virtual IP fronting an HA registry.
///
/// IPv6 clusters get the IPv6 default. Either cluster env key overrides the
/// default, the IPv6 key winning when both are set.
pub fn registry_vip(driver: &dyn InfraDriver) -> Result<IpAddr> {
	let mut vip = ipvs::default_vip(&driver.host_ips());
	let env = driver.cluster_env();
	for key in [VIP_ENV, VIP_V6_ENV] {
		if let Some(value) = env.get(key) {
			vip = value
				.parse()
				.map_err(|_| ClusterError::Config(format!("{key} is not an IP address: {value}")))?;
		}
	}
	Ok(vip)
}

/// Registry description published into the cluster. Credentials are left out.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum RegistryInfo {
	Local {
		#[serde(flatten)]
		registry: LocalRegistry,
		#[serde(skip_serializing_if = "Option::is_none")]
		vip: Option<IpAddr>,
	},
	External(RegistryConfig),
}

impl RegistryInfo {
	pub fn to_yaml(&self) -> Result<String> {
		Ok(serde_yaml::to_string(self)?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cluster::{Cluster, HostGroup, MASTER};
	use crate::testing::FakeDriver;

	fn driver(first: IpAddr) -> FakeDriver {
		let mut cluster = Cluster::new("dev", "img");
		cluster.hosts.push(HostGroup::new(vec![first], MASTER));
		FakeDriver::new(cluster)
	}

	#[test]
	fn vip_follows_address_family_and_env() {
		let v4 = driver(IpAddr::from([10, 0, 0, 1]));
		assert_eq!(registry_vip(&v4).unwrap(), IpAddr::V4(ipvs::DEFAULT_VIP));
		let v6 = driver("fd00::1".parse().unwrap());
		assert_eq!(
			registry_vip(&v6).unwrap().to_string(),
			"1248:4003:10bb:6a01:83b9:6360:c66d:2"
		);

		let mut cluster = Cluster::new("dev", "img");
		cluster.hosts.push(HostGroup::new(vec![IpAddr::from([10, 0, 0, 1])], MASTER));
		cluster.env.insert(VIP_ENV.into(), "10.10.10.10".into());
		assert_eq!(
			registry_vip(&FakeDriver::new(cluster.clone())).unwrap(),
			IpAddr::from([10, 10, 10, 10])
		);
		cluster.env.insert(VIP_ENV.into(), "not-an-ip".into());
		assert!(registry_vip(&FakeDriver::new(cluster)).is_err());
	}

	#[test]
	fn info_is_tagged_yaml() {
		let info = RegistryInfo::Local {
			registry: LocalRegistry::default(),
			vip: None,
		};
		let yaml = info.to_yaml().unwrap();
		assert!(yaml.contains("type: local"));
		assert!(yaml.contains("domain: fleet.hub"));
		assert!(!yaml.contains("vip"));
	}
}

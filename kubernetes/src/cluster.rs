//! Desired cluster state as declared in the Clusterfile.

use crate::error::{ClusterError, Result};
use crate::hooks::Phase;
use kubefleet_infra::{SshAuth, hosts};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, net::IpAddr, path::PathBuf, str::FromStr};
use tracing::warn;

pub const MASTER: &str = "master";
pub const NODE: &str = "node";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
	pub name: String,
	pub image: String,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub env: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub cmds: Vec<String>,
	#[serde(default)]
	pub ssh: SshConfig,
	pub hosts: Vec<HostGroup>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub host_aliases: Vec<HostAlias>,
	#[serde(default)]
	pub registry: Registry,
	#[serde(default)]
	pub container_runtime: ContainerRuntimeConfig,
	#[serde(default)]
	pub kubeadm: KubeadmConfig,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub plugins: Vec<Plugin>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostGroup {
	pub ips: Vec<IpAddr>,
	pub roles: Vec<String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub env: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub labels: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub taints: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ssh: Option<SshConfig>,
}

impl HostGroup {
	pub fn new(ips: Vec<IpAddr>, role: &str) -> Self {
		Self {
			ips,
			roles: vec![role.to_owned()],
			..Self::default()
		}
	}

	pub fn has_role(&self, role: &str) -> bool {
		self.roles.iter().any(|r| r == role)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
	#[serde(default = "SshConfig::default_user")]
	pub user: String,
	#[serde(default = "SshConfig::default_port")]
	pub port: u16,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pk: Option<PathBuf>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub passwd: Option<String>,
}

impl SshConfig {
	fn default_user() -> String {
		"root".to_owned()
	}

	fn default_port() -> u16 {
		22
	}

	pub fn auth(&self) -> SshAuth {
		SshAuth {
			user: self.user.clone(),
			port: self.port,
			private_key: self.pk.clone(),
			password: self.passwd.clone(),
		}
	}
}

impl Default for SshConfig {
	fn default() -> Self {
		Self {
			user: Self::default_user(),
			port: Self::default_port(),
			pk: None,
			passwd: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostAlias {
	pub ip: IpAddr,
	pub hostnames: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
	pub domain: String,
	pub port: u16,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub username: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub password: Option<String>,
}

impl RegistryConfig {
	pub fn endpoint(&self) -> String {
		format!("{}:{}", self.domain, self.port)
	}

	/// Username and password, when both are set and non-empty.
	pub fn credentials(&self) -> Option<(&str, &str)> {
		match (self.username.as_deref(), self.password.as_deref()) {
			(Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRegistry {
	#[serde(flatten)]
	pub config: RegistryConfig,
	#[serde(default)]
	pub ha: bool,
	#[serde(default)]
	pub insecure: bool,
	#[serde(default)]
	pub cert: CertDescriptor,
	/// Registry storage on the deploy hosts. Defaults to `<rootfs>/registry`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data_dir: Option<String>,
	/// Hosts the registry currently runs on.
	#[serde(default)]
	pub deploy_hosts: Vec<IpAddr>,
}

impl LocalRegistry {
	pub const DEFAULT_DOMAIN: &str = "fleet.hub";
	pub const DEFAULT_PORT: u16 = 5000;

	pub fn data_dir(&self, rootfs: &str) -> String {
		self.data_dir
			.clone()
			.unwrap_or_else(|| format!("{rootfs}/registry"))
	}
}

impl Default for LocalRegistry {
	fn default() -> Self {
		Self {
			config: RegistryConfig {
				domain: Self::DEFAULT_DOMAIN.to_owned(),
				port: Self::DEFAULT_PORT,
				username: None,
				password: None,
			},
			ha: false,
			insecure: false,
			cert: CertDescriptor::default(),
			data_dir: None,
			deploy_hosts: Vec::new(),
		}
	}
}

/// Extra subject alternative names for the generated registry certificate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertDescriptor {
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub alt_ips: Vec<IpAddr>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub alt_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Registry {
	Local(LocalRegistry),
	External(RegistryConfig),
}

impl Default for Registry {
	fn default() -> Self {
		Registry::Local(LocalRegistry::default())
	}
}

impl Registry {
	pub fn config(&self) -> &RegistryConfig {
		match self {
			Registry::Local(local) => &local.config,
			Registry::External(config) => config,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
	Docker,
	#[default]
	Containerd,
}

impl fmt::Display for RuntimeKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			RuntimeKind::Docker => "docker",
			RuntimeKind::Containerd => "containerd",
		})
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRuntimeConfig {
	#[serde(rename = "type", default)]
	pub kind: RuntimeKind,
	#[serde(default = "ContainerRuntimeConfig::default_cgroup_driver")]
	pub cgroup_driver: String,
	#[serde(default = "ContainerRuntimeConfig::default_limit_nofile")]
	pub limit_nofile: u64,
}

impl ContainerRuntimeConfig {
	fn default_cgroup_driver() -> String {
		"systemd".to_owned()
	}

	fn default_limit_nofile() -> u64 {
		1_048_576
	}
}

impl Default for ContainerRuntimeConfig {
	fn default() -> Self {
		Self {
			kind: RuntimeKind::default(),
			cgroup_driver: Self::default_cgroup_driver(),
			limit_nofile: Self::default_limit_nofile(),
		}
	}
}

/// Overrides passed to kubeadm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeadmConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub kubernetes_version: Option<String>,
	pub pod_subnet: String,
	pub service_subnet: String,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub cert_sans: Vec<String>,
	pub vlog: u8,
}

impl Default for KubeadmConfig {
	fn default() -> Self {
		Self {
			kubernetes_version: None,
			pod_subnet: "100.64.0.0/10".to_owned(),
			service_subnet: "10.96.0.0/22".to_owned(),
			cert_sans: Vec::new(),
			vlog: 0,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plugin {
	pub name: String,
	pub phase: Phase,
	/// Roles the plugin is restricted to. Empty means every host.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub scope: Vec<String>,
	pub shell: String,
}

impl Cluster {
	pub fn new(name: &str, image: &str) -> Self {
		Self {
			name: name.to_owned(),
			image: image.to_owned(),
			env: BTreeMap::new(),
			cmds: Vec::new(),
			ssh: SshConfig::default(),
			hosts: Vec::new(),
			host_aliases: Vec::new(),
			registry: Registry::default(),
			container_runtime: ContainerRuntimeConfig::default(),
			kubeadm: KubeadmConfig::default(),
			plugins: Vec::new(),
		}
	}

	pub fn validate(&self) -> Result<()> {
		if self.name.is_empty() {
			return Err(ClusterError::Config("cluster name is empty".into()));
		}
		if self.masters().is_empty() {
			return Err(ClusterError::Config("no master host declared".into()));
		}
		let mut seen = Vec::new();
		for ip in self.hosts.iter().flat_map(|g| &g.ips) {
			if hosts::contains(&seen, ip) {
				return Err(ClusterError::Config(format!("host {ip} is declared twice")));
			}
			seen.push(*ip);
		}
		Ok(())
	}

	/// Addresses holding `role`, in declaration order.
	pub fn hosts_by_role(&self, role: &str) -> Vec<IpAddr> {
		let ips: Vec<IpAddr> = self
			.hosts
			.iter()
			.filter(|g| g.has_role(role))
			.flat_map(|g| g.ips.iter().copied())
			.collect();
		hosts::union(&ips, &[])
	}

	pub fn masters(&self) -> Vec<IpAddr> {
		self.hosts_by_role(MASTER)
	}

	/// Non-master hosts.
	pub fn workers(&self) -> Vec<IpAddr> {
		hosts::remove(&self.all_hosts(), &self.masters())
	}

	pub fn all_hosts(&self) -> Vec<IpAddr> {
		let ips: Vec<IpAddr> = self.hosts.iter().flat_map(|g| g.ips.iter().copied()).collect();
		hosts::union(&self.masters(), &ips)
	}

	pub fn master0(&self) -> Result<IpAddr> {
		self.masters()
			.first()
			.copied()
			.ok_or_else(|| ClusterError::Config("no master host declared".into()))
	}

	fn group_of(&self, ip: &IpAddr) -> Option<&HostGroup> {
		self.hosts.iter().find(|g| hosts::contains(&g.ips, ip))
	}

	pub fn roles_of(&self, ip: &IpAddr) -> Vec<String> {
		self.group_of(ip).map(|g| g.roles.clone()).unwrap_or_default()
	}

	/// Cluster env overlaid with the host group's env.
	pub fn env_of(&self, ip: &IpAddr) -> BTreeMap<String, String> {
		let mut env = self.env.clone();
		if let Some(group) = self.group_of(ip) {
			env.extend(group.env.clone());
		}
		env
	}

	pub fn labels_of(&self, ip: &IpAddr) -> BTreeMap<String, String> {
		self.group_of(ip).map(|g| g.labels.clone()).unwrap_or_default()
	}

	pub fn taints_of(&self, ip: &IpAddr) -> Result<Vec<Taint>> {
		self.group_of(ip)
			.map(|g| g.taints.iter().map(|t| t.parse::<Taint>()).collect())
			.unwrap_or_else(|| Ok(Vec::new()))
	}

	pub fn ssh_of(&self, ip: &IpAddr) -> SshAuth {
		self.group_of(ip)
			.and_then(|g| g.ssh.as_ref())
			.unwrap_or(&self.ssh)
			.auth()
	}

	pub fn local_registry(&self) -> Option<&LocalRegistry> {
		match &self.registry {
			Registry::Local(local) => Some(local),
			Registry::External(_) => None,
		}
	}

	pub fn local_registry_mut(&mut self) -> Option<&mut LocalRegistry> {
		match &mut self.registry {
			Registry::Local(local) => Some(local),
			Registry::External(_) => None,
		}
	}

	/// Appends the joining hosts as new host groups.
	///
	/// Hosts that are already members are skipped. Returns the masters and nodes
	/// that actually join.
	pub fn construct_for_scale_up(
		&mut self,
		masters: &[IpAddr],
		nodes: &[IpAddr],
	) -> (Vec<IpAddr>, Vec<IpAddr>) {
		let present = self.all_hosts();
		let requested = hosts::union(masters, nodes);
		let skipped: Vec<IpAddr> = requested
			.into_iter()
			.filter(|ip| hosts::contains(&present, ip))
			.collect();
		if !skipped.is_empty() {
			warn!("Skipping hosts already in cluster {}: {skipped:?}.", self.name);
		}
		let masters = hosts::remove(&hosts::union(masters, &[]), &present);
		if !masters.is_empty() {
			self.hosts.push(HostGroup::new(masters.clone(), MASTER));
		}
		let nodes = hosts::remove(&hosts::remove(&hosts::union(nodes, &[]), &present), &masters);
		if !nodes.is_empty() {
			self.hosts.push(HostGroup::new(nodes.clone(), NODE));
		}
		(masters, nodes)
	}

	/// Removes the departing hosts from their groups and drops emptied groups.
	pub fn construct_for_scale_down(&mut self, masters: &[IpAddr], nodes: &[IpAddr]) -> Result<()> {
		let current_masters = self.masters();
		let current_workers = self.workers();
		if let Some(ip) = masters.iter().find(|ip| !hosts::contains(&current_masters, ip)) {
			return Err(ClusterError::Config(format!("{ip} is not a master of this cluster")));
		}
		if let Some(ip) = nodes.iter().find(|ip| !hosts::contains(&current_workers, ip)) {
			return Err(ClusterError::Config(format!("{ip} is not a node of this cluster")));
		}
		if hosts::remove(&current_masters, masters).is_empty() {
			return Err(ClusterError::Config(
				"removing every master requires deleting the whole cluster".into(),
			));
		}
		for group in &mut self.hosts {
			if group.has_role(MASTER) {
				group.ips = hosts::remove(&group.ips, masters);
			} else {
				group.ips = hosts::remove(&group.ips, nodes);
			}
		}
		self.hosts.retain(|g| !g.ips.is_empty());
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaintEffect {
	NoSchedule,
	PreferNoSchedule,
	NoExecute,
}

impl FromStr for TaintEffect {
	type Err = ClusterError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"NoSchedule" => Ok(TaintEffect::NoSchedule),
			"PreferNoSchedule" => Ok(TaintEffect::PreferNoSchedule),
			"NoExecute" => Ok(TaintEffect::NoExecute),
			other => Err(ClusterError::Config(format!("unknown taint effect '{other}'"))),
		}
	}
}

impl fmt::Display for TaintEffect {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			TaintEffect::NoSchedule => "NoSchedule",
			TaintEffect::PreferNoSchedule => "PreferNoSchedule",
			TaintEffect::NoExecute => "NoExecute",
		})
	}
}

/// A node taint, or the removal of one when `remove` is set.
///
/// Accepted forms: `key=value:Effect`, `key:Effect`, `key=:Effect`, `key-`
/// and `key:Effect-`. The `Display` form is what `kubectl taint` expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Taint {
	pub key: String,
	pub value: Option<String>,
	pub effect: Option<TaintEffect>,
	pub remove: bool,
}

impl FromStr for Taint {
	type Err = ClusterError;

	fn from_str(s: &str) -> Result<Self> {
		let invalid = || ClusterError::Config(format!("invalid taint '{s}'"));
		let (body, remove) = match s.strip_suffix('-') {
			Some(body) => (body, true),
			None => (s, false),
		};
		let (head, effect) = match body.rsplit_once(':') {
			Some((head, effect)) => (head, Some(effect.parse::<TaintEffect>()?)),
			None if remove => (body, None),
			None => return Err(invalid()),
		};
		let (key, value) = match head.split_once('=') {
			Some((key, value)) => (key, Some(value.to_owned())),
			None => (head, None),
		};
		if key.is_empty() || key.contains(char::is_whitespace) {
			return Err(invalid());
		}
		Ok(Taint {
			key: key.to_owned(),
			value,
			effect,
			remove,
		})
	}
}

impl fmt::Display for Taint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.key)?;
		if let Some(value) = &self.value {
			write!(f, "={value}")?;
		}
		if let Some(effect) = &self.effect {
			write!(f, ":{effect}")?;
		}
		if self.remove {
			f.write_str("-")?;
		}
		Ok(())
	}
}

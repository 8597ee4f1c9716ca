use crate::cluster::{Cluster, MASTER, NODE, Taint};
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use kubefleet_infra::{Agent, InfraError, exec, hosts, quote};
use std::{
	collections::{BTreeMap, HashMap},
	future::Future,
	net::IpAddr,
	path::Path,
	sync::Arc,
	time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub type Env = BTreeMap<String, String>;

const HOST_ALIAS_MARKER: &str = "#kubefleet-host-alias";
const DATA_ROOT: &str = "/var/lib/kubefleet/data";

/// The only way the orchestrator reaches cluster hosts.
#[async_trait]
pub trait InfraDriver: Send + Sync {
	/// Desired state the driver was built from.
	fn cluster(&self) -> &Cluster;

	/// Runs `cmd` and fails unless it exits zero.
	async fn cmd_async(&self, host: IpAddr, env: &Env, cmd: &str) -> Result<()>;

	/// Runs `cmd` and returns its output.
	async fn cmd(&self, host: IpAddr, env: &Env, cmd: &str) -> Result<String>;

	/// Copies a local file or directory tree to `dst` on `host`.
	async fn copy(&self, host: IpAddr, src: &Path, dst: &str) -> Result<()>;

	async fn write(&self, host: IpAddr, contents: &[u8], dst: &str) -> Result<()>;

	async fn ping(&self, host: IpAddr) -> Result<()>;

	async fn is_file_exist(&self, host: IpAddr, path: &str) -> Result<bool> {
		let out = self
			.cmd(host, &Env::new(), &format!("test -e {} && echo yes || echo no", quote(path)))
			.await?;
		Ok(out.trim() == "yes")
	}

	fn host_ips(&self) -> Vec<IpAddr> {
		self.cluster().all_hosts()
	}

	fn host_ips_by_role(&self, role: &str) -> Vec<IpAddr> {
		match role {
			NODE => self.cluster().workers(),
			_ => self.cluster().hosts_by_role(role),
		}
	}

	fn masters(&self) -> Vec<IpAddr> {
		self.host_ips_by_role(MASTER)
	}

	fn workers(&self) -> Vec<IpAddr> {
		self.host_ips_by_role(NODE)
	}

	fn master0(&self) -> Result<IpAddr> {
		self.cluster().master0()
	}

	fn roles_of(&self, host: &IpAddr) -> Vec<String> {
		self.cluster().roles_of(host)
	}

	fn cluster_env(&self) -> Env {
		self.cluster().env.clone()
	}

	fn host_env(&self, host: &IpAddr) -> Env {
		self.cluster().env_of(host)
	}

	fn host_labels(&self, host: &IpAddr) -> BTreeMap<String, String> {
		self.cluster().labels_of(host)
	}

	fn host_taints(&self, host: &IpAddr) -> Result<Vec<Taint>> {
		self.cluster().taints_of(host)
	}

	fn cluster_name(&self) -> &str {
		&self.cluster().name
	}

	fn launch_cmds(&self) -> Vec<String> {
		self.cluster().cmds.clone()
	}

	/// Per-cluster directory on every host.
	fn base_path(&self) -> String {
		format!("{DATA_ROOT}/{}", self.cluster_name())
	}

	fn rootfs_path(&self) -> String {
		format!("{}/rootfs", self.base_path())
	}

	/// Writes the declared host aliases into `/etc/hosts` on `targets`.
	async fn set_host_aliases(&self, targets: &[IpAddr]) -> Result<()> {
		let aliases = &self.cluster().host_aliases;
		if aliases.is_empty() {
			return Ok(());
		}
		let mut script = remove_marked_lines(HOST_ALIAS_MARKER);
		for alias in aliases {
			let line = format!("{} {} {HOST_ALIAS_MARKER}", alias.ip, alias.hostnames.join(" "));
			script.push_str(&format!(" && echo {} >> /etc/hosts", quote(&line)));
		}
		info!("Setting host aliases on {} hosts.", targets.len());
		exec::execute(targets, |host| {
			let script = script.clone();
			async move { self.cmd_async(host, &Env::new(), &script).await }
		})
		.await?;
		Ok(())
	}

	async fn delete_host_aliases(&self, targets: &[IpAddr]) -> Result<()> {
		if self.cluster().host_aliases.is_empty() {
			return Ok(());
		}
		let script = remove_marked_lines(HOST_ALIAS_MARKER);
		exec::execute(targets, |host| {
			let script = script.clone();
			async move { self.cmd_async(host, &Env::new(), &script).await }
		})
		.await?;
		Ok(())
	}
}

fn remove_marked_lines(marker: &str) -> String {
	format!("sed -i {} /etc/hosts", quote(&format!("/{marker}$/d")))
}

/// Idempotently maps `domain` to `ip` in `/etc/hosts`.
pub fn set_host_alias_cmd(domain: &str, ip: &IpAddr) -> String {
	let marker = format!("#kubefleet:{domain}");
	format!(
		"{} && echo {} >> /etc/hosts",
		remove_marked_lines(&marker),
		quote(&format!("{ip} {domain} {marker}"))
	)
}

pub fn unset_host_alias_cmd(domain: &str) -> String {
	remove_marked_lines(&format!("#kubefleet:{domain}"))
}

fn is_env_name(key: &str) -> bool {
	let mut chars = key.chars();
	chars
		.next()
		.is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
		&& chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn with_env(env: &Env, cmd: &str) -> Result<String> {
	if env.is_empty() {
		return Ok(cmd.to_owned());
	}
	let mut exports = Vec::with_capacity(env.len());
	for (key, value) in env {
		if !is_env_name(key) {
			return Err(ClusterError::Config(format!("'{key}' is not a valid environment variable name")));
		}
		exports.push(format!("export {key}={};", quote(value)));
	}
	Ok(format!("{} {cmd}", exports.join(" ")))
}

/// Returns the cached session for `host`, connecting without holding the cache lock.
async fn cached_or_connect<T, F, Fut>(
	cache: &Mutex<HashMap<IpAddr, Arc<T>>>,
	host: IpAddr,
	connect: F,
) -> Result<Arc<T>>
where
	F: FnOnce() -> Fut,
	Fut: Future<Output = Result<T>>,
{
	if let Some(found) = cache.lock().await.get(&host) {
		return Ok(found.clone());
	}
	let fresh = Arc::new(connect().await?);
	// a concurrent caller may have connected first
	Ok(cache.lock().await.entry(host).or_insert(fresh).clone())
}

/// Pings every host with bounded retries and returns the ones that never answered.
pub async fn check_ssh(driver: &dyn InfraDriver, targets: &[IpAddr]) -> (Vec<IpAddr>, Result<()>) {
	const ATTEMPTS: u32 = 10;
	const STEP: Duration = Duration::from_secs(1);
	let result = exec::execute(targets, |host| async move {
		exec::wait_ready(host, ATTEMPTS, STEP, || async move { driver.ping(host).await }).await
	})
	.await;
	match result {
		Ok(()) => (Vec::new(), Ok(())),
		Err(err) => (err.failed_hosts(), Err(err.into())),
	}
}

/// InfraDriver over one cached SSH session per host.
pub struct SshInfraDriver {
	cluster: Cluster,
	agents: Mutex<HashMap<IpAddr, Arc<Agent>>>,
}

impl SshInfraDriver {
	pub fn new(cluster: Cluster) -> Result<Self> {
		cluster.validate()?;
		Ok(Self {
			cluster,
			agents: Mutex::new(HashMap::new()),
		})
	}

	async fn agent(&self, host: IpAddr) -> Result<Arc<Agent>> {
		if !hosts::contains(&self.cluster.all_hosts(), &host) {
			return Err(InfraError::UnknownHost(host).into());
		}
		let auth = self.cluster.ssh_of(&host);
		cached_or_connect(&self.agents, host, || async move {
			Agent::connect(host, &auth).await.map_err(ClusterError::from)
		})
		.await
	}

	async fn run(&self, host: IpAddr, env: &Env, cmd: &str) -> Result<String> {
		let agent = self.agent(host).await?;
		let output = agent.execute(&with_env(env, cmd)?).await?;
		let text = String::from_utf8_lossy(&output.stdout).into_owned();
		if output.code != 0 {
			return Err(InfraError::CommandFailed {
				host,
				cmd: cmd.to_owned(),
				code: output.code,
				output: text.trim().to_owned(),
			}
			.into());
		}
		Ok(text)
	}

	pub async fn close(&self) {
		let mut agents = self.agents.lock().await;
		for (host, agent) in agents.drain() {
			if let Err(err) = agent.close().await {
				warn!(%host, "Failed to close SSH session: {err}");
			}
		}
	}
}

#[async_trait]
impl InfraDriver for SshInfraDriver {
	fn cluster(&self) -> &Cluster {
		&self.cluster
	}

	async fn cmd_async(&self, host: IpAddr, env: &Env, cmd: &str) -> Result<()> {
		self.run(host, env, cmd).await.map(|_| ())
	}

	async fn cmd(&self, host: IpAddr, env: &Env, cmd: &str) -> Result<String> {
		self.run(host, env, cmd).await
	}

	async fn copy(&self, host: IpAddr, src: &Path, dst: &str) -> Result<()> {
		let agent = self.agent(host).await?;
		let mut pending = vec![(src.to_path_buf(), dst.to_owned())];
		while let Some((local, remote)) = pending.pop() {
			if local.is_dir() {
				for entry in std::fs::read_dir(&local)? {
					let entry = entry?;
					let name = entry.file_name().to_string_lossy().into_owned();
					pending.push((entry.path(), format!("{remote}/{name}")));
				}
				continue;
			}
			debug!(%host, "copy {} -> {remote}", local.display());
			agent.upload_file(&local, &remote).await?;
		}
		Ok(())
	}

	async fn write(&self, host: IpAddr, contents: &[u8], dst: &str) -> Result<()> {
		self.agent(host).await?.upload(contents, dst).await?;
		Ok(())
	}

	async fn ping(&self, host: IpAddr) -> Result<()> {
		let agent = self.agent(host).await?;
		if let Err(err) = agent.execute("true").await {
			// stale session, reconnect on the next attempt
			self.agents.lock().await.remove(&host);
			return Err(err.into());
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn env_is_exported_before_the_command() {
		let mut env = Env::new();
		env.insert("A".into(), "1 2".into());
		assert_eq!(with_env(&env, "echo $A").unwrap(), "export A='1 2'; echo $A");
		assert_eq!(with_env(&Env::new(), "true").unwrap(), "true");
	}

	#[test]
	fn env_names_must_be_shell_identifiers() {
		for key in ["A", "_x", "PATH_2"] {
			assert!(is_env_name(key), "{key}");
		}
		for key in ["", "2A", "A-B", "A;rm -rf /", "A B"] {
			let env = Env::from([(key.to_owned(), "1".to_owned())]);
			assert!(matches!(with_env(&env, "true"), Err(ClusterError::Config(_))), "{key}");
		}
	}

	#[tokio::test]
	async fn slow_connect_does_not_block_other_hosts() {
		let cache = Mutex::new(HashMap::new());
		let slow = cached_or_connect(&cache, IpAddr::from([10, 0, 0, 1]), || {
			std::future::pending::<Result<u8>>()
		});
		tokio::pin!(slow);
		assert!(futures::poll!(slow.as_mut()).is_pending());
		let fast = cached_or_connect(&cache, IpAddr::from([10, 0, 0, 2]), || async { Ok(7u8) });
		let agent = tokio::time::timeout(Duration::from_secs(1), fast).await.unwrap().unwrap();
		assert_eq!(*agent, 7);
		let cached = cached_or_connect(&cache, IpAddr::from([10, 0, 0, 2]), || async { Ok(0u8) })
			.await
			.unwrap();
		assert_eq!(*cached, 7);
	}

	#[test]
	fn host_alias_command_replaces_previous_entry() {
		let cmd = set_host_alias_cmd("fleet.hub", &IpAddr::from([10, 0, 0, 1]));
		assert_eq!(
			cmd,
			"sed -i '/#kubefleet:fleet.hub$/d' /etc/hosts && echo '10.0.0.1 fleet.hub #kubefleet:fleet.hub' >> /etc/hosts"
		);
	}
}

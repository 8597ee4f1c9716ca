//! In-memory InfraDriver and Distributor that record what they were asked to do.

use crate::cluster::Cluster;
use crate::distributor::Distributor;
use crate::error::Result;
use crate::infradriver::{Env, InfraDriver};
use async_trait::async_trait;
use kubefleet_infra::InfraError;
use std::{
	collections::{HashMap, HashSet},
	net::IpAddr,
	path::Path,
	sync::Mutex,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
	Cmd(String),
	Copy(String),
	Write(String),
}

#[derive(Default)]
struct State {
	calls: HashMap<IpAddr, Vec<Call>>,
	written: HashMap<(IpAddr, String), Vec<u8>>,
	files: HashSet<(IpAddr, String)>,
	failing: HashSet<IpAddr>,
	unreachable: HashSet<IpAddr>,
	replies: Vec<(String, String)>,
}

pub struct FakeDriver {
	cluster: Cluster,
	state: Mutex<State>,
}

impl FakeDriver {
	pub fn new(cluster: Cluster) -> Self {
		Self {
			cluster,
			state: Mutex::new(State::default()),
		}
	}

	/// Every command run on `host` fails from now on.
	pub fn fail_on(&self, host: IpAddr) {
		self.state.lock().unwrap().failing.insert(host);
	}

	/// `host` never answers a ping and every command on it fails.
	pub fn unreachable(&self, host: IpAddr) {
		let mut state = self.state.lock().unwrap();
		state.unreachable.insert(host);
		state.failing.insert(host);
	}

	/// Commands containing `needle` print `output`.
	pub fn reply(&self, needle: &str, output: &str) {
		self.state
			.lock()
			.unwrap()
			.replies
			.push((needle.to_owned(), output.to_owned()));
	}

	pub fn add_file(&self, host: IpAddr, path: &str) {
		self.state.lock().unwrap().files.insert((host, path.to_owned()));
	}

	pub fn calls(&self, host: IpAddr) -> Vec<Call> {
		self.state
			.lock()
			.unwrap()
			.calls
			.get(&host)
			.cloned()
			.unwrap_or_default()
	}

	pub fn commands(&self, host: IpAddr) -> Vec<String> {
		self.calls(host)
			.into_iter()
			.filter_map(|call| match call {
				Call::Cmd(cmd) => Some(cmd),
				_ => None,
			})
			.collect()
	}

	pub fn copies(&self, host: IpAddr) -> Vec<String> {
		self.calls(host)
			.into_iter()
			.filter_map(|call| match call {
				Call::Copy(dst) => Some(dst),
				_ => None,
			})
			.collect()
	}

	pub fn written(&self, host: IpAddr, dst: &str) -> Option<String> {
		self.state
			.lock()
			.unwrap()
			.written
			.get(&(host, dst.to_owned()))
			.map(|bytes| String::from_utf8_lossy(bytes).into_owned())
	}

	/// Hosts that saw any command containing `needle`.
	pub fn hosts_running(&self, needle: &str) -> Vec<IpAddr> {
		let mut hosts: Vec<IpAddr> = self
			.state
			.lock()
			.unwrap()
			.calls
			.iter()
			.filter(|(_, calls)| {
				calls
					.iter()
					.any(|call| matches!(call, Call::Cmd(cmd) if cmd.contains(needle)))
			})
			.map(|(host, _)| *host)
			.collect();
		hosts.sort();
		hosts
	}

	fn record(&self, host: IpAddr, call: Call) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		let cmd = match &call {
			Call::Cmd(cmd) | Call::Copy(cmd) | Call::Write(cmd) => cmd.clone(),
		};
		state.calls.entry(host).or_default().push(call);
		if state.failing.contains(&host) {
			return Err(InfraError::CommandFailed {
				host,
				cmd,
				code: 1,
				output: "injected failure".into(),
			}
			.into());
		}
		Ok(())
	}
}

#[async_trait]
impl InfraDriver for FakeDriver {
	fn cluster(&self) -> &Cluster {
		&self.cluster
	}

	async fn cmd_async(&self, host: IpAddr, _env: &Env, cmd: &str) -> Result<()> {
		self.record(host, Call::Cmd(cmd.to_owned()))
	}

	async fn cmd(&self, host: IpAddr, _env: &Env, cmd: &str) -> Result<String> {
		self.record(host, Call::Cmd(cmd.to_owned()))?;
		let state = self.state.lock().unwrap();
		Ok(state
			.replies
			.iter()
			.find(|(needle, _)| cmd.contains(needle.as_str()))
			.map(|(_, output)| output.clone())
			.unwrap_or_default())
	}

	async fn copy(&self, host: IpAddr, _src: &Path, dst: &str) -> Result<()> {
		self.record(host, Call::Copy(dst.to_owned()))
	}

	async fn write(&self, host: IpAddr, contents: &[u8], dst: &str) -> Result<()> {
		self.record(host, Call::Write(dst.to_owned()))?;
		self.state
			.lock()
			.unwrap()
			.written
			.insert((host, dst.to_owned()), contents.to_vec());
		Ok(())
	}

	async fn ping(&self, host: IpAddr) -> Result<()> {
		if self.state.lock().unwrap().unreachable.contains(&host) {
			return Err(InfraError::UnknownHost(host).into());
		}
		Ok(())
	}

	async fn is_file_exist(&self, host: IpAddr, path: &str) -> Result<bool> {
		Ok(self
			.state
			.lock()
			.unwrap()
			.files
			.contains(&(host, path.to_owned())))
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributorCall {
	Distribute(Vec<IpAddr>, String),
	Registry(Vec<IpAddr>, String),
	Restore(String, Vec<IpAddr>),
}

#[derive(Default)]
pub struct FakeDistributor {
	calls: Mutex<Vec<DistributorCall>>,
}

impl FakeDistributor {
	pub fn calls(&self) -> Vec<DistributorCall> {
		self.calls.lock().unwrap().clone()
	}
}

#[async_trait]
impl Distributor for FakeDistributor {
	async fn distribute(&self, hosts: &[IpAddr], dest: &str) -> Result<()> {
		self.calls
			.lock()
			.unwrap()
			.push(DistributorCall::Distribute(hosts.to_vec(), dest.to_owned()));
		Ok(())
	}

	async fn distribute_registry(&self, hosts: &[IpAddr], data_dir: &str) -> Result<()> {
		self.calls
			.lock()
			.unwrap()
			.push(DistributorCall::Registry(hosts.to_vec(), data_dir.to_owned()));
		Ok(())
	}

	async fn restore(&self, target_dir: &str, hosts: &[IpAddr]) -> Result<()> {
		self.calls
			.lock()
			.unwrap()
			.push(DistributorCall::Restore(target_dir.to_owned(), hosts.to_vec()));
		Ok(())
	}
}

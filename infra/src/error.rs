use std::{io, net::IpAddr, time::Duration};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
	#[error("I/O error: {0}.")]
	Io(#[from] io::Error),

	#[error("SSH error on {host}: {source}")]
	Ssh {
		host: IpAddr,
		#[source]
		source: russh::Error,
	},

	#[error("Connecting to {host} timed out after {after:?}.")]
	Timeout { host: IpAddr, after: Duration },

	#[error("Failed to load SSH key '{path}': {source}")]
	Keys {
		path: String,
		#[source]
		source: russh::keys::Error,
	},

	#[error("Authentication of {user}@{host} failed.")]
	Auth { host: IpAddr, user: String },

	#[error("Command failed on {host} with exit code {code}: {cmd}")]
	CommandFailed {
		host: IpAddr,
		cmd: String,
		code: u32,
		output: String,
	},

	#[error("Command on {host} closed without an exit status: {cmd}")]
	NoExitStatus { host: IpAddr, cmd: String },

	#[error("Host {0} is not part of the cluster.")]
	UnknownHost(IpAddr),

	#[error("Host {host} is not reachable after {attempts} attempts: {source}")]
	NotReady {
		host: IpAddr,
		attempts: u32,
		#[source]
		source: BoxError,
	},

	#[error("{} of {total} hosts failed: {}", .failures.len(), describe(.failures))]
	Fanout {
		total: usize,
		failures: Vec<HostFailure>,
	},
}

#[derive(Debug)]
pub struct HostFailure {
	pub host: IpAddr,
	pub error: BoxError,
}

impl InfraError {
	/// Hosts named by a fanout failure, in the order they were dispatched.
	pub fn failed_hosts(&self) -> Vec<IpAddr> {
		match self {
			InfraError::Fanout { failures, .. } => failures.iter().map(|f| f.host).collect(),
			InfraError::Ssh { host, .. }
			| InfraError::Auth { host, .. }
			| InfraError::Timeout { host, .. }
			| InfraError::CommandFailed { host, .. }
			| InfraError::NoExitStatus { host, .. }
			| InfraError::NotReady { host, .. }
			| InfraError::UnknownHost(host) => vec![*host],
			InfraError::Io(_) | InfraError::Keys { .. } => Vec::new(),
		}
	}
}

fn describe(failures: &[HostFailure]) -> String {
	failures
		.iter()
		.map(|f| format!("[{}] {}", f.host, f.error))
		.collect::<Vec<_>>()
		.join("; ")
}

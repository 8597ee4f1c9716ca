use kubefleet_infra::InfraError;
use std::{io, net::IpAddr, path::PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
	#[error("I/O error: {0}.")]
	Io(#[from] io::Error),

	#[error("Invalid configuration: {0}.")]
	Config(String),

	#[error(transparent)]
	Infra(#[from] InfraError),

	#[error("Step '{step}' failed: {source}")]
	Step {
		step: &'static str,
		#[source]
		source: Box<ClusterError>,
	},

	#[error("Host {host}: {source}")]
	Host {
		host: IpAddr,
		#[source]
		source: Box<ClusterError>,
	},

	#[error("Hook '{name}' in phase {phase} failed: {source}")]
	Hook {
		phase: String,
		name: String,
		#[source]
		source: Box<ClusterError>,
	},

	#[error("Registry certificate {present} exists without its pair {missing}.")]
	CertPair { present: PathBuf, missing: PathBuf },

	#[error("Certificate generation error: {0}")]
	Cert(#[from] rcgen::RcgenError),

	#[error("Password hashing error: {0}")]
	Auth(#[from] bcrypt::BcryptError),

	#[error("Kubernetes error: {0}")]
	Kube(String),

	#[error("YAML error: {0}")]
	Yaml(#[from] serde_yaml::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("TOML error: {0}")]
	Toml(#[from] toml::ser::Error),
}

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;

/// Attaches a pipeline step name to a failure.
pub trait StepContext<T> {
	fn step(self, step: &'static str) -> Result<T>;
}

impl<T, E: Into<ClusterError>> StepContext<T> for std::result::Result<T, E> {
	fn step(self, step: &'static str) -> Result<T> {
		self.map_err(|err| ClusterError::Step {
			step,
			source: Box::new(err.into()),
		})
	}
}

impl ClusterError {
	pub fn on_host(self, host: IpAddr) -> Self {
		ClusterError::Host {
			host,
			source: Box::new(self),
		}
	}

	/// Every host address named anywhere in the error chain.
	pub fn hosts(&self) -> Vec<IpAddr> {
		match self {
			ClusterError::Infra(err) => err.failed_hosts(),
			ClusterError::Host { host, source } => {
				let mut hosts = vec![*host];
				hosts.extend(source.hosts().into_iter().filter(|h| h != host));
				hosts
			}
			ClusterError::Step { source, .. } | ClusterError::Hook { source, .. } => source.hosts(),
			_ => Vec::new(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn step_wraps_with_name_and_keeps_hosts() {
		let host = IpAddr::from([10, 0, 0, 2]);
		let failed: Result<()> = Err(ClusterError::Infra(InfraError::UnknownHost(host)));
		let err = failed.step("install container runtime").unwrap_err();
		assert!(err.to_string().starts_with("Step 'install container runtime' failed"));
		assert_eq!(err.hosts(), vec![host]);
	}
}

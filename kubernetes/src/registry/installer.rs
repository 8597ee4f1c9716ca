use crate::cluster::LocalRegistry;
use crate::distributor::Distributor;
use crate::error::{ClusterError, Result, StepContext};
use crate::infradriver::{Env, InfraDriver};
use kubefleet_infra::{exec, hosts};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, SanType};
use std::{
	fs,
	net::IpAddr,
	path::{Path, PathBuf},
	sync::Arc,
};
use tracing::info;

pub const CONTAINER_NAME: &str = "kubefleet-registry";
pub const HTPASSWD_FILE: &str = "registry_htpasswd";

/// Converges the set of hosts running the local registry.
pub struct LocalInstaller {
	current: Vec<IpAddr>,
	registry: LocalRegistry,
	driver: Arc<dyn InfraDriver>,
	distributor: Arc<dyn Distributor>,
	local_dir: PathBuf,
}

/// Paths of the registry CA certificate and key under `dir`.
pub fn cert_paths(dir: &Path, domain: &str) -> (PathBuf, PathBuf) {
	let certs = dir.join("certs");
	(certs.join(format!("{domain}.crt")), certs.join(format!("{domain}.key")))
}

impl LocalInstaller {
	/// `local_dir` holds the generated certificate and htpasswd between runs.
	pub fn new(
		current: Vec<IpAddr>,
		registry: LocalRegistry,
		driver: Arc<dyn InfraDriver>,
		distributor: Arc<dyn Distributor>,
		local_dir: PathBuf,
	) -> Self {
		Self {
			current,
			registry,
			driver,
			distributor,
			local_dir,
		}
	}

	/// Moves the deployed set toward `desired` and returns the new deployed set.
	///
	/// A call either grows or shrinks the set, never both. When hosts both
	/// join and depart, only the joining ones are handled and the departed
	/// ones stay until the next call.
	pub async fn reconcile(&self, desired: &[IpAddr]) -> Result<Vec<IpAddr>> {
		if self.current.is_empty() {
			self.install_on(desired).await?;
			return Ok(desired.to_vec());
		}
		let (joined, departed) = hosts::diff(&self.current, desired);
		if !joined.is_empty() {
			self.install_on(&joined).await?;
			return Ok(hosts::union(&self.current, &joined));
		}
		if !departed.is_empty() {
			self.clean(&departed).await?;
			return Ok(hosts::remove(&self.current, &departed));
		}
		Ok(self.current.clone())
	}

	pub async fn install_on(&self, targets: &[IpAddr]) -> Result<()> {
		if targets.is_empty() {
			return Ok(());
		}
		info!("Launching local registry on {targets:?}.");
		self.sync_basic_auth(targets).await.step("sync registry basic auth")?;
		self.sync_cert(targets).await.step("sync registry certificate")?;
		let rootfs = self.driver.rootfs_path();
		let data_dir = self.registry.data_dir(&rootfs);
		self.distributor
			.distribute_registry(targets, &data_dir)
			.await
			.step("distribute registry data")?;
		let cmd = format!(
			"cd {rootfs}/scripts && bash init-registry.sh {} {data_dir} {}",
			self.registry.config.port, self.registry.config.domain
		);
		let env = self.driver.cluster_env();
		exec::execute(targets, |host| {
			let (cmd, env) = (&cmd, &env);
			async move { self.driver.cmd_async(host, env, cmd).await }
		})
		.await
		.step("start registry")?;
		Ok(())
	}

	/// Stops and removes the registry container on every target.
	pub async fn clean(&self, targets: &[IpAddr]) -> Result<()> {
		if targets.is_empty() {
			return Ok(());
		}
		info!("Removing local registry from {targets:?}.");
		let cmd = format!(
			"if docker inspect {CONTAINER_NAME} 2>/dev/null; then docker rm -f {CONTAINER_NAME}; fi && \
			 ((! nerdctl ps -a 2>/dev/null | grep {CONTAINER_NAME}) || \
			 (nerdctl stop {CONTAINER_NAME} && nerdctl rm -f {CONTAINER_NAME}))"
		);
		exec::execute(targets, |host| {
			let cmd = &cmd;
			async move { self.driver.cmd_async(host, &Env::new(), cmd).await }
		})
		.await
		.step("remove registry")?;
		Ok(())
	}

	/// Removes every deployed registry instance.
	pub async fn clean_all(&self) -> Result<()> {
		self.clean(&self.current).await
	}

	async fn sync_basic_auth(&self, targets: &[IpAddr]) -> Result<()> {
		let Some((user, password)) = self.registry.config.credentials() else {
			return Ok(());
		};
		let local = self.local_dir.join("etc").join(HTPASSWD_FILE);
		if !local.exists() {
			fs::create_dir_all(self.local_dir.join("etc"))?;
			fs::write(&local, htpasswd(user, password)?)?;
		}
		let remote = format!("{}/etc/{HTPASSWD_FILE}", self.driver.rootfs_path());
		self.copy_to(targets, &local, &remote).await
	}

	async fn sync_cert(&self, targets: &[IpAddr]) -> Result<()> {
		if self.registry.insecure {
			return Ok(());
		}
		let (cert, key) = cert_paths(&self.local_dir, &self.registry.config.domain);
		match (cert.exists(), key.exists()) {
			(true, true) => {}
			(false, false) => self.generate_cert(&cert, &key)?,
			(true, false) => {
				return Err(ClusterError::CertPair {
					present: cert,
					missing: key,
				});
			}
			(false, true) => {
				return Err(ClusterError::CertPair {
					present: key,
					missing: cert,
				});
			}
		}
		let remote = format!("{}/certs", self.driver.rootfs_path());
		let local = self.local_dir.join("certs");
		self.copy_to(targets, &local, &remote).await
	}

	fn generate_cert(&self, cert: &Path, key: &Path) -> Result<()> {
		let mut sans = vec![SanType::DnsName(self.registry.config.domain.clone())];
		sans.extend(self.registry.cert.alt_ips.iter().map(|ip| SanType::IpAddress(*ip)));
		sans.extend(
			self.registry
				.cert
				.alt_names
				.iter()
				.map(|name| SanType::DnsName(name.clone())),
		);
		let mut params = CertificateParams::new(Vec::<String>::new());
		params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
		params.distinguished_name.push(DnType::CommonName, "registry-ca");
		params.subject_alt_names = sans;
		params.not_after = rcgen::date_time_ymd(2124, 1, 1);
		let generated = Certificate::from_params(params)?;
		if let Some(dir) = cert.parent() {
			fs::create_dir_all(dir)?;
		}
		fs::write(cert, generated.serialize_pem()?)?;
		fs::write(key, generated.serialize_private_key_pem())?;
		info!("Generated registry certificate {}.", cert.display());
		Ok(())
	}

	async fn copy_to(&self, targets: &[IpAddr], local: &Path, remote: &str) -> Result<()> {
		exec::execute(targets, |host| async move {
			self.driver.copy(host, local, remote).await
		})
		.await?;
		Ok(())
	}
}

/// One htpasswd line with a bcrypt hash.
fn htpasswd(user: &str, password: &str) -> Result<String> {
	let hash = bcrypt::hash_with_result(password, bcrypt::DEFAULT_COST)?;
	Ok(format!("{user}:{}\n", hash.format_for_version(bcrypt::Version::TwoY)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cluster::{Cluster, HostGroup, MASTER};
	use crate::testing::{DistributorCall, FakeDistributor, FakeDriver};

	fn ip(last: u8) -> IpAddr {
		IpAddr::from([192, 168, 0, last])
	}

	struct Fixture {
		driver: Arc<FakeDriver>,
		distributor: Arc<FakeDistributor>,
		dir: tempfile::TempDir,
	}

	impl Fixture {
		fn new() -> Self {
			let mut cluster = Cluster::new("dev", "img");
			cluster.hosts.push(HostGroup::new(vec![ip(1), ip(2), ip(3)], MASTER));
			Self {
				driver: Arc::new(FakeDriver::new(cluster)),
				distributor: Arc::new(FakeDistributor::default()),
				dir: tempfile::tempdir().unwrap(),
			}
		}

		fn installer(&self, current: &[IpAddr], registry: LocalRegistry) -> LocalInstaller {
			LocalInstaller::new(
				current.to_vec(),
				registry,
				self.driver.clone(),
				self.distributor.clone(),
				self.dir.path().to_path_buf(),
			)
		}

		fn started_on(&self) -> Vec<IpAddr> {
			self.driver.hosts_running("init-registry.sh")
		}

		fn removed_from(&self) -> Vec<IpAddr> {
			self.driver.hosts_running("docker rm -f")
		}
	}

	#[tokio::test]
	async fn first_install_deploys_desired_hosts() {
		let fx = Fixture::new();
		let actual = fx
			.installer(&[], LocalRegistry::default())
			.reconcile(&[ip(1), ip(2)])
			.await
			.unwrap();
		assert_eq!(actual, vec![ip(1), ip(2)]);
		assert_eq!(fx.started_on(), vec![ip(1), ip(2)]);
		assert_eq!(
			fx.distributor.calls(),
			vec![DistributorCall::Registry(
				vec![ip(1), ip(2)],
				"/var/lib/kubefleet/data/dev/rootfs/registry".into()
			)]
		);
		assert_eq!(
			fx.driver.commands(ip(1)),
			vec![
				"cd /var/lib/kubefleet/data/dev/rootfs/scripts && bash init-registry.sh 5000 \
				 /var/lib/kubefleet/data/dev/rootfs/registry fleet.hub"
			]
		);
	}

	#[tokio::test]
	async fn joined_hosts_win_over_departed_hosts() {
		let fx = Fixture::new();
		let installer = fx.installer(&[ip(1), ip(2)], LocalRegistry::default());
		let actual = installer.reconcile(&[ip(2), ip(3)]).await.unwrap();
		assert_eq!(actual, vec![ip(1), ip(2), ip(3)]);
		assert_eq!(fx.started_on(), vec![ip(3)]);
		assert!(fx.removed_from().is_empty());

		let installer = fx.installer(&actual, LocalRegistry::default());
		let actual = installer.reconcile(&[ip(2), ip(3)]).await.unwrap();
		assert_eq!(actual, vec![ip(2), ip(3)]);
		assert_eq!(fx.removed_from(), vec![ip(1)]);
	}

	#[tokio::test]
	async fn unchanged_set_is_a_no_op() {
		let fx = Fixture::new();
		let installer = fx.installer(&[ip(1), ip(2)], LocalRegistry::default());
		for _ in 0..2 {
			let actual = installer.reconcile(&[ip(2), ip(1)]).await.unwrap();
			assert_eq!(actual, vec![ip(1), ip(2)]);
		}
		assert!(fx.driver.calls(ip(1)).is_empty());
		assert!(fx.distributor.calls().is_empty());
	}

	#[tokio::test]
	async fn clean_failure_names_the_host() {
		let fx = Fixture::new();
		fx.driver.fail_on(ip(2));
		let installer = fx.installer(&[ip(1), ip(2), ip(3)], LocalRegistry::default());
		let err = installer.reconcile(&[ip(1)]).await.unwrap_err();
		assert_eq!(err.hosts(), vec![ip(2)]);
		assert_eq!(fx.removed_from(), vec![ip(2), ip(3)]);
	}

	#[tokio::test]
	async fn certificate_is_generated_once_and_copied() {
		let fx = Fixture::new();
		let installer = fx.installer(&[], LocalRegistry::default());
		installer.install_on(&[ip(1)]).await.unwrap();
		let (cert, key) = cert_paths(fx.dir.path(), LocalRegistry::DEFAULT_DOMAIN);
		let first = fs::read_to_string(&cert).unwrap();
		assert!(first.starts_with("-----BEGIN CERTIFICATE-----"));
		assert!(key.exists());
		installer.install_on(&[ip(2)]).await.unwrap();
		assert_eq!(fs::read_to_string(&cert).unwrap(), first);
		assert_eq!(fx.driver.copies(ip(2)), vec!["/var/lib/kubefleet/data/dev/rootfs/certs"]);
	}

	#[tokio::test]
	async fn half_a_certificate_pair_is_fatal() {
		let fx = Fixture::new();
		let (cert, _) = cert_paths(fx.dir.path(), LocalRegistry::DEFAULT_DOMAIN);
		fs::create_dir_all(cert.parent().unwrap()).unwrap();
		fs::write(&cert, "stale").unwrap();
		let err = fx
			.installer(&[], LocalRegistry::default())
			.reconcile(&[ip(1)])
			.await
			.unwrap_err();
		assert!(matches!(
			err,
			ClusterError::Step { ref source, .. } if matches!(**source, ClusterError::CertPair { .. })
		));
		assert!(fx.started_on().is_empty());
	}

	#[tokio::test]
	async fn key_without_certificate_is_fatal() {
		let fx = Fixture::new();
		let (cert, key) = cert_paths(fx.dir.path(), LocalRegistry::DEFAULT_DOMAIN);
		fs::create_dir_all(key.parent().unwrap()).unwrap();
		fs::write(&key, "orphan").unwrap();
		let err = fx
			.installer(&[], LocalRegistry::default())
			.install_on(&[ip(1)])
			.await
			.unwrap_err();
		let ClusterError::Step { source, .. } = err else {
			panic!("unexpected error {err}");
		};
		let ClusterError::CertPair { present, missing } = *source else {
			panic!("unexpected error {source}");
		};
		assert_eq!((present, missing), (key.clone(), cert.clone()));
		assert_eq!(fs::read_to_string(&key).unwrap(), "orphan");
		assert!(!cert.exists());
		assert!(fx.started_on().is_empty());
	}

	#[tokio::test]
	async fn missing_pair_is_generated_before_start() {
		let fx = Fixture::new();
		let (cert, key) = cert_paths(fx.dir.path(), LocalRegistry::DEFAULT_DOMAIN);
		assert!(!cert.exists() && !key.exists());
		fx.installer(&[], LocalRegistry::default()).reconcile(&[ip(1)]).await.unwrap();
		assert!(fs::read_to_string(&key).unwrap().contains("PRIVATE KEY"));
		assert!(cert.exists());
		assert_eq!(fx.started_on(), vec![ip(1)]);
	}

	#[tokio::test]
	async fn insecure_registry_with_credentials_skips_cert() {
		let fx = Fixture::new();
		let mut registry = LocalRegistry {
			insecure: true,
			..LocalRegistry::default()
		};
		registry.config.username = Some("admin".into());
		registry.config.password = Some("secret".into());
		fx.installer(&[], registry).install_on(&[ip(1)]).await.unwrap();
		let htpasswd = fs::read_to_string(fx.dir.path().join("etc").join(HTPASSWD_FILE)).unwrap();
		let (user, hash) = htpasswd.trim().split_once(':').unwrap();
		assert_eq!(user, "admin");
		assert!(bcrypt::verify("secret", hash).unwrap());
		assert!(!fx.dir.path().join("certs").exists());
		assert_eq!(
			fx.driver.copies(ip(1)),
			vec!["/var/lib/kubefleet/data/dev/rootfs/etc/registry_htpasswd"]
		);
	}
}

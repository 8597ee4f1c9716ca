//! kubeadm driven control plane: bring-up, membership changes, upgrade and teardown.

use super::KubeDriver;
use super::driver::KUBECONFIG;
use crate::cluster::KubeadmConfig;
use crate::container_runtime::Info;
use crate::error::{ClusterError, Result, StepContext};
use crate::infradriver::{Env, InfraDriver, set_host_alias_cmd, unset_host_alias_cmd};
use crate::ipvs::{self, LVSCARE_IMAGE, LvsRule};
use kubefleet_infra::{exec, hosts};
use std::{fs, net::IpAddr, path::PathBuf, sync::Arc};
use tracing::{info, warn};

pub const APISERVER_DOMAIN: &str = "apiserver.cluster.local";
pub const APISERVER_PORT: u16 = 6443;
const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";
const LVS_POD_NAME: &str = "kube-lvscare";

pub struct KubeadmRuntime {
	driver: Arc<dyn InfraDriver>,
	config: KubeadmConfig,
	runtime: Info,
	registry_endpoint: String,
	/// Local copy of the admin kubeconfig.
	kubeconfig: PathBuf,
}

/// Credentials for adding hosts to a running control plane.
struct JoinTicket {
	command: String,
	certificate_key: String,
}

impl KubeadmRuntime {
	pub fn new(
		driver: Arc<dyn InfraDriver>,
		config: KubeadmConfig,
		runtime: Info,
		registry_endpoint: String,
		kubeconfig: PathBuf,
	) -> Self {
		Self {
			driver,
			config,
			runtime,
			registry_endpoint,
			kubeconfig,
		}
	}

	fn cri_socket(&self) -> String {
		format!("unix://{}", self.runtime.socket)
	}

	fn vip(&self) -> IpAddr {
		ipvs::default_vip(&self.driver.host_ips())
	}

	pub fn current_driver(&self) -> Result<KubeDriver> {
		Ok(KubeDriver::new(self.driver.master0()?, self.driver.clone()))
	}

	pub async fn install(&self) -> Result<()> {
		let masters = self.driver.masters();
		let master0 = self.driver.master0()?;
		self.prepare(&self.driver.host_ips()).await.step("install kubelet and kubeadm")?;
		self.init_master0(master0, &masters).await.step("initialize master0")?;
		self.fetch_kubeconfig(master0).await.step("fetch admin kubeconfig")?;
		let ticket = self.join_ticket(master0).await?;
		self.join_masters(&masters[1..], master0, &ticket)
			.await
			.step("join masters")?;
		self.join_nodes(&self.driver.workers(), &masters, &ticket)
			.await
			.step("join nodes")?;
		info!("Kubernetes control plane is up on {master0}.");
		Ok(())
	}

	pub async fn scale_up(&self, masters: &[IpAddr], nodes: &[IpAddr]) -> Result<()> {
		let master0 = self.driver.master0()?;
		let all_masters = self.driver.masters();
		self.prepare(&hosts::union(masters, nodes))
			.await
			.step("install kubelet and kubeadm")?;
		let ticket = self.join_ticket(master0).await?;
		self.join_masters(masters, master0, &ticket).await.step("join masters")?;
		self.join_nodes(nodes, &all_masters, &ticket).await.step("join nodes")?;
		if !masters.is_empty() {
			let existing = hosts::remove(&self.driver.workers(), nodes);
			self.configure_worker_lb(&existing, &all_masters)
				.await
				.step("re-program apiserver load balancing")?;
		}
		Ok(())
	}

	/// Resets the departing hosts and removes them from the cluster.
	///
	/// Hosts in `unreachable` are only removed from the API server.
	pub async fn scale_down(
		&self,
		masters: &[IpAddr],
		nodes: &[IpAddr],
		unreachable: &[IpAddr],
	) -> Result<()> {
		let remaining = hosts::remove(&self.driver.masters(), masters);
		let Some(&anchor) = remaining.first() else {
			return Err(ClusterError::Kube(
				"cannot remove every master, delete the whole cluster instead".into(),
			));
		};
		let kube = KubeDriver::new(anchor, self.driver.clone());
		let names = kube.node_names().await?;
		let departing = hosts::union(masters, nodes);
		self.clean(&hosts::remove(&departing, unreachable))
			.await
			.step("reset departing hosts")?;
		for host in &departing {
			match names.get(host) {
				Some(name) => kube.delete_node(name).await.map_err(|err| err.on_host(*host))?,
				None => warn!(%host, "Host is not registered as a node, nothing to delete."),
			}
		}
		if masters.is_empty() {
			return Ok(());
		}
		let workers = hosts::remove(&self.driver.workers(), nodes);
		self.configure_worker_lb(&workers, &remaining)
			.await
			.step("re-program apiserver load balancing")
	}

	/// Wipes Kubernetes from `targets`.
	pub async fn reset(&self, targets: &[IpAddr]) -> Result<()> {
		self.clean(targets).await.step("reset hosts")
	}

	pub async fn upgrade(&self) -> Result<()> {
		let master0 = self.driver.master0()?;
		let all = self.driver.host_ips();
		self.prepare(&all).await.step("install kubelet and kubeadm")?;
		let version = match &self.config.kubernetes_version {
			Some(version) => version.clone(),
			None => self
				.driver
				.cmd(master0, &Env::new(), "kubeadm version -o short")
				.await?
				.trim()
				.to_owned(),
		};
		if version.is_empty() {
			return Err(ClusterError::Kube("cannot determine the target Kubernetes version".into()));
		}
		info!("Upgrading Kubernetes to {version}.");
		self.driver
			.cmd_async(master0, &Env::new(), &format!("kubeadm upgrade apply -y {version}"))
			.await
			.step("upgrade master0")?;
		for master in hosts::remove(&self.driver.masters(), &[master0]) {
			self.driver
				.cmd_async(master, &Env::new(), "kubeadm upgrade node")
				.await
				.step("upgrade masters")?;
		}
		exec::execute(&self.driver.workers(), |host| async move {
			self.driver.cmd_async(host, &Env::new(), "kubeadm upgrade node").await
		})
		.await
		.step("upgrade nodes")?;
		exec::execute(&all, |host| async move {
			self.driver
				.cmd_async(host, &Env::new(), "systemctl daemon-reload && systemctl restart kubelet")
				.await
		})
		.await
		.step("restart kubelet")?;
		Ok(())
	}

	async fn prepare(&self, targets: &[IpAddr]) -> Result<()> {
		let cmd = format!("cd {}/scripts && bash init-kube.sh", self.driver.rootfs_path());
		exec::execute(targets, |host| {
			let cmd = &cmd;
			async move { self.driver.cmd_async(host, &self.driver.host_env(&host), cmd).await }
		})
		.await?;
		Ok(())
	}

	fn init_cmd(&self, masters: &[IpAddr]) -> String {
		let mut sans = vec![APISERVER_DOMAIN.to_owned(), "127.0.0.1".to_owned()];
		sans.extend(masters.iter().map(IpAddr::to_string));
		sans.push(self.vip().to_string());
		sans.extend(self.config.cert_sans.iter().cloned());
		let mut cmd = format!(
			"kubeadm init --control-plane-endpoint {APISERVER_DOMAIN}:{APISERVER_PORT} --upload-certs \
			 --pod-network-cidr {} --service-cidr {} --cri-socket {} --image-repository {}",
			self.config.pod_subnet,
			self.config.service_subnet,
			self.cri_socket(),
			self.registry_endpoint,
		);
		if let Some(version) = &self.config.kubernetes_version {
			cmd.push_str(&format!(" --kubernetes-version {version}"));
		}
		cmd.push_str(&format!(
			" --apiserver-cert-extra-sans {} -v {}",
			sans.join(","),
			self.config.vlog
		));
		cmd
	}

	async fn init_master0(&self, master0: IpAddr, masters: &[IpAddr]) -> Result<()> {
		let alias = set_host_alias_cmd(APISERVER_DOMAIN, &master0);
		self.driver.cmd_async(master0, &Env::new(), &alias).await?;
		if self.driver.is_file_exist(master0, KUBECONFIG).await? {
			info!("{master0} is already initialized.");
			return Ok(());
		}
		info!("Initializing control plane on {master0}.");
		self.driver
			.cmd_async(master0, &self.driver.host_env(&master0), &self.init_cmd(masters))
			.await
	}

	async fn fetch_kubeconfig(&self, master0: IpAddr) -> Result<()> {
		let contents = self
			.driver
			.cmd(master0, &Env::new(), &format!("cat {KUBECONFIG}"))
			.await?;
		if let Some(dir) = self.kubeconfig.parent() {
			fs::create_dir_all(dir)?;
		}
		fs::write(&self.kubeconfig, contents)?;
		self.copy_admin_conf(master0).await
	}

	async fn copy_admin_conf(&self, master: IpAddr) -> Result<()> {
		let cmd = format!("mkdir -p $HOME/.kube && cp -f {KUBECONFIG} $HOME/.kube/config");
		self.driver.cmd_async(master, &Env::new(), &cmd).await
	}

	async fn join_ticket(&self, master0: IpAddr) -> Result<JoinTicket> {
		let vlog = self.config.vlog;
		let certs = self
			.driver
			.cmd(
				master0,
				&Env::new(),
				&format!("kubeadm init phase upload-certs --upload-certs -v {vlog}"),
			)
			.await
			.step("upload control plane certificates")?;
		let certificate_key = last_line(&certs)
			.ok_or_else(|| ClusterError::Kube("kubeadm printed no certificate key".into()))?;
		let join = self
			.driver
			.cmd(
				master0,
				&Env::new(),
				&format!("kubeadm token create --print-join-command -v {vlog}"),
			)
			.await
			.step("create join token")?;
		let command = last_line(&join)
			.filter(|line| line.starts_with("kubeadm join"))
			.ok_or_else(|| ClusterError::Kube(format!("unexpected join command output: {}", join.trim())))?;
		Ok(JoinTicket {
			command,
			certificate_key,
		})
	}

	async fn is_joined(&self, host: IpAddr) -> Result<bool> {
		self.driver.is_file_exist(host, KUBELET_CONF).await
	}

	/// Control plane members join one at a time to keep etcd quorum changes serial.
	async fn join_masters(
		&self,
		masters: &[IpAddr],
		master0: IpAddr,
		ticket: &JoinTicket,
	) -> Result<()> {
		let cmd = format!(
			"{} --control-plane --certificate-key {} --cri-socket {} -v {}",
			ticket.command,
			ticket.certificate_key,
			self.cri_socket(),
			self.config.vlog
		);
		for &master in masters {
			if self.is_joined(master).await? {
				info!("{master} already joined.");
				continue;
			}
			info!("Joining {master} as master.");
			let env = self.driver.host_env(&master);
			let joined = async {
				self.driver
					.cmd_async(master, &env, &set_host_alias_cmd(APISERVER_DOMAIN, &master0))
					.await?;
				self.driver.cmd_async(master, &env, &cmd).await?;
				self.driver
					.cmd_async(master, &env, &set_host_alias_cmd(APISERVER_DOMAIN, &master))
					.await?;
				self.copy_admin_conf(master).await
			};
			joined.await.map_err(|err| err.on_host(master))?;
		}
		Ok(())
	}

	async fn join_nodes(
		&self,
		nodes: &[IpAddr],
		masters: &[IpAddr],
		ticket: &JoinTicket,
	) -> Result<()> {
		if nodes.is_empty() {
			return Ok(());
		}
		let cmd = format!(
			"{} --cri-socket {} -v {}",
			ticket.command,
			self.cri_socket(),
			self.config.vlog
		);
		let rule = self.apiserver_rule(masters);
		let pod = rule.static_pod(&format!("{}/{LVSCARE_IMAGE}", self.registry_endpoint))?;
		let alias = set_host_alias_cmd(APISERVER_DOMAIN, &self.vip());
		exec::execute(nodes, |node| {
			let (cmd, rule, pod, alias) = (&cmd, &rule, &pod, &alias);
			async move {
				if self.is_joined(node).await? {
					info!("{node} already joined.");
					return Ok(());
				}
				info!("Joining {node} as node.");
				let env = self.driver.host_env(&node);
				self.driver.cmd_async(node, &env, &rule.apply_cmd()).await?;
				self.driver.cmd_async(node, &env, alias).await?;
				self.driver.cmd_async(node, &env, cmd).await?;
				self.driver.write(node, pod.as_bytes(), &rule.pod_path()).await
			}
		})
		.await?;
		Ok(())
	}

	fn apiserver_rule(&self, masters: &[IpAddr]) -> LvsRule {
		LvsRule::new(LVS_POD_NAME, self.vip(), APISERVER_PORT, masters, "https").with_health_path("/healthz")
	}

	/// Points `workers` at the current set of API servers.
	async fn configure_worker_lb(&self, workers: &[IpAddr], masters: &[IpAddr]) -> Result<()> {
		let rule = self.apiserver_rule(masters);
		let pod = rule.static_pod(&format!("{}/{LVSCARE_IMAGE}", self.registry_endpoint))?;
		exec::execute(workers, |node| {
			let (rule, pod) = (&rule, &pod);
			async move {
				self.driver.cmd_async(node, &Env::new(), &rule.apply_cmd()).await?;
				self.driver.write(node, pod.as_bytes(), &rule.pod_path()).await
			}
		})
		.await?;
		Ok(())
	}

	async fn clean(&self, targets: &[IpAddr]) -> Result<()> {
		let cmd = format!(
			"if which kubeadm > /dev/null 2>&1; then kubeadm reset -f -v {}; fi && \
			 rm -rf /etc/kubernetes/ /etc/systemd/system/kubelet.service.d /etc/systemd/system/kubelet.service \
			 /usr/bin/kubeadm /usr/bin/kubelet-pre-start.sh /usr/bin/kubelet /usr/bin/kubectl \
			 /var/lib/kubelet/* /etc/sysctl.d/k8s.conf /etc/cni /opt/cni /var/lib/etcd /var/etcd $HOME/.kube && {}",
			self.config.vlog,
			unset_host_alias_cmd(APISERVER_DOMAIN)
		);
		exec::execute(targets, |host| {
			let cmd = &cmd;
			async move { self.driver.cmd_async(host, &Env::new(), cmd).await }
		})
		.await?;
		Ok(())
	}
}

fn last_line(out: &str) -> Option<String> {
	out.lines()
		.map(str::trim)
		.filter(|line| !line.is_empty())
		.last()
		.map(str::to_owned)
}

use crate::cluster::Taint;
use crate::error::{ClusterError, Result};
use crate::infradriver::{Env, InfraDriver};
use kubefleet_infra::quote;
use std::{
	collections::{BTreeMap, HashMap},
	fmt,
	net::IpAddr,
	sync::Arc,
};
use tracing::debug;

pub const KUBECONFIG: &str = "/etc/kubernetes/admin.conf";
const SCRATCH_DIR: &str = "/tmp/kubefleet";

/// Talks to the API server with kubectl on a control-plane host.
#[derive(Clone)]
pub struct KubeDriver {
	anchor: IpAddr,
	driver: Arc<dyn InfraDriver>,
}

impl fmt::Debug for KubeDriver {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KubeDriver").field("anchor", &self.anchor).finish()
	}
}

impl KubeDriver {
	pub fn new(anchor: IpAddr, driver: Arc<dyn InfraDriver>) -> Self {
		Self { anchor, driver }
	}

	/// Host kubectl runs on.
	pub fn anchor(&self) -> IpAddr {
		self.anchor
	}

	async fn kubectl(&self, args: &str) -> Result<String> {
		let cmd = format!("kubectl --kubeconfig {KUBECONFIG} {args}");
		debug!(host = %self.anchor, "{cmd}");
		self.driver.cmd(self.anchor, &Env::new(), &cmd).await
	}

	/// Node name for every node InternalIP.
	pub async fn node_names(&self) -> Result<HashMap<IpAddr, String>> {
		let jsonpath = r#"jsonpath={range .items[*]}{.status.addresses[?(@.type=="InternalIP")].address}{" "}{.metadata.name}{"\n"}{end}"#;
		let out = self.kubectl(&format!("get nodes -o {}", quote(jsonpath))).await?;
		Ok(parse_node_names(&out))
	}

	/// Marks `host` with its roles and declared labels.
	pub async fn label_node(
		&self,
		names: &HashMap<IpAddr, String>,
		host: &IpAddr,
		roles: &[String],
		labels: &BTreeMap<String, String>,
	) -> Result<()> {
		let mut pairs: Vec<String> = roles
			.iter()
			.map(|role| format!("node-role.kubernetes.io/{role}="))
			.collect();
		pairs.extend(labels.iter().map(|(key, value)| format!("{key}={value}")));
		if pairs.is_empty() {
			return Ok(());
		}
		let name = node_name(names, host)?;
		let args: Vec<String> = pairs.iter().map(|pair| quote(pair)).collect();
		self.kubectl(&format!("label nodes {name} {} --overwrite", args.join(" ")))
			.await?;
		Ok(())
	}

	pub async fn taint_node(
		&self,
		names: &HashMap<IpAddr, String>,
		host: &IpAddr,
		taint: &Taint,
	) -> Result<()> {
		let name = node_name(names, host)?;
		self.kubectl(&format!("taint nodes {name} {} --overwrite", quote(&taint.to_string())))
			.await?;
		Ok(())
	}

	pub async fn delete_node(&self, name: &str) -> Result<()> {
		self.kubectl(&format!("delete node {} --ignore-not-found", quote(name)))
			.await?;
		Ok(())
	}

	/// Renders a `kubectl create` invocation without touching the cluster.
	pub async fn generate_yaml(&self, create_args: &str) -> Result<String> {
		self.kubectl(&format!("create {create_args} --dry-run=client -o yaml"))
			.await
	}

	pub async fn apply_yaml(&self, name: &str, yaml: &str) -> Result<()> {
		let path = format!("{SCRATCH_DIR}/{name}.yaml");
		self.driver.write(self.anchor, yaml.as_bytes(), &path).await?;
		self.kubectl(&format!("apply -f {path}")).await?;
		Ok(())
	}

	/// Creates or replaces a single-key ConfigMap.
	pub async fn apply_configmap(
		&self,
		namespace: &str,
		name: &str,
		key: &str,
		contents: &str,
	) -> Result<()> {
		let path = format!("{SCRATCH_DIR}/{name}.{key}");
		self.driver.write(self.anchor, contents.as_bytes(), &path).await?;
		let yaml = self
			.generate_yaml(&format!("configmap {name} -n {namespace} --from-file={key}={path}"))
			.await?;
		self.apply_yaml(name, &yaml).await
	}
}

fn node_name(names: &HashMap<IpAddr, String>, host: &IpAddr) -> Result<String> {
	names
		.get(host)
		.cloned()
		.ok_or_else(|| ClusterError::Kube(format!("no node registered with address {host}")))
}

fn parse_node_names(out: &str) -> HashMap<IpAddr, String> {
	out.lines()
		.filter_map(|line| {
			let (ip, name) = line.trim().split_once(' ')?;
			Some((ip.parse().ok()?, name.trim().to_owned()))
		})
		.collect()
}

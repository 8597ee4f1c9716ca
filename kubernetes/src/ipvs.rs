//! Virtual IP load balancing through an lvscare static pod.

use crate::error::Result;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const STATIC_POD_DIR: &str = "/etc/kubernetes/manifests";
pub const LVSCARE_IMAGE: &str = "kubefleet/lvscare:v1.1.3";
pub const DEFAULT_VIP: Ipv4Addr = Ipv4Addr::new(10, 103, 97, 2);
pub const DEFAULT_VIP_V6: Ipv6Addr = Ipv6Addr::new(0x1248, 0x4003, 0x10bb, 0x6a01, 0x83b9, 0x6360, 0xc66d, 0x0002);

/// VIP matching the address family of the first cluster host.
pub fn default_vip(hosts: &[IpAddr]) -> IpAddr {
	match hosts.first() {
		Some(IpAddr::V6(_)) => IpAddr::V6(DEFAULT_VIP_V6),
		_ => IpAddr::V4(DEFAULT_VIP),
	}
}

/// One virtual server and the real servers behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvsRule {
	pub name: String,
	pub virtual_server: SocketAddr,
	pub real_servers: Vec<SocketAddr>,
	pub health_path: String,
	pub health_scheme: String,
}

impl LvsRule {
	/// Real servers are sorted so every node programs an identical rule.
	pub fn new(name: &str, vip: IpAddr, port: u16, backends: &[IpAddr], scheme: &str) -> Self {
		let mut real_servers: Vec<SocketAddr> =
			backends.iter().map(|ip| SocketAddr::new(*ip, port)).collect();
		real_servers.sort();
		real_servers.dedup();
		Self {
			name: name.to_owned(),
			virtual_server: SocketAddr::new(vip, port),
			real_servers,
			health_path: "/".to_owned(),
			health_scheme: scheme.to_owned(),
		}
	}

	pub fn with_health_path(mut self, path: &str) -> Self {
		self.health_path = path.to_owned();
		self
	}

	fn args(&self) -> Vec<String> {
		let mut args = vec!["--vs".to_owned(), self.virtual_server.to_string()];
		for rs in &self.real_servers {
			args.push("--rs".to_owned());
			args.push(rs.to_string());
		}
		args.extend([
			"--health-path".to_owned(),
			self.health_path.clone(),
			"--health-schem".to_owned(),
			self.health_scheme.clone(),
		]);
		args
	}

	/// Programs the rule once on the host.
	pub fn apply_cmd(&self) -> String {
		format!("lvscare care {} --run-once", self.args().join(" "))
	}

	pub fn pod_path(&self) -> String {
		format!("{STATIC_POD_DIR}/{}.yaml", self.name)
	}

	/// Static pod keeping the rule in place while the node runs.
	pub fn static_pod(&self, image: &str) -> Result<String> {
		let mut command = vec!["/usr/bin/lvscare".to_owned(), "care".to_owned()];
		command.extend(self.args());
		command.extend(["--interval".to_owned(), "5".to_owned(), "--mode".to_owned(), "link".to_owned()]);
		let pod = json!({
			"apiVersion": "v1",
			"kind": "Pod",
			"metadata": {
				"name": self.name,
				"namespace": "kube-system",
				"labels": { "app": self.name, "component": self.name },
			},
			"spec": {
				"hostNetwork": true,
				"priorityClassName": "system-node-critical",
				"containers": [{
					"name": self.name,
					"image": image,
					"imagePullPolicy": "IfNotPresent",
					"command": command,
					"securityContext": { "privileged": true },
					"volumeMounts": [{ "name": "lib-modules", "mountPath": "/lib/modules", "readOnly": true }],
				}],
				"volumes": [{ "name": "lib-modules", "hostPath": { "path": "/lib/modules" } }],
			},
		});
		Ok(serde_yaml::to_string(&pod)?)
	}
}

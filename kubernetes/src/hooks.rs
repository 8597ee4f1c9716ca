//! Lifecycle hooks: named callbacks bound to a phase, run in registration order.

use crate::cluster::Plugin;
use crate::error::{ClusterError, Result};
use crate::infradriver::InfraDriver;
use futures::{FutureExt, future::BoxFuture};
use kubefleet_infra::exec;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, net::IpAddr, sync::Arc};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
	#[serde(rename = "pre-install")]
	PreInstall,
	#[serde(rename = "post-install")]
	PostInstall,
	#[serde(rename = "pre-scale-up")]
	PreScaleUp,
	#[serde(rename = "post-scale-up")]
	PostScaleUp,
	#[serde(rename = "pre-uninstall")]
	PreUnInstall,
	#[serde(rename = "post-uninstall")]
	PostUnInstall,
	#[serde(rename = "pre-init-host")]
	PreInitHost,
	#[serde(rename = "post-init-host")]
	PostInitHost,
	#[serde(rename = "pre-clean-host")]
	PreCleanHost,
	#[serde(rename = "post-clean-host")]
	PostCleanHost,
	#[serde(rename = "rollback")]
	Rollback,
	#[serde(rename = "upgrade")]
	Upgrade,
	#[serde(rename = "pre-join")]
	PreJoin,
}

impl Phase {
	/// Host phases run against an explicit host subset.
	pub fn is_host_phase(self) -> bool {
		matches!(
			self,
			Phase::PreInitHost
				| Phase::PostInitHost
				| Phase::PreCleanHost
				| Phase::PostCleanHost
				| Phase::PreJoin
		)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Phase::PreInstall => "pre-install",
			Phase::PostInstall => "post-install",
			Phase::PreScaleUp => "pre-scale-up",
			Phase::PostScaleUp => "post-scale-up",
			Phase::PreUnInstall => "pre-uninstall",
			Phase::PostUnInstall => "post-uninstall",
			Phase::PreInitHost => "pre-init-host",
			Phase::PostInitHost => "post-init-host",
			Phase::PreCleanHost => "pre-clean-host",
			Phase::PostCleanHost => "post-clean-host",
			Phase::Rollback => "rollback",
			Phase::Upgrade => "upgrade",
			Phase::PreJoin => "pre-join",
		}
	}
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

pub type ClusterHook = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type HostHook = Box<dyn Fn(Vec<IpAddr>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Named<F> {
	name: String,
	run: F,
}

/// Phase to hooks mapping, frozen once built.
#[derive(Default)]
pub struct HookRunner {
	cluster: HashMap<Phase, Vec<Named<ClusterHook>>>,
	host: HashMap<Phase, Vec<Named<HostHook>>>,
}

impl HookRunner {
	pub fn builder() -> HookRunnerBuilder {
		HookRunnerBuilder::default()
	}

	/// Runs every cluster hook of `phase`, stopping at the first failure.
	pub async fn run_phase(&self, phase: Phase) -> Result<()> {
		let Some(hooks) = self.cluster.get(&phase) else {
			return Ok(());
		};
		for hook in hooks {
			info!("Running {phase} hook {}.", hook.name);
			(hook.run)().await.map_err(|err| hook_error(phase, &hook.name, err))?;
		}
		Ok(())
	}

	/// Runs every host hook of `phase` against `hosts`, stopping at the first failure.
	pub async fn run_host_phase(&self, phase: Phase, hosts: &[IpAddr]) -> Result<()> {
		if hosts.is_empty() {
			return Ok(());
		}
		let Some(hooks) = self.host.get(&phase) else {
			return Ok(());
		};
		for hook in hooks {
			info!("Running {phase} hook {} on {} hosts.", hook.name, hosts.len());
			(hook.run)(hosts.to_vec())
				.await
				.map_err(|err| hook_error(phase, &hook.name, err))?;
		}
		Ok(())
	}
}

fn hook_error(phase: Phase, name: &str, err: ClusterError) -> ClusterError {
	ClusterError::Hook {
		phase: phase.to_string(),
		name: name.to_owned(),
		source: Box::new(err),
	}
}

#[derive(Default)]
pub struct HookRunnerBuilder {
	runner: HookRunner,
}

impl HookRunnerBuilder {
	pub fn cluster_hook<F>(mut self, phase: Phase, name: &str, run: F) -> Self
	where
		F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
	{
		self.runner.cluster.entry(phase).or_default().push(Named {
			name: name.to_owned(),
			run: Box::new(run),
		});
		self
	}

	pub fn host_hook<F>(mut self, phase: Phase, name: &str, run: F) -> Self
	where
		F: Fn(Vec<IpAddr>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
	{
		self.runner.host.entry(phase).or_default().push(Named {
			name: name.to_owned(),
			run: Box::new(run),
		});
		self
	}

	/// Turns shell plugins into hooks.
	///
	/// Cluster phase plugins run on master0. Host phase plugins run on the
	/// given hosts whose roles intersect the plugin scope.
	pub fn plugins(mut self, plugins: &[Plugin], driver: Arc<dyn InfraDriver>) -> Self {
		for plugin in plugins {
			let shell = plugin.shell.clone();
			let driver = driver.clone();
			if plugin.phase.is_host_phase() {
				let scope = plugin.scope.clone();
				self = self.host_hook(plugin.phase, &plugin.name, move |hosts| {
					let driver = driver.clone();
					let shell = shell.clone();
					let targets: Vec<IpAddr> = hosts
						.into_iter()
						.filter(|host| {
							scope.is_empty()
								|| driver.roles_of(host).iter().any(|role| scope.contains(role))
						})
						.collect();
					async move {
						exec::execute(&targets, |host| {
							let driver = driver.clone();
							let shell = shell.clone();
							async move { driver.cmd_async(host, &driver.host_env(&host), &shell).await }
						})
						.await?;
						Ok(())
					}
					.boxed()
				});
			} else {
				self = self.cluster_hook(plugin.phase, &plugin.name, move || {
					let driver = driver.clone();
					let shell = shell.clone();
					async move {
						let master0 = driver.master0()?;
						driver.cmd_async(master0, &driver.host_env(&master0), &shell).await
					}
					.boxed()
				});
			}
		}
		self
	}

	pub fn build(self) -> HookRunner {
		self.runner
	}
}

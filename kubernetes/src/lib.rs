//! Kubernetes cluster lifecycle across a fleet of hosts: install, scale,
//! upgrade, roll back and delete, driven over SSH from one machine.

pub mod cluster;
pub mod clusterfile;
pub mod config;
pub mod container_runtime;
pub mod distributor;
pub mod error;
pub mod hooks;
pub mod infradriver;
pub mod installer;
pub mod ipvs;
pub mod kube;
pub mod registry;

#[cfg(test)]
mod testing;

pub use error::{ClusterError, Result};
pub use installer::Installer;

//! Persisted desired state.

use crate::cluster::Cluster;
use crate::error::{ClusterError, Result};
use std::{
	fs, io,
	path::{Path, PathBuf},
};
use tracing::{debug, info};

pub fn load(path: &Path) -> Result<Cluster> {
	let text = fs::read_to_string(path).map_err(|err| match err.kind() {
		io::ErrorKind::NotFound => {
			ClusterError::Config(format!("no Clusterfile at {}", path.display()))
		}
		_ => err.into(),
	})?;
	let cluster: Cluster = serde_yaml::from_str(&text)?;
	cluster.validate()?;
	Ok(cluster)
}

/// Writes through a temporary file so a crash never leaves a torn Clusterfile.
pub fn save(path: &Path, cluster: &Cluster) -> Result<()> {
	write_atomic(path, &serde_yaml::to_string(cluster)?)?;
	debug!("Saved Clusterfile to {}.", path.display());
	Ok(())
}

fn write_atomic(path: &Path, text: &str) -> Result<()> {
	if let Some(dir) = path.parent() {
		fs::create_dir_all(dir)?;
	}
	let tmp = path.with_extension("tmp");
	fs::write(&tmp, text)?;
	fs::rename(&tmp, path)?;
	Ok(())
}

/// A Clusterfile as it was before an operation rewrote it.
#[derive(Debug)]
pub struct Snapshot {
	path: PathBuf,
	text: Option<String>,
}

impl Snapshot {
	pub fn take(path: &Path) -> Result<Self> {
		let text = match fs::read_to_string(path) {
			Ok(text) => Some(text),
			Err(err) if err.kind() == io::ErrorKind::NotFound => None,
			Err(err) => return Err(err.into()),
		};
		Ok(Self {
			path: path.to_path_buf(),
			text,
		})
	}

	/// Puts the earlier contents back, or removes the file if there was none.
	pub fn restore(&self) -> Result<()> {
		match &self.text {
			Some(text) => write_atomic(&self.path, text)?,
			None => remove(&self.path)?,
		}
		info!("Restored {}.", self.path.display());
		Ok(())
	}
}

/// Removes `path`. A missing file is not an error.
pub fn remove(path: &Path) -> Result<()> {
	match fs::remove_file(path) {
		Ok(()) => {
			info!("Removed {}.", path.display());
			Ok(())
		}
		Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
		Err(err) => Err(err.into()),
	}
}

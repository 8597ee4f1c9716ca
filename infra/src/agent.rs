use crate::error::InfraError;
use russh::{
	ChannelMsg, Disconnect, Preferred,
	client::{Config, Handle, Handler, connect},
	keys::{key::PrivateKeyWithHashAlg, load_secret_key, ssh_key::PublicKey},
};
use std::{
	borrow::Cow,
	net::IpAddr,
	os::unix::fs::PermissionsExt,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};
use tokio::{fs::File, io::AsyncRead, time::timeout};
use tracing::debug;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_KEY: &str = ".ssh/id_ed25519";

struct SshClient {}

impl Handler for SshClient {
	type Error = russh::Error;

	async fn check_server_key(
		&mut self,
		_server_public_key: &PublicKey,
	) -> Result<bool, Self::Error> {
		Ok(true)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshAuth {
	pub user: String,
	pub port: u16,
	pub private_key: Option<PathBuf>,
	pub password: Option<String>,
}

impl Default for SshAuth {
	fn default() -> Self {
		Self {
			user: "root".to_owned(),
			port: 22,
			private_key: None,
			password: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
	PublicKey(PathBuf),
	Password(String),
}

impl SshAuth {
	/// Methods to offer, in order.
	///
	/// A configured key goes first with the password as fallback. The key under
	/// `home` is only tried when no password was given.
	pub fn methods(&self, home: Option<&Path>) -> Vec<AuthMethod> {
		let mut methods = Vec::new();
		match (&self.private_key, &self.password) {
			(Some(key), _) => methods.push(AuthMethod::PublicKey(key.clone())),
			(None, None) => methods.extend(
				home.map(|home| home.join(DEFAULT_KEY))
					.filter(|path| path.exists())
					.map(AuthMethod::PublicKey),
			),
			(None, Some(_)) => {}
		}
		if let Some(password) = &self.password {
			methods.push(AuthMethod::Password(password.clone()));
		}
		methods
	}
}

#[derive(Debug, Clone)]
pub struct Output {
	pub code: u32,
	pub stdout: Vec<u8>,
}

/// One authenticated SSH session to a single host.
pub struct Agent {
	host: IpAddr,
	session: Handle<SshClient>,
}

impl Agent {
	pub async fn connect(host: IpAddr, auth: &SshAuth) -> Result<Self, InfraError> {
		let config = Config {
			inactivity_timeout: Some(Duration::from_secs(600)),
			keepalive_interval: Some(Duration::from_secs(15)),
			preferred: Preferred {
				kex: Cow::Owned(vec![
					russh::kex::CURVE25519_PRE_RFC_8731,
					russh::kex::EXTENSION_SUPPORT_AS_CLIENT,
				]),
				..Default::default()
			},
			..<_>::default()
		};
		let config = Arc::new(config);
		let ssh_err = |source: russh::Error| InfraError::Ssh { host, source };
		let mut session = timeout(CONNECT_TIMEOUT, connect(config, (host, auth.port), SshClient {}))
			.await
			.map_err(|_| InfraError::Timeout {
				host,
				after: CONNECT_TIMEOUT,
			})?
			.map_err(ssh_err)?;
		let home = std::env::var_os("HOME").map(PathBuf::from);
		let mut success = false;
		for method in auth.methods(home.as_deref()) {
			success = authenticate(&mut session, &auth.user, &method)
				.await
				.map_err(|err| match err {
					AuthError::Ssh(source) => ssh_err(source),
					AuthError::Keys(err) => err,
				})?;
			if success {
				break;
			}
			if let AuthMethod::PublicKey(path) = &method {
				debug!(%host, "Key {} rejected.", path.display());
			}
		}
		if !success {
			return Err(InfraError::Auth {
				host,
				user: auth.user.clone(),
			});
		}
		Ok(Self { host, session })
	}

	pub fn host(&self) -> IpAddr {
		self.host
	}

	/// Runs `command` through bash and returns its exit code with stdout and stderr combined.
	pub async fn execute(&self, command: &str) -> Result<Output, InfraError> {
		debug!(host = %self.host, "exec: {command}");
		let cmd = format!("/bin/bash -c {}", quote(command));
		self.run(command, cmd, None::<&[u8]>).await
	}

	/// Writes `contents` to `remote_path`, creating parent directories.
	pub async fn upload(&self, contents: &[u8], remote_path: &str) -> Result<(), InfraError> {
		self.upload_from(upload_script(remote_path, None), contents).await
	}

	/// Streams the file at `local` to `remote_path` and keeps its permission bits.
	pub async fn upload_file(&self, local: &Path, remote_path: &str) -> Result<(), InfraError> {
		let file = File::open(local).await?;
		let mode = file.metadata().await?.permissions().mode() & 0o7777;
		self.upload_from(upload_script(remote_path, Some(mode)), file).await
	}

	async fn upload_from<R: AsyncRead + Unpin>(
		&self,
		script: String,
		data: R,
	) -> Result<(), InfraError> {
		let cmd = format!("/bin/bash -c {}", quote(&script));
		let output = self.run(&script, cmd, Some(data)).await?;
		if output.code != 0 {
			return Err(InfraError::CommandFailed {
				host: self.host,
				cmd: script,
				code: output.code,
				output: String::from_utf8_lossy(&output.stdout).trim().to_owned(),
			});
		}
		Ok(())
	}

	async fn run<R: AsyncRead + Unpin>(
		&self,
		display: &str,
		cmd: String,
		stdin: Option<R>,
	) -> Result<Output, InfraError> {
		let ssh_err = |source| InfraError::Ssh {
			host: self.host,
			source,
		};
		let mut channel = self.session.channel_open_session().await.map_err(ssh_err)?;
		channel.exec(true, cmd).await.map_err(ssh_err)?;
		if let Some(data) = stdin {
			channel.data(data).await.map_err(ssh_err)?;
			channel.eof().await.map_err(ssh_err)?;
		}
		let mut code = None;
		let mut output = Vec::new();
		loop {
			let Some(msg) = channel.wait().await else {
				break;
			};
			match msg {
				ChannelMsg::Data { ref data } | ChannelMsg::ExtendedData { ref data, .. } => {
					output.extend_from_slice(data);
				}
				ChannelMsg::ExitStatus { exit_status } => {
					code = Some(exit_status);
				}
				_ => {}
			}
		}
		let Some(code) = code else {
			return Err(InfraError::NoExitStatus {
				host: self.host,
				cmd: display.to_owned(),
			});
		};
		Ok(Output {
			code,
			stdout: output,
		})
	}

	pub async fn close(&self) -> Result<(), InfraError> {
		self.session
			.disconnect(Disconnect::ByApplication, "Disconnected", "English")
			.await
			.map_err(|source| InfraError::Ssh {
				host: self.host,
				source,
			})?;
		Ok(())
	}
}

enum AuthError {
	Ssh(russh::Error),
	Keys(InfraError),
}

async fn authenticate(
	session: &mut Handle<SshClient>,
	user: &str,
	method: &AuthMethod,
) -> Result<bool, AuthError> {
	match method {
		AuthMethod::Password(password) => Ok(session
			.authenticate_password(user, password)
			.await
			.map_err(AuthError::Ssh)?
			.success()),
		AuthMethod::PublicKey(path) => {
			let key_pair = load_secret_key(path, None).map_err(|source| {
				AuthError::Keys(InfraError::Keys {
					path: path.display().to_string(),
					source,
				})
			})?;
			let hash = session
				.best_supported_rsa_hash()
				.await
				.map_err(AuthError::Ssh)?
				.flatten();
			Ok(session
				.authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash))
				.await
				.map_err(AuthError::Ssh)?
				.success())
		}
	}
}

fn upload_script(remote_path: &str, mode: Option<u32>) -> String {
	let parent = remote_path
		.rsplit_once('/')
		.map(|(dir, _)| dir)
		.filter(|dir| !dir.is_empty())
		.unwrap_or("/");
	let mut script = format!("mkdir -p {} && cat > {}", quote(parent), quote(remote_path));
	if let Some(mode) = mode {
		script.push_str(&format!(" && chmod {mode:04o} {}", quote(remote_path)));
	}
	script
}

/// Single-quotes `value` for a POSIX shell.
pub fn quote(value: &str) -> String {
	format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn quote_escapes_single_quotes() {
		assert_eq!(quote("echo hi"), "'echo hi'");
		assert_eq!(quote("it's"), r"'it'\''s'");
	}

	fn home_with_default_key() -> tempfile::TempDir {
		let home = tempfile::tempdir().unwrap();
		std::fs::create_dir(home.path().join(".ssh")).unwrap();
		std::fs::write(home.path().join(DEFAULT_KEY), "key").unwrap();
		home
	}

	#[test]
	fn explicit_private_key_wins_with_password_fallback() {
		let auth = SshAuth {
			private_key: Some(PathBuf::from("/keys/id")),
			password: Some("secret".into()),
			..SshAuth::default()
		};
		assert_eq!(
			auth.methods(None),
			vec![
				AuthMethod::PublicKey(PathBuf::from("/keys/id")),
				AuthMethod::Password("secret".into())
			]
		);
	}

	#[test]
	fn password_is_used_even_when_a_default_key_exists() {
		let home = home_with_default_key();
		let auth = SshAuth {
			password: Some("secret".into()),
			..SshAuth::default()
		};
		assert_eq!(
			auth.methods(Some(home.path())),
			vec![AuthMethod::Password("secret".into())]
		);
	}

	#[test]
	fn default_key_is_used_without_a_password() {
		let home = home_with_default_key();
		let auth = SshAuth::default();
		assert_eq!(
			auth.methods(Some(home.path())),
			vec![AuthMethod::PublicKey(home.path().join(DEFAULT_KEY))]
		);
		assert!(auth.methods(Some(Path::new("/nonexistent"))).is_empty());
	}

	#[test]
	fn uploaded_files_keep_their_mode() {
		let dir = tempfile::tempdir().unwrap();
		let script = dir.path().join("init.sh");
		std::fs::write(&script, "#!/bin/bash\n").unwrap();
		std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
		let mode = std::fs::metadata(&script).unwrap().permissions().mode() & 0o7777;
		assert_eq!(
			upload_script("/var/lib/kubefleet/rootfs/scripts/init.sh", Some(mode)),
			"mkdir -p '/var/lib/kubefleet/rootfs/scripts' && cat > '/var/lib/kubefleet/rootfs/scripts/init.sh' \
			 && chmod 0755 '/var/lib/kubefleet/rootfs/scripts/init.sh'"
		);
		assert_eq!(upload_script("/hosts", None), "mkdir -p '/' && cat > '/hosts'");
	}
}

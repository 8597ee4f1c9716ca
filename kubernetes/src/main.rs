use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use kubefleet::cluster::{Cluster, HostGroup, MASTER, NODE, SshConfig};
use kubefleet::clusterfile;
use kubefleet::config::{ClusterPaths, InstallerOptions, RuntimeConfig};
use kubefleet::distributor::{ImageMount, ImageMounter, ScpDistributor};
use kubefleet::infradriver::{InfraDriver, SshInfraDriver};
use kubefleet::installer::Installer;
use kubefleet::registry::RegistryDriver;
use kubefleet_infra::logging;
use std::{net::IpAddr, path::PathBuf, process, sync::Arc};
use tracing::{Level, error, info, warn};

#[derive(Parser)]
#[command(name = "kubefleet", version, about = "Kubernetes cluster lifecycle over SSH.")]
struct Cli {
	/// Log at debug level unless RUST_LOG says otherwise.
	#[arg(long, global = true)]
	debug: bool,
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Install a new cluster.
	Run(RunArgs),
	/// Join hosts to a running cluster.
	ScaleUp(HostArgs),
	/// Remove hosts from a running cluster.
	ScaleDown(HostArgs),
	/// Delete the whole cluster, or the given hosts.
	Delete(DeleteArgs),
	/// Move the cluster to a new image.
	Upgrade(ImageArgs),
	/// Move the cluster back to a previous image.
	Rollback(ImageArgs),
}

#[derive(Args)]
struct Target {
	#[arg(long, short = 'c', env = "KUBEFLEET_CLUSTER", default_value = "my-cluster")]
	cluster: String,
}

#[derive(Args)]
struct RunArgs {
	#[command(flatten)]
	target: Target,
	/// Cluster image. Overrides the Clusterfile's image when both are given.
	#[arg(required_unless_present = "clusterfile")]
	image: Option<String>,
	/// Install from a Clusterfile instead of flags.
	#[arg(long, short = 'f')]
	clusterfile: Option<PathBuf>,
	#[arg(long, short = 'm', value_delimiter = ',', required_unless_present = "clusterfile")]
	masters: Vec<IpAddr>,
	#[arg(long, short = 'n', value_delimiter = ',')]
	nodes: Vec<IpAddr>,
	#[arg(long, short = 'u', default_value = "root")]
	user: String,
	#[arg(long, short = 'p', env = "KUBEFLEET_SSH_PASSWORD")]
	passwd: Option<String>,
	#[arg(long)]
	pk: Option<PathBuf>,
	#[arg(long, default_value_t = 22)]
	port: u16,
	/// Cluster environment as KEY=VALUE, repeatable.
	#[arg(long, short = 'e')]
	env: Vec<String>,
}

#[derive(Args)]
struct HostArgs {
	#[command(flatten)]
	target: Target,
	#[arg(long, short = 'm', value_delimiter = ',')]
	masters: Vec<IpAddr>,
	#[arg(long, short = 'n', value_delimiter = ',')]
	nodes: Vec<IpAddr>,
}

#[derive(Args)]
struct DeleteArgs {
	#[command(flatten)]
	hosts: HostArgs,
	/// Delete the whole cluster.
	#[arg(long, short = 'a', conflicts_with_all = ["masters", "nodes"])]
	all: bool,
	/// Also remove the generated registry certificate and credentials.
	#[arg(long)]
	prune: bool,
	/// Skip hosts that cannot be reached.
	#[arg(long)]
	force: bool,
}

#[derive(Args)]
struct ImageArgs {
	#[command(flatten)]
	target: Target,
	image: String,
}

impl RunArgs {
	fn cluster(&self) -> Result<Cluster> {
		let mut cluster = match &self.clusterfile {
			Some(path) => clusterfile::load(path)?,
			None => {
				let Some(image) = &self.image else {
					bail!("an image is required without a Clusterfile");
				};
				let mut cluster = Cluster::new(&self.target.cluster, image);
				cluster.hosts.push(HostGroup::new(self.masters.clone(), MASTER));
				if !self.nodes.is_empty() {
					cluster.hosts.push(HostGroup::new(self.nodes.clone(), NODE));
				}
				cluster.ssh = SshConfig {
					user: self.user.clone(),
					port: self.port,
					pk: self.pk.clone(),
					passwd: self.passwd.clone(),
				};
				cluster
			}
		};
		if let Some(image) = &self.image {
			cluster.image = image.clone();
		}
		for pair in &self.env {
			let (key, value) = pair
				.split_once('=')
				.with_context(|| format!("--env {pair} is not KEY=VALUE"))?;
			cluster.env.insert(key.to_owned(), value.to_owned());
		}
		cluster.validate()?;
		Ok(cluster)
	}
}

/// Live connections and the mounted image for one operation.
struct Session {
	driver: Arc<SshInfraDriver>,
	mounter: ImageMounter,
	mount: ImageMount,
	mounted: bool,
}

impl Session {
	fn open(paths: &ClusterPaths, cluster: Cluster) -> Result<Self> {
		let mounter = ImageMounter::new(paths.images_dir(), paths.mounts_dir());
		let mount = mounter.mount(&cluster.image)?;
		let driver = match SshInfraDriver::new(cluster) {
			Ok(driver) => Arc::new(driver),
			Err(err) => {
				mounter.umount(&mount);
				return Err(err.into());
			}
		};
		Ok(Self {
			driver,
			mounter,
			mount,
			mounted: true,
		})
	}

	/// For teardown, which only removes content and never reads the image.
	fn open_unmounted(paths: &ClusterPaths, cluster: Cluster) -> Result<Self> {
		let mount = ImageMount {
			image: cluster.image.clone(),
			path: paths.mounts_dir(),
		};
		Ok(Self {
			driver: Arc::new(SshInfraDriver::new(cluster)?),
			mounter: ImageMounter::new(paths.images_dir(), paths.mounts_dir()),
			mount,
			mounted: false,
		})
	}

	fn installer(&self, paths: &ClusterPaths, options: InstallerOptions) -> Installer {
		let cluster = self.driver.cluster();
		let config = RuntimeConfig {
			distributor: Arc::new(ScpDistributor::new(self.mount.clone(), self.driver.clone())),
			plugins: cluster.plugins.clone(),
			container_runtime: cluster.container_runtime.clone(),
			kubeadm: cluster.kubeadm.clone(),
			options,
		};
		Installer::new(self.driver.clone(), config, paths.clone())
	}

	async fn close(self) {
		self.driver.close().await;
		if self.mounted {
			self.mounter.umount(&self.mount);
		}
	}
}

fn record_registry(cluster: &mut Cluster, registry: &RegistryDriver) {
	if let Some(local) = cluster.local_registry_mut() {
		local.deploy_hosts = registry.deploy_hosts().to_vec();
	}
}

async fn run(args: RunArgs, paths: &ClusterPaths) -> Result<()> {
	let mut cluster = args.cluster()?;
	let path = paths.clusterfile(&cluster.name);
	clusterfile::save(&path, &cluster)?;
	let session = Session::open(paths, cluster.clone())?;
	let result = session.installer(paths, InstallerOptions::default()).install().await;
	session.close().await;
	let (registry, kube) = result?;
	record_registry(&mut cluster, &registry);
	clusterfile::save(&path, &cluster)?;
	info!(
		"Cluster {} is ready, kubectl runs on {} and images are served from {}.",
		cluster.name,
		kube.anchor(),
		registry.endpoint()
	);
	Ok(())
}

async fn scale_up(args: HostArgs, paths: &ClusterPaths) -> Result<()> {
	let path = paths.clusterfile(&args.target.cluster);
	let mut cluster = clusterfile::load(&path)?;
	let snapshot = clusterfile::Snapshot::take(&path)?;
	let (masters, nodes) = cluster.construct_for_scale_up(&args.masters, &args.nodes);
	if masters.is_empty() && nodes.is_empty() {
		info!("Every requested host is already in cluster {}.", cluster.name);
		return Ok(());
	}
	clusterfile::save(&path, &cluster)?;
	let result = async {
		let session = Session::open(paths, cluster.clone())?;
		let result = session
			.installer(paths, InstallerOptions::default())
			.scale_up(&masters, &nodes)
			.await;
		session.close().await;
		Ok::<_, anyhow::Error>(result?)
	}
	.await;
	let (registry, _) = match result {
		Ok(joined) => joined,
		Err(err) => {
			// a retry must see the failed hosts as new again
			if let Err(restore_err) = snapshot.restore() {
				warn!("Failed to restore {}: {restore_err}", path.display());
			}
			return Err(err);
		}
	};
	record_registry(&mut cluster, &registry);
	clusterfile::save(&path, &cluster)?;
	Ok(())
}

async fn scale_down(args: HostArgs, paths: &ClusterPaths, options: InstallerOptions) -> Result<()> {
	let path = paths.clusterfile(&args.target.cluster);
	let cluster = clusterfile::load(&path)?;
	let mut reduced = cluster.clone();
	reduced.construct_for_scale_down(&args.masters, &args.nodes)?;
	// the driver needs the departing hosts to reach them
	let session = Session::open(paths, cluster)?;
	let result = session
		.installer(paths, options)
		.scale_down(&args.masters, &args.nodes)
		.await;
	session.close().await;
	let (registry, _) = result?;
	record_registry(&mut reduced, &registry);
	clusterfile::save(&path, &reduced)?;
	Ok(())
}

async fn delete(args: DeleteArgs, paths: &ClusterPaths) -> Result<()> {
	let options = InstallerOptions {
		prune: args.prune,
		force: args.force,
	};
	if !args.all {
		if args.hosts.masters.is_empty() && args.hosts.nodes.is_empty() {
			bail!("pass --all to delete the whole cluster, or --masters/--nodes to delete hosts");
		}
		return scale_down(args.hosts, paths, options).await;
	}
	let cluster = clusterfile::load(&paths.clusterfile(&args.hosts.target.cluster))?;
	let session = Session::open_unmounted(paths, cluster)?;
	let result = session.installer(paths, options).uninstall().await;
	session.close().await;
	result?;
	Ok(())
}

async fn change_image(args: ImageArgs, paths: &ClusterPaths, rollback: bool) -> Result<()> {
	let path = paths.clusterfile(&args.target.cluster);
	let mut cluster = clusterfile::load(&path)?;
	cluster.image = args.image;
	clusterfile::save(&path, &cluster)?;
	let session = Session::open(paths, cluster.clone())?;
	let installer = session.installer(paths, InstallerOptions::default());
	let result = if rollback {
		installer.rollback().await
	} else {
		installer.upgrade().await
	};
	session.close().await;
	let registry = result?;
	record_registry(&mut cluster, &registry);
	clusterfile::save(&path, &cluster)?;
	Ok(())
}

async fn execute(command: Command) -> Result<()> {
	let paths = ClusterPaths::from_env();
	match command {
		Command::Run(args) => run(args, &paths).await,
		Command::ScaleUp(args) => scale_up(args, &paths).await,
		Command::ScaleDown(args) => scale_down(args, &paths, InstallerOptions::default()).await,
		Command::Delete(args) => delete(args, &paths).await,
		Command::Upgrade(args) => change_image(args, &paths, false).await,
		Command::Rollback(args) => change_image(args, &paths, true).await,
	}
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	let level = if cli.debug { Level::DEBUG } else { Level::INFO };
	logging::init("kubefleet", level);
	if let Err(err) = execute(cli.command).await {
		error!("{err:#}");
		process::exit(1);
	}
}

//! Command line surface
//!
//! The `clap` derive types for every command, and the handlers that turn
//! them into library calls. Top-level flags are collected into a
//! [`GlobalConfig`] that each handler receives through [`Context`].

pub mod container;
pub mod image;
pub mod network;
pub mod volume;

use crate::config::{
    GlobalConfig, DEFAULT_ADDRESS, DEFAULT_CNI_NETCONFPATH, DEFAULT_CNI_PATH, DEFAULT_DATA_ROOT,
    DEFAULT_NAMESPACE, DEFAULT_SNAPSHOTTER,
};
use crate::container::{format, ContainerManager};
use crate::daemon::{self, Client, Scope};
use crate::error::{Result, RuneError};
use crate::image::{Fetcher, ImageStore, Pusher, RegistryClient};
use crate::runtime::{Mounter, SystemMounter};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// runectl - Docker-compatible command line for containerd
#[derive(Parser, Debug)]
#[command(name = "runectl")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "A Docker-compatible command line for containerd", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags accepted before the command name
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// containerd address
    #[arg(long, env = "CONTAINERD_ADDRESS", default_value = DEFAULT_ADDRESS)]
    pub address: String,
    /// containerd namespace
    #[arg(short = 'n', long, env = "CONTAINERD_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,
    /// containerd snapshotter
    #[arg(long, env = "CONTAINERD_SNAPSHOTTER", default_value = DEFAULT_SNAPSHOTTER)]
    pub snapshotter: String,
    /// Directories holding the CNI plugin binaries
    #[arg(long, env = "CNI_PATH", default_value = DEFAULT_CNI_PATH)]
    pub cni_path: String,
    /// Directory holding the CNI network configurations
    #[arg(long, env = "NETCONFPATH", default_value = DEFAULT_CNI_NETCONFPATH)]
    pub cni_netconfpath: PathBuf,
    /// Root directory of persistent state
    #[arg(long, default_value = DEFAULT_DATA_ROOT)]
    pub data_root: PathBuf,
    /// Allow plain HTTP and unverified TLS registries
    #[arg(long)]
    pub insecure_registry: bool,
    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl GlobalArgs {
    pub fn config(&self) -> GlobalConfig {
        GlobalConfig {
            address: self.address.clone(),
            namespace: self.namespace.clone(),
            snapshotter: self.snapshotter.clone(),
            cni_path: self.cni_path.clone(),
            cni_netconfpath: self.cni_netconfpath.clone(),
            data_root: self.data_root.clone(),
            insecure_registry: self.insecure_registry,
            debug: self.debug,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create and start a container
    Run(container::RunArgs),
    /// Create a container without starting it
    Create(container::RunArgs),
    /// Run a command in a running container
    Exec(container::ExecArgs),
    /// Start one or more stopped containers
    Start(container::StartArgs),
    /// Stop one or more running containers
    Stop(container::StopArgs),
    /// Remove one or more containers
    #[command(name = "rm")]
    Remove(container::RemoveArgs),
    /// Send a signal to one or more running containers
    Kill(container::KillArgs),
    /// Pause all processes within one or more containers
    Pause(container::TargetsArgs),
    /// Unpause all processes within one or more containers
    Unpause(container::TargetsArgs),
    /// Block until containers stop, then print their exit codes
    Wait(container::TargetsArgs),
    /// List containers
    Ps(container::PsArgs),
    /// Fetch the logs of a container
    Logs(container::LogsArgs),
    /// List port mappings of a container
    Port(container::PortArgs),
    /// Display detailed information on containers or images
    Inspect(InspectArgs),

    /// Pull an image from a registry
    Pull(image::PullArgs),
    /// Push an image to a registry
    Push(image::PushArgs),
    /// Load images from a tar archive
    Load(image::LoadArgs),
    /// Save images to a tar archive
    Save(image::SaveArgs),
    /// Create a tag TARGET that refers to SOURCE
    Tag(image::TagArgs),
    /// Remove one or more images
    Rmi(image::RmiArgs),
    /// List images
    Images(image::ImagesArgs),

    /// Manage networks
    #[command(subcommand)]
    Network(network::NetworkCommand),
    /// Manage volumes
    #[command(subcommand)]
    Volume(volume::VolumeCommand),
}

/// `inspect` flags
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Only inspect objects of this type (container or image)
    #[arg(long = "type")]
    pub kind: Option<String>,
    /// Format the output using a template
    #[arg(short, long)]
    pub format: Option<String>,
    /// Container or image names and IDs
    #[arg(required = true)]
    pub names: Vec<String>,
}

/// Daemon connection and collaborators shared by the handlers
pub struct Context {
    pub config: GlobalConfig,
    pub client: Client,
    pub scope: Scope,
    fetcher: Arc<dyn Fetcher>,
    pusher: Arc<dyn Pusher>,
    mounter: Arc<dyn Mounter>,
    exe: PathBuf,
}

impl Context {
    /// Connect to the configured daemon
    pub async fn connect(config: GlobalConfig) -> Result<Self> {
        let (client, scope) = daemon::connect(&config.address, &config.namespace).await?;
        let registry = Arc::new(RegistryClient::new(config.insecure_registry)?);
        let exe = std::env::current_exe()?;
        debug!("connected to {} (namespace {})", config.address, config.namespace);
        Ok(Self {
            config,
            client,
            scope,
            fetcher: registry.clone(),
            pusher: registry,
            mounter: Arc::new(SystemMounter),
            exe,
        })
    }

    pub fn new(
        config: GlobalConfig,
        client: Client,
        fetcher: Arc<dyn Fetcher>,
        pusher: Arc<dyn Pusher>,
        mounter: Arc<dyn Mounter>,
        exe: PathBuf,
    ) -> Self {
        let scope = Scope::new(&config.namespace);
        Self {
            config,
            client,
            scope,
            fetcher,
            pusher,
            mounter,
            exe,
        }
    }

    pub fn containers(&self) -> ContainerManager {
        ContainerManager::new(
            self.client.clone(),
            self.scope.clone(),
            self.config.clone(),
            self.mounter.clone(),
            self.fetcher.clone(),
            self.exe.clone(),
        )
    }

    pub fn images(&self) -> ImageStore {
        ImageStore::new(self.client.clone(), &self.config.snapshotter)
    }

    pub fn fetcher(&self) -> &dyn Fetcher {
        self.fetcher.as_ref()
    }

    pub fn pusher(&self) -> &dyn Pusher {
        self.pusher.as_ref()
    }

    /// Cancel the request scope on the first Ctrl-C
    pub fn cancel_on_interrupt(&self) {
        let scope = self.scope.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("interrupted, canceling in-flight requests");
                scope.cancel();
            }
        });
    }
}

/// Errors that end a multi-target command instead of being reported per target
fn is_fatal(err: &RuneError) -> bool {
    matches!(
        err,
        RuneError::Canceled | RuneError::StopCanceled(_) | RuneError::UnreachableDaemon { .. }
    )
}

/// Apply `op` to every target in order.
///
/// Each success prints the line `op` returns on `out`; each failure prints
/// `Error response from daemon: <message>` on `err`. Fails with
/// [`RuneError::Aggregate`] when any target failed.
pub async fn for_each_target<F, Fut, O, E>(targets: &[String], out: &mut O, err: &mut E, mut op: F) -> Result<()>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<String>>,
    O: Write,
    E: Write,
{
    let mut failed = 0;
    for target in targets {
        match op(target.clone()).await {
            Ok(line) => writeln!(out, "{}", line)?,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                failed += 1;
                writeln!(err, "Error response from daemon: {}", e)?;
            }
        }
    }
    if failed > 0 {
        return Err(RuneError::Aggregate { failed });
    }
    Ok(())
}

/// Print a list of inspect documents, raw or through `--format`
pub(crate) fn print_documents(docs: &[Value], template: Option<&str>) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    match template {
        Some(t) => {
            for doc in docs {
                writeln!(stdout, "{}", format::render_template(t, doc)?)?;
            }
        }
        None => writeln!(stdout, "{}", serde_json::to_string_pretty(docs)?)?,
    }
    Ok(())
}

async fn inspect(ctx: &Context, args: &InspectArgs) -> Result<()> {
    let want_container = args.kind.as_deref().map_or(true, |k| k == "container");
    let want_image = args.kind.as_deref().map_or(true, |k| k == "image");
    if !want_container && !want_image {
        return Err(RuneError::usage(format!(
            "unsupported type {:?}, expected container or image",
            args.kind.as_deref().unwrap_or_default()
        )));
    }

    let manager = ctx.containers();
    let images = ctx.images();
    let mut docs = Vec::new();
    let mut failed = 0;
    for name in &args.names {
        if want_container {
            match manager.lookup(name).await {
                Ok(record) => {
                    docs.push(format::inspect(&manager.view(record).await?));
                    continue;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if want_image {
            if let Some(record) = images.resolve(&ctx.scope, name).await? {
                docs.push(image::inspect_document(&images, &ctx.scope, &record).await?);
                continue;
            }
        }
        failed += 1;
        eprintln!("Error response from daemon: no such object: {}", name);
    }
    print_documents(&docs, args.format.as_deref())?;
    if failed > 0 {
        return Err(RuneError::Aggregate { failed });
    }
    Ok(())
}

/// Run a parsed command line
pub async fn execute(cli: Cli) -> Result<()> {
    let config = cli.global.config();
    match cli.command {
        // Network and volume commands work on local state only.
        Commands::Network(cmd) => return network::run(&config, cmd).await,
        Commands::Volume(cmd) => return volume::run(&config, cmd).await,
        _ => {}
    }

    let ctx = Context::connect(config).await?;
    dispatch(&ctx, cli.command).await
}

/// Run a daemon-backed command against `ctx`
pub async fn dispatch(ctx: &Context, command: Commands) -> Result<()> {
    match command {
        Commands::Run(args) => container::run(ctx, &args).await,
        Commands::Create(args) => container::create(ctx, &args).await,
        Commands::Exec(args) => container::exec(ctx, &args).await,
        Commands::Start(args) => container::start(ctx, &args).await,
        Commands::Stop(args) => container::stop(ctx, &args).await,
        Commands::Remove(args) => container::remove(ctx, &args).await,
        Commands::Kill(args) => container::kill(ctx, &args).await,
        Commands::Pause(args) => container::pause(ctx, &args).await,
        Commands::Unpause(args) => container::unpause(ctx, &args).await,
        Commands::Wait(args) => container::wait(ctx, &args).await,
        Commands::Ps(args) => container::ps(ctx, &args).await,
        Commands::Logs(args) => container::logs(ctx, &args).await,
        Commands::Port(args) => container::port(ctx, &args).await,
        Commands::Inspect(args) => inspect(ctx, &args).await,
        Commands::Pull(args) => image::pull(ctx, &args).await,
        Commands::Push(args) => image::push(ctx, &args).await,
        Commands::Load(args) => image::load(ctx, &args).await,
        Commands::Save(args) => image::save(ctx, &args).await,
        Commands::Tag(args) => image::tag(ctx, &args).await,
        Commands::Rmi(args) => image::remove(ctx, &args).await,
        Commands::Images(args) => image::list(ctx, &args).await,
        Commands::Network(cmd) => network::run(&ctx.config, cmd).await,
        Commands::Volume(cmd) => volume::run(&ctx.config, cmd).await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::daemon::fake::FakeBackend;
    use crate::image::store::tests::MemoryRegistry;
    use crate::container::mounts::tests::CopyMounter;
    use crate::image::oci::ContainerConfig;

    /// A context over the fake daemon with `alpine` published
    pub(crate) fn context(dir: &std::path::Path) -> (FakeBackend, Context) {
        let fixture = dir.join("image-root");
        std::fs::create_dir_all(fixture.join("etc")).unwrap();
        let fake = FakeBackend::default();
        let mut registry = MemoryRegistry::default();
        registry.publish(
            "alpine",
            ContainerConfig {
                cmd: Some(vec!["/bin/sh".to_string()]),
                ..Default::default()
            },
            true,
        );
        let config = GlobalConfig {
            data_root: dir.join("data"),
            cni_netconfpath: dir.join("net.d"),
            ..GlobalConfig::default()
        };
        let ctx = Context::new(
            config,
            Client::from_backend(fake.clone()),
            Arc::new(registry),
            Arc::new(RegistryClient::new(false).unwrap()),
            Arc::new(CopyMounter::new(&fixture)),
            PathBuf::from("/usr/local/bin/runectl"),
        );
        (fake, ctx)
    }

    #[test]
    fn test_global_flags_before_command() {
        let cli = Cli::try_parse_from([
            "runectl",
            "--address",
            "unix:///run/k3s/containerd.sock",
            "-n",
            "k8s.io",
            "--insecure-registry",
            "ps",
        ])
        .unwrap();
        let config = cli.global.config();
        assert_eq!(config.address, "unix:///run/k3s/containerd.sock");
        assert_eq!(config.namespace, "k8s.io");
        assert!(config.insecure_registry);
        assert!(matches!(cli.command, Commands::Ps(_)));
    }

    #[test]
    fn test_rm_is_the_remove_command() {
        let cli = Cli::try_parse_from(["runectl", "rm", "-f", "a", "b"]).unwrap();
        match cli.command {
            Commands::Remove(args) => {
                assert!(args.force);
                assert_eq!(args.containers, vec!["a", "b"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_inspect_requires_a_name() {
        assert!(Cli::try_parse_from(["runectl", "inspect"]).is_err());
    }

    #[tokio::test]
    async fn test_for_each_target_reports_every_failure() {
        let targets = vec!["a".to_string(), "bad".to_string(), "c".to_string()];
        let mut out = Vec::new();
        let mut err = Vec::new();
        let res = for_each_target(&targets, &mut out, &mut err, |t| async move {
            if t == "bad" {
                Err(RuneError::NoSuchContainer(t))
            } else {
                Ok(t)
            }
        })
        .await;
        assert!(matches!(res, Err(RuneError::Aggregate { failed: 1 })));
        assert_eq!(String::from_utf8(out).unwrap(), "a\nc\n");
        assert_eq!(
            String::from_utf8(err).unwrap(),
            "Error response from daemon: no such container: bad\n"
        );
    }

    #[tokio::test]
    async fn test_for_each_target_stops_on_cancel() {
        let targets = vec!["a".to_string(), "b".to_string()];
        let mut seen = Vec::new();
        let res = for_each_target(&targets, &mut Vec::new(), &mut Vec::new(), |t| {
            seen.push(t);
            async { Err::<String, _>(RuneError::Canceled) }
        })
        .await;
        assert!(matches!(res, Err(RuneError::Canceled)));
        assert_eq!(seen, vec!["a"]);
    }
}

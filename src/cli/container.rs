//! Container commands

use super::{for_each_target, Context};
use crate::container::options::{
    parse_add_host, parse_signal, parse_size, CreateOptions, LogConfig, SecurityOptions,
};
use crate::container::{format, ExecOptions, RemoveOptions};
use crate::error::{Result, RuneError};
use crate::logging::{parse_time, read_logs, ReadOptions};
use crate::network::ports::parse_publish;
use crate::network::resolvconf::DnsConfig;
use crate::network::NetworkMode;
use chrono::Utc;
use clap::Args;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::debug;

/// Flags shared by `run` and `create`
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Keep STDIN open even if not attached
    #[arg(short, long)]
    pub interactive: bool,
    /// Allocate a pseudo-TTY
    #[arg(short, long)]
    pub tty: bool,
    /// Run container in background and print container ID
    #[arg(short, long)]
    pub detach: bool,
    /// Automatically remove the container when it exits
    #[arg(long)]
    pub rm: bool,
    /// Assign a name to the container
    #[arg(long)]
    pub name: Option<String>,
    /// Container host name
    #[arg(long)]
    pub hostname: Option<String>,
    /// Overwrite the default ENTRYPOINT of the image
    #[arg(long)]
    pub entrypoint: Option<String>,
    /// Working directory inside the container
    #[arg(short, long)]
    pub workdir: Option<String>,
    /// Set environment variables
    #[arg(short, long)]
    pub env: Vec<String>,
    /// Read in a file of environment variables
    #[arg(long)]
    pub env_file: Vec<PathBuf>,
    /// Set metadata on the container
    #[arg(short, long)]
    pub label: Vec<String>,
    /// Read in a line delimited file of labels
    #[arg(long)]
    pub label_file: Vec<PathBuf>,

    /// Username or UID (format: <name|uid>[:<group|gid>])
    #[arg(short, long)]
    pub user: Option<String>,
    /// Add additional groups to join
    #[arg(long)]
    pub group_add: Vec<String>,
    /// Add Linux capabilities
    #[arg(long)]
    pub cap_add: Vec<String>,
    /// Drop Linux capabilities
    #[arg(long)]
    pub cap_drop: Vec<String>,
    /// Give extended privileges to this container
    #[arg(long)]
    pub privileged: bool,
    /// Security options (seccomp=, apparmor=, no-new-privileges)
    #[arg(long)]
    pub security_opt: Vec<String>,

    /// Bind mount a volume
    #[arg(short, long)]
    pub volume: Vec<String>,
    /// Attach a filesystem mount to the container
    #[arg(long)]
    pub mount: Vec<String>,
    /// Mount a tmpfs directory
    #[arg(long)]
    pub tmpfs: Vec<String>,

    /// Connect a container to a network
    #[arg(long, visible_alias = "net")]
    pub network: Vec<String>,
    /// Publish a container's port(s) to the host
    #[arg(short, long)]
    pub publish: Vec<String>,
    /// Set custom DNS servers
    #[arg(long)]
    pub dns: Vec<String>,
    /// Set custom DNS search domains
    #[arg(long)]
    pub dns_search: Vec<String>,
    /// Set DNS options
    #[arg(long, visible_alias = "dns-opt")]
    pub dns_option: Vec<String>,
    /// IPv4 address to assign to the container
    #[arg(long)]
    pub ip: Option<IpAddr>,
    /// Add a custom host-to-IP mapping (host:ip)
    #[arg(long)]
    pub add_host: Vec<String>,

    /// Number of CPUs
    #[arg(long)]
    pub cpus: Option<f64>,
    /// Memory limit
    #[arg(short, long)]
    pub memory: Option<String>,
    /// Tune container pids limit (-1 for unlimited)
    #[arg(long, allow_negative_numbers = true)]
    pub pids_limit: Option<i64>,
    /// CPUs in which to allow execution (0-3, 0,1)
    #[arg(long)]
    pub cpuset_cpus: Option<String>,
    /// Block IO weight (10-1000)
    #[arg(long)]
    pub blkio_weight: Option<u16>,
    /// Cgroup namespace to use (host or private)
    #[arg(long)]
    pub cgroupns: Option<String>,
    /// Ulimit options (name=soft[:hard])
    #[arg(long)]
    pub ulimit: Vec<String>,
    /// Tune host's OOM preferences (-1000 to 1000)
    #[arg(long, allow_negative_numbers = true)]
    pub oom_score_adj: Option<i32>,
    /// Add a host device to the container
    #[arg(long)]
    pub device: Vec<String>,
    /// Sysctl options (key=value)
    #[arg(long)]
    pub sysctl: Vec<String>,
    /// Size of /dev/shm
    #[arg(long)]
    pub shm_size: Option<String>,
    /// Mount the container's root filesystem as read only
    #[arg(long)]
    pub read_only: bool,
    /// Run an init inside the container that forwards signals and reaps processes
    #[arg(long)]
    pub init: bool,
    /// Custom init binary
    #[arg(long)]
    pub init_binary: Option<String>,

    /// Restart policy (no, always, unless-stopped, on-failure[:max-retries])
    #[arg(long, default_value = "no")]
    pub restart: String,
    /// Logging driver (json-file or none)
    #[arg(long, default_value = "json-file")]
    pub log_driver: String,
    /// Log driver options (max-size=, max-file=)
    #[arg(long)]
    pub log_opt: Vec<String>,
    /// Signal to stop the container
    #[arg(long)]
    pub stop_signal: Option<String>,
    /// Seconds to wait before killing the container
    #[arg(long)]
    pub stop_timeout: Option<u32>,

    /// Pull image before running (always, missing, never)
    #[arg(long, default_value = "missing")]
    pub pull: String,
    /// Set platform if server is multi-platform capable
    #[arg(long)]
    pub platform: Option<String>,
    /// Runtime to use for this container
    #[arg(long)]
    pub runtime: Option<String>,
    /// Verify the image (none or cosign)
    #[arg(long, default_value = "none")]
    pub verify: String,
    /// Path to the public key file for cosign verification
    #[arg(long)]
    pub cosign_key: Option<PathBuf>,

    /// Write the container ID to the file
    #[arg(long)]
    pub cidfile: Option<PathBuf>,
    /// File path to write the task's pid
    #[arg(long)]
    pub pidfile: Option<PathBuf>,
    /// The first argument is a host directory holding the root filesystem
    #[arg(long)]
    pub rootfs: bool,

    /// Image to run
    pub image: String,
    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Parse the flag strings into [`CreateOptions`]
    pub fn to_options(&self) -> Result<CreateOptions> {
        let mut publish = Vec::new();
        for raw in &self.publish {
            publish.extend(parse_publish(raw)?);
        }
        let add_hosts = self
            .add_host
            .iter()
            .map(|h| parse_add_host(h))
            .collect::<Result<Vec<_>>>()?;
        let mut sysctls = BTreeMap::new();
        for kv in &self.sysctl {
            let (k, v) = kv
                .split_once('=')
                .ok_or_else(|| RuneError::usage(format!("invalid sysctl {:?}, expected key=value", kv)))?;
            sysctls.insert(k.to_string(), v.to_string());
        }
        if let Some(signal) = &self.stop_signal {
            parse_signal(signal)?;
        }

        Ok(CreateOptions {
            image: self.image.clone(),
            rootfs: self.rootfs,
            args: self.command.clone(),
            entrypoint: self.entrypoint.clone(),

            name: self.name.clone(),
            hostname: self.hostname.clone(),
            workdir: self.workdir.clone(),
            env: self.env.clone(),
            env_files: self.env_file.clone(),
            labels: self.label.clone(),
            label_files: self.label_file.clone(),

            tty: self.tty,
            interactive: self.interactive,
            detach: self.detach,
            rm: self.rm,

            user: self.user.clone(),
            group_add: self.group_add.clone(),
            cap_add: self.cap_add.clone(),
            cap_drop: self.cap_drop.clone(),
            privileged: self.privileged,
            security: SecurityOptions::parse(&self.security_opt)?,

            volumes: self.volume.clone(),
            mounts: self.mount.clone(),
            tmpfs: self.tmpfs.clone(),

            network: NetworkMode::from_flags(&self.network)?,
            publish,
            dns: DnsConfig {
                servers: self.dns.clone(),
                search: self.dns_search.clone(),
                options: self.dns_option.clone(),
            },
            ip: self.ip,
            add_hosts,

            cpus: self.cpus,
            memory: self.memory.as_deref().map(parse_size).transpose()?.map(|m| m as i64),
            pids_limit: self.pids_limit,
            cpuset_cpus: self.cpuset_cpus.clone(),
            blkio_weight: self.blkio_weight,
            cgroupns: self.cgroupns.as_deref().map(str::parse).transpose()?,
            ulimits: self.ulimit.iter().map(|u| u.parse()).collect::<Result<_>>()?,
            oom_score_adj: self.oom_score_adj,

            devices: self.device.iter().map(|d| d.parse()).collect::<Result<_>>()?,
            sysctls,
            shm_size: self.shm_size.as_deref().map(parse_size).transpose()?,
            read_only: self.read_only,
            init: self.init,
            init_binary: self.init_binary.clone(),

            restart: self.restart.parse()?,
            log: LogConfig::from_flags(self.log_driver.parse()?, &self.log_opt)?,
            stop_signal: self.stop_signal.clone(),
            stop_timeout: self.stop_timeout,

            pull: self.pull.parse()?,
            platform: self.platform.clone(),
            runtime: self.runtime.clone(),
            verify: self.verify.parse()?,
            cosign_key: self.cosign_key.clone(),

            cidfile: self.cidfile.clone(),
            pidfile: self.pidfile.clone(),
        })
    }
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Keep STDIN open even if not attached
    #[arg(short, long)]
    pub interactive: bool,
    /// Allocate a pseudo-TTY
    #[arg(short, long)]
    pub tty: bool,
    /// Detached mode: run command in the background
    #[arg(short, long)]
    pub detach: bool,
    /// Working directory inside the container
    #[arg(short, long)]
    pub workdir: Option<String>,
    /// Set environment variables
    #[arg(short, long)]
    pub env: Vec<String>,
    /// Username or UID (format: <name|uid>[:<group|gid>])
    #[arg(short, long)]
    pub user: Option<String>,
    /// Give extended privileges to the command
    #[arg(long)]
    pub privileged: bool,
    /// Container name or ID
    pub container: String,
    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Attach STDOUT/STDERR and forward signals
    #[arg(short, long)]
    pub attach: bool,
    /// Attach container's STDIN
    #[arg(short, long)]
    pub interactive: bool,
    #[arg(required = true)]
    pub containers: Vec<String>,
}

#[derive(Args, Debug)]
pub struct StopArgs {
    /// Seconds to wait before killing the container
    #[arg(short = 't', long)]
    pub time: Option<u32>,
    #[arg(required = true)]
    pub containers: Vec<String>,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Force the removal of a running or paused container (uses SIGKILL)
    #[arg(short, long)]
    pub force: bool,
    /// Remove anonymous volumes associated with the container
    #[arg(short, long)]
    pub volumes: bool,
    #[arg(required = true)]
    pub containers: Vec<String>,
}

#[derive(Args, Debug)]
pub struct KillArgs {
    /// Signal to send to the container
    #[arg(short, long, default_value = "KILL")]
    pub signal: String,
    #[arg(required = true)]
    pub containers: Vec<String>,
}

#[derive(Args, Debug)]
pub struct TargetsArgs {
    #[arg(required = true)]
    pub containers: Vec<String>,
}

#[derive(Args, Debug)]
pub struct PsArgs {
    /// Show all containers (default shows just running)
    #[arg(short, long)]
    pub all: bool,
    /// Only display container IDs
    #[arg(short, long)]
    pub quiet: bool,
    /// Don't truncate output
    #[arg(long)]
    pub no_trunc: bool,
    /// Format the output using a template
    #[arg(long)]
    pub format: Option<String>,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Follow log output
    #[arg(short, long)]
    pub follow: bool,
    /// Show logs since timestamp or relative duration (e.g. 42m)
    #[arg(long)]
    pub since: Option<String>,
    /// Show logs before timestamp or relative duration (e.g. 42m)
    #[arg(long)]
    pub until: Option<String>,
    /// Show timestamps
    #[arg(short, long)]
    pub timestamps: bool,
    /// Number of lines to show from the end of the logs
    #[arg(short = 'n', long, default_value = "all")]
    pub tail: String,
    pub container: String,
}

#[derive(Args, Debug)]
pub struct PortArgs {
    pub container: String,
    /// PORT[/PROTO]
    pub port: Option<String>,
}

pub async fn run(ctx: &Context, args: &RunArgs) -> Result<()> {
    let opts = args.to_options()?;
    let id = ctx.containers().run(&opts).await?;
    if opts.detach {
        println!("{}", id);
    }
    Ok(())
}

pub async fn create(ctx: &Context, args: &RunArgs) -> Result<()> {
    let opts = args.to_options()?;
    let record = ctx.containers().create(&opts).await?;
    println!("{}", record.id);
    Ok(())
}

pub async fn exec(ctx: &Context, args: &ExecArgs) -> Result<()> {
    let opts = ExecOptions {
        args: args.command.clone(),
        interactive: args.interactive,
        tty: args.tty,
        detach: args.detach,
        workdir: args.workdir.clone(),
        env: args.env.clone(),
        user: args.user.clone(),
        privileged: args.privileged,
    };
    ctx.containers().exec(&args.container, &opts).await
}

pub async fn start(ctx: &Context, args: &StartArgs) -> Result<()> {
    let manager = ctx.containers();
    if args.attach {
        let [target] = args.containers.as_slice() else {
            return Err(RuneError::usage("you cannot start and attach multiple containers at once"));
        };
        let record = manager.lookup(target).await?;
        return match manager.start_attached(&record, args.interactive).await? {
            0 => Ok(()),
            code => Err(RuneError::ExitCode(code as i32)),
        };
    }
    let manager = &manager;
    for_each_target(&args.containers, &mut std::io::stdout(), &mut std::io::stderr(), |target| async move {
        let record = manager.lookup(&target).await?;
        manager.start_detached(&record).await?;
        Ok(target)
    })
    .await
}

pub async fn stop(ctx: &Context, args: &StopArgs) -> Result<()> {
    ctx.cancel_on_interrupt();
    let manager = &ctx.containers();
    let time = args.time;
    for_each_target(&args.containers, &mut std::io::stdout(), &mut std::io::stderr(), |target| async move {
        manager.stop(&target, time).await?;
        Ok(target)
    })
    .await
}

pub async fn remove(ctx: &Context, args: &RemoveArgs) -> Result<()> {
    ctx.cancel_on_interrupt();
    let manager = &ctx.containers();
    let opts = RemoveOptions {
        force: args.force,
        volumes: args.volumes,
    };
    for_each_target(&args.containers, &mut std::io::stdout(), &mut std::io::stderr(), |target| async move {
        manager.remove(&target, opts).await?;
        Ok(target)
    })
    .await
}

pub async fn kill(ctx: &Context, args: &KillArgs) -> Result<()> {
    let signal = parse_signal(&args.signal)?;
    let manager = &ctx.containers();
    for_each_target(&args.containers, &mut std::io::stdout(), &mut std::io::stderr(), |target| async move {
        manager.kill(&target, signal).await?;
        Ok(target)
    })
    .await
}

pub async fn pause(ctx: &Context, args: &TargetsArgs) -> Result<()> {
    let manager = &ctx.containers();
    for_each_target(&args.containers, &mut std::io::stdout(), &mut std::io::stderr(), |target| async move {
        manager.pause(&target).await?;
        Ok(target)
    })
    .await
}

pub async fn unpause(ctx: &Context, args: &TargetsArgs) -> Result<()> {
    let manager = &ctx.containers();
    for_each_target(&args.containers, &mut std::io::stdout(), &mut std::io::stderr(), |target| async move {
        manager.unpause(&target).await?;
        Ok(target)
    })
    .await
}

pub async fn wait(ctx: &Context, args: &TargetsArgs) -> Result<()> {
    let manager = &ctx.containers();
    for_each_target(&args.containers, &mut std::io::stdout(), &mut std::io::stderr(), |target| async move {
        Ok(manager.wait(&target).await?.to_string())
    })
    .await
}

pub async fn ps(ctx: &Context, args: &PsArgs) -> Result<()> {
    let views = ctx.containers().list(args.all).await?;
    print!("{}", format::ps(&views, args.quiet, args.no_trunc, args.format.as_deref())?);
    Ok(())
}

fn parse_tail(raw: &str) -> Result<Option<usize>> {
    if raw == "all" {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| RuneError::usage(format!("invalid tail {:?}, expected a number or \"all\"", raw)))
}

pub async fn logs(ctx: &Context, args: &LogsArgs) -> Result<()> {
    let manager = ctx.containers();
    let view = manager.view(manager.lookup(&args.container).await?).await?;
    let now = Utc::now();
    let opts = ReadOptions {
        // Following a stopped container would never end.
        follow: args.follow && view.is_running(),
        since: args.since.as_deref().map(|s| parse_time(s, now)).transpose()?,
        until: args.until.as_deref().map(|s| parse_time(s, now)).transpose()?,
        tail: parse_tail(&args.tail)?,
        timestamps: args.timestamps,
    };

    let cancel = ctx.scope.token().child_token();
    if opts.follow {
        ctx.cancel_on_interrupt();
        let client = ctx.client.clone();
        let scope = ctx.scope.clone();
        let id = view.id().to_string();
        let done = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = client.tasks.wait(&scope, &id, "").await {
                debug!("wait for {} ended: {}", id, e);
            }
            done.cancel();
        });
    }

    let path = manager.data_store().log_path(manager.namespace(), view.id());
    read_logs(&path, &opts, &mut std::io::stdout(), &mut std::io::stderr(), &cancel).await
}

pub async fn port(ctx: &Context, args: &PortArgs) -> Result<()> {
    let manager = ctx.containers();
    let view = manager.view(manager.lookup(&args.container).await?).await?;
    for line in format::port_lines(&view.labels.ports, args.port.as_deref())? {
        println!("{}", line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::tests::context;
    use crate::cli::{Cli, Commands};
    use crate::container::RestartPolicy;
    use crate::image::PullPolicy;
    use clap::Parser;

    fn run_args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["runectl", "run"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Run(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_command_after_image_keeps_its_flags() {
        let args = run_args(&["-d", "--name", "web", "-p", "8080:80", "nginx", "nginx", "-g", "daemon off;"]);
        assert!(args.detach);
        assert_eq!(args.name.as_deref(), Some("web"));
        assert_eq!(args.image, "nginx");
        assert_eq!(args.command, vec!["nginx", "-g", "daemon off;"]);
    }

    #[test]
    fn test_run_args_to_options() {
        let args = run_args(&[
            "-it",
            "--rm",
            "-e",
            "A=1",
            "--network",
            "none",
            "--add-host",
            "db:10.0.0.5",
            "--sysctl",
            "net.ipv4.ip_forward=1",
            "-m",
            "64m",
            "--restart",
            "always",
            "--pull",
            "never",
            "--oom-score-adj",
            "-500",
            "alpine",
        ]);
        let opts = args.to_options().unwrap();
        assert!(opts.interactive && opts.tty && opts.rm);
        assert_eq!(opts.env, vec!["A=1"]);
        assert_eq!(opts.network, NetworkMode::None);
        assert_eq!(opts.add_hosts, vec![("db".to_string(), "10.0.0.5".to_string())]);
        assert_eq!(opts.sysctls.get("net.ipv4.ip_forward").map(String::as_str), Some("1"));
        assert_eq!(opts.memory, Some(64 * 1024 * 1024));
        assert_eq!(opts.restart, RestartPolicy::Always);
        assert_eq!(opts.pull, PullPolicy::Never);
        assert_eq!(opts.oom_score_adj, Some(-500));
        assert!(opts.args.is_empty());
    }

    #[test]
    fn test_invalid_flag_values_are_usage_errors() {
        let err = run_args(&["--restart", "sometimes", "alpine"]).to_options().unwrap_err();
        assert_eq!(err.exit_code(), 125);
        let err = run_args(&["--network", "host", "--network", "bridge", "alpine"])
            .to_options()
            .unwrap_err();
        assert_eq!(err.exit_code(), 125);
        let err = run_args(&["--sysctl", "novalue", "alpine"]).to_options().unwrap_err();
        assert_eq!(err.exit_code(), 125);
    }

    #[test]
    fn test_logs_tail_short_flag() {
        let cli = Cli::try_parse_from(["runectl", "-n", "ns1", "logs", "-n", "5", "-f", "web"]).unwrap();
        assert_eq!(cli.global.namespace, "ns1");
        match cli.command {
            Commands::Logs(args) => {
                assert_eq!(parse_tail(&args.tail).unwrap(), Some(5));
                assert!(args.follow);
                assert_eq!(args.container, "web");
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(parse_tail("all").unwrap(), None);
        assert!(parse_tail("ten").is_err());
    }

    #[test]
    fn test_exec_command_flags() {
        let cli = Cli::try_parse_from(["runectl", "exec", "-it", "-w", "/srv", "web", "ls", "-la"]).unwrap();
        match cli.command {
            Commands::Exec(args) => {
                assert!(args.interactive && args.tty);
                assert_eq!(args.workdir.as_deref(), Some("/srv"));
                assert_eq!(args.command, vec!["ls", "-la"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_attach_takes_one_container() {
        let dir = tempfile::tempdir().unwrap();
        let (_fake, ctx) = context(dir.path());
        let args = StartArgs {
            attach: true,
            interactive: false,
            containers: vec!["a".into(), "b".into()],
        };
        let err = start(&ctx, &args).await.unwrap_err();
        assert_eq!(err.exit_code(), 125);
    }

    #[tokio::test]
    async fn test_kill_aggregates_missing_targets() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, ctx) = context(dir.path());
        let mut opts = run_args(&["-d", "--network", "none", "alpine"]).to_options().unwrap();
        opts.name = Some("web".into());
        let id = ctx.containers().run(&opts).await.unwrap();

        let args = KillArgs {
            signal: "TERM".into(),
            containers: vec!["web".into(), "missing".into()],
        };
        let err = kill(&ctx, &args).await.unwrap_err();
        assert!(matches!(err, RuneError::Aggregate { failed: 1 }));
        assert_eq!(fake.task(&id).unwrap().signals, vec![15]);
    }
}

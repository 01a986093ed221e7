//! OCI runtime spec composition
//!
//! [`compose`] starts from the library's default spec and applies a fixed
//! sequence of mutations driven by [`CreateOptions`]. Side effects such as
//! writing the hosts file or the generated resolv.conf happen before, in the
//! lifecycle controller; the composer only references their paths.

use super::mounts::ResolvedMounts;
use super::options::{CgroupnsMode, CreateOptions, SeccompProfile};
use super::user::ResolvedUser;
use crate::error::{Result, RuneError};
use crate::image::oci::ContainerConfig;
use crate::network::NetworkMode;
use crate::runtime::syscall::device_numbers;
use oci_spec::runtime::{
    Arch, Capability, HookBuilder, HooksBuilder, LinuxBlockIoBuilder, LinuxCapabilitiesBuilder,
    LinuxCpuBuilder, LinuxDevice, LinuxDeviceBuilder, LinuxDeviceCgroup, LinuxDeviceCgroupBuilder,
    LinuxDeviceType, LinuxMemoryBuilder, LinuxNamespaceBuilder, LinuxNamespaceType, LinuxPidsBuilder,
    LinuxResourcesBuilder, LinuxSeccomp, LinuxSeccompAction, LinuxSeccompBuilder, LinuxSyscallBuilder,
    Mount, MountBuilder, PosixRlimit, PosixRlimitBuilder, PosixRlimitType, RootBuilder, Spec, UserBuilder,
};
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
pub const DEFAULT_APPARMOR_PROFILE: &str = "runectl-default";
pub const DEFAULT_INIT: &str = "tini";
const CPU_PERIOD: u64 = 100_000;

const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

const ALL_CAPABILITIES: &[&str] = &[
    "CAP_AUDIT_CONTROL",
    "CAP_AUDIT_READ",
    "CAP_AUDIT_WRITE",
    "CAP_BLOCK_SUSPEND",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_KILL",
    "CAP_LEASE",
    "CAP_LINUX_IMMUTABLE",
    "CAP_MAC_ADMIN",
    "CAP_MAC_OVERRIDE",
    "CAP_MKNOD",
    "CAP_NET_ADMIN",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_RAW",
    "CAP_PERFMON",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_CHROOT",
    "CAP_SYS_MODULE",
    "CAP_SYS_NICE",
    "CAP_SYS_PACCT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
];

const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
    "/sys/devices/virtual/powercap",
];

const READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

// Denied with EPERM unless the capability in the second column is granted.
const SECCOMP_DENY: &[(&str, Option<&str>)] = &[
    ("acct", Some("CAP_SYS_PACCT")),
    ("add_key", None),
    ("bpf", Some("CAP_SYS_ADMIN")),
    ("clock_adjtime", Some("CAP_SYS_TIME")),
    ("clock_settime", Some("CAP_SYS_TIME")),
    ("create_module", Some("CAP_SYS_MODULE")),
    ("delete_module", Some("CAP_SYS_MODULE")),
    ("finit_module", Some("CAP_SYS_MODULE")),
    ("get_kernel_syms", None),
    ("init_module", Some("CAP_SYS_MODULE")),
    ("ioperm", Some("CAP_SYS_RAWIO")),
    ("iopl", Some("CAP_SYS_RAWIO")),
    ("kcmp", Some("CAP_SYS_PTRACE")),
    ("kexec_file_load", Some("CAP_SYS_BOOT")),
    ("kexec_load", Some("CAP_SYS_BOOT")),
    ("keyctl", None),
    ("lookup_dcookie", Some("CAP_SYS_ADMIN")),
    ("mount", Some("CAP_SYS_ADMIN")),
    ("move_mount", Some("CAP_SYS_ADMIN")),
    ("name_to_handle_at", Some("CAP_SYS_ADMIN")),
    ("nfsservctl", None),
    ("open_by_handle_at", Some("CAP_DAC_READ_SEARCH")),
    ("open_tree", Some("CAP_SYS_ADMIN")),
    ("perf_event_open", Some("CAP_PERFMON")),
    ("pivot_root", Some("CAP_SYS_ADMIN")),
    ("process_vm_readv", Some("CAP_SYS_PTRACE")),
    ("process_vm_writev", Some("CAP_SYS_PTRACE")),
    ("ptrace", Some("CAP_SYS_PTRACE")),
    ("query_module", None),
    ("quotactl", Some("CAP_SYS_ADMIN")),
    ("reboot", Some("CAP_SYS_BOOT")),
    ("request_key", None),
    ("setns", Some("CAP_SYS_ADMIN")),
    ("settimeofday", Some("CAP_SYS_TIME")),
    ("stime", Some("CAP_SYS_TIME")),
    ("swapoff", Some("CAP_SYS_ADMIN")),
    ("swapon", Some("CAP_SYS_ADMIN")),
    ("sysfs", None),
    ("_sysctl", None),
    ("umount", Some("CAP_SYS_ADMIN")),
    ("umount2", Some("CAP_SYS_ADMIN")),
    ("unshare", Some("CAP_SYS_ADMIN")),
    ("uselib", None),
    ("userfaultfd", None),
    ("ustat", None),
    ("vm86", None),
    ("vm86old", None),
];

/// Where the hook re-entry should find the engine and its configuration
#[derive(Debug, Clone)]
pub struct HookContext {
    pub exe: PathBuf,
    pub data_root: PathBuf,
    pub cni_path: String,
    pub cni_netconfpath: String,
}

/// Everything [`compose`] needs besides the options
pub struct SpecInput<'a> {
    pub id: &'a str,
    pub namespace: &'a str,
    pub opts: &'a CreateOptions,
    /// Image defaults; `None` with `--rootfs`
    pub image: Option<&'a ContainerConfig>,
    pub state_dir: &'a Path,
    pub mounts: &'a ResolvedMounts,
    pub user: &'a ResolvedUser,
    pub hostname: &'a str,
    /// Generated `/etc/hosts`, bridge and user networks only
    pub hosts_file: Option<PathBuf>,
    /// Generated `/etc/hostname`, absent with host networking
    pub hostname_file: Option<PathBuf>,
    /// Init binary on the host, when `--init` is set
    pub init_binary: Option<PathBuf>,
    pub hook: &'a HookContext,
    /// User and internal labels, mirrored into annotations
    pub labels: &'a HashMap<String, String>,
}

fn string_vec(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn build_mount(destination: &str, typ: &str, source: &str, options: &[&str]) -> Result<Mount> {
    Ok(MountBuilder::default()
        .destination(destination)
        .typ(typ)
        .source(source)
        .options(string_vec(options))
        .build()?)
}

fn default_mounts(privileged: bool, shm_size: Option<u64>) -> Result<Vec<Mount>> {
    let shm = format!("size={}", shm_size.map(|s| s.to_string()).unwrap_or_else(|| "65536k".to_string()));
    let sys_opts: &[&str] = if privileged {
        &["nosuid", "noexec", "nodev"]
    } else {
        &["nosuid", "noexec", "nodev", "ro"]
    };
    Ok(vec![
        build_mount("/proc", "proc", "proc", &["nosuid", "noexec", "nodev"])?,
        build_mount("/dev", "tmpfs", "tmpfs", &["nosuid", "strictatime", "mode=755", "size=65536k"])?,
        build_mount(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        )?,
        build_mount("/dev/shm", "tmpfs", "shm", &["nosuid", "noexec", "nodev", "mode=1777", shm.as_str()])?,
        build_mount("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"])?,
        build_mount("/sys", "sysfs", "sysfs", sys_opts)?,
        build_mount("/sys/fs/cgroup", "cgroup", "cgroup", &["nosuid", "noexec", "nodev", "relatime", "ro"])?,
    ])
}

/// Process arguments from `--entrypoint`, positional args and the image
pub fn resolve_args(opts: &CreateOptions, image: Option<&ContainerConfig>) -> Result<Vec<String>> {
    let mut args = Vec::new();
    match &opts.entrypoint {
        Some(ep) => {
            if !ep.is_empty() {
                args.push(ep.clone());
            }
            args.extend(opts.args.iter().cloned());
        }
        None => {
            if let Some(cfg) = image {
                args.extend(cfg.entrypoint.clone().unwrap_or_default());
            }
            if !opts.args.is_empty() {
                args.extend(opts.args.iter().cloned());
            } else if let Some(cfg) = image {
                args.extend(cfg.cmd.clone().unwrap_or_default());
            }
        }
    }
    if args.is_empty() {
        return Err(RuneError::NoCommand);
    }
    Ok(args)
}

fn env_has(env: &[String], key: &str) -> bool {
    env.iter().any(|e| e.split('=').next() == Some(key))
}

/// Image env, a default `PATH`, then user entries as given
pub fn resolve_env(opts: &CreateOptions, image: Option<&ContainerConfig>, hostname: &str, home: &str) -> Result<Vec<String>> {
    let mut env: Vec<String> = image.and_then(|c| c.env.clone()).unwrap_or_default();
    if !env_has(&env, "PATH") {
        env.insert(0, format!("PATH={}", DEFAULT_PATH));
    }
    if !hostname.is_empty() {
        env.insert(0, format!("HOSTNAME={}", hostname));
    }
    if opts.tty && !env_has(&env, "TERM") {
        env.push("TERM=xterm".to_string());
    }
    let user_env = opts.collect_env()?;
    env.extend(user_env);
    if !env_has(&env, "HOME") {
        env.push(format!("HOME={}", home));
    }
    Ok(env)
}

fn parse_capability(raw: &str) -> Result<Capability> {
    let upper = raw.to_ascii_uppercase();
    let name = if upper.starts_with("CAP_") { upper } else { format!("CAP_{}", upper) };
    Capability::from_str(&name).map_err(|_| RuneError::usage(format!("unknown capability {:?}", raw)))
}

fn is_all(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("all")
}

/// Capability set after `--privileged`, `--cap-add` and `--cap-drop`
pub fn resolve_capabilities(opts: &CreateOptions) -> Result<HashSet<Capability>> {
    let all: HashSet<Capability> = ALL_CAPABILITIES
        .iter()
        .filter_map(|c| Capability::from_str(c).ok())
        .collect();
    if opts.privileged {
        return Ok(all);
    }

    let mut caps: HashSet<Capability> = if opts.cap_drop.iter().any(|c| is_all(c)) {
        HashSet::new()
    } else if opts.cap_add.iter().any(|c| is_all(c)) {
        all.clone()
    } else {
        DEFAULT_CAPABILITIES
            .iter()
            .filter_map(|c| Capability::from_str(c).ok())
            .collect()
    };

    for c in opts.cap_drop.iter().filter(|c| !is_all(c)) {
        caps.remove(&parse_capability(c)?);
    }
    for c in opts.cap_add.iter() {
        if is_all(c) {
            caps.extend(all.iter().copied());
        } else {
            caps.insert(parse_capability(c)?);
        }
    }
    Ok(caps)
}

fn rlimit_type(name: &str) -> Result<PosixRlimitType> {
    Ok(match name.trim_start_matches("RLIMIT_").to_ascii_lowercase().as_str() {
        "as" => PosixRlimitType::RlimitAs,
        "core" => PosixRlimitType::RlimitCore,
        "cpu" => PosixRlimitType::RlimitCpu,
        "data" => PosixRlimitType::RlimitData,
        "fsize" => PosixRlimitType::RlimitFsize,
        "locks" => PosixRlimitType::RlimitLocks,
        "memlock" => PosixRlimitType::RlimitMemlock,
        "msgqueue" => PosixRlimitType::RlimitMsgqueue,
        "nice" => PosixRlimitType::RlimitNice,
        "nofile" => PosixRlimitType::RlimitNofile,
        "nproc" => PosixRlimitType::RlimitNproc,
        "rss" => PosixRlimitType::RlimitRss,
        "rtprio" => PosixRlimitType::RlimitRtprio,
        "rttime" => PosixRlimitType::RlimitRttime,
        "sigpending" => PosixRlimitType::RlimitSigpending,
        "stack" => PosixRlimitType::RlimitStack,
        _ => return Err(RuneError::usage(format!("unknown ulimit {:?}", name))),
    })
}

fn rlimits(opts: &CreateOptions) -> Result<Vec<PosixRlimit>> {
    let mut limits = vec![PosixRlimitBuilder::default()
        .typ(PosixRlimitType::RlimitNofile)
        .soft(1024u64)
        .hard(1024u64)
        .build()?];
    for u in &opts.ulimits {
        let typ = rlimit_type(&u.name)?;
        limits.retain(|l| l.typ() != typ);
        limits.push(PosixRlimitBuilder::default().typ(typ).soft(u.soft).hard(u.hard).build()?);
    }
    Ok(limits)
}

fn device_rule(allow: bool, typ: LinuxDeviceType, major: Option<i64>, minor: Option<i64>, access: &str) -> Result<LinuxDeviceCgroup> {
    let mut b = LinuxDeviceCgroupBuilder::default().allow(allow).typ(typ).access(access);
    if let Some(m) = major {
        b = b.major(m);
    }
    if let Some(m) = minor {
        b = b.minor(m);
    }
    Ok(b.build()?)
}

fn default_device_rules() -> Result<Vec<LinuxDeviceCgroup>> {
    use LinuxDeviceType::{A, B, C};
    Ok(vec![
        device_rule(false, A, None, None, "rwm")?,
        device_rule(true, C, None, None, "m")?,
        device_rule(true, B, None, None, "m")?,
        device_rule(true, C, Some(1), Some(3), "rwm")?,
        device_rule(true, C, Some(1), Some(5), "rwm")?,
        device_rule(true, C, Some(1), Some(7), "rwm")?,
        device_rule(true, C, Some(1), Some(8), "rwm")?,
        device_rule(true, C, Some(1), Some(9), "rwm")?,
        device_rule(true, C, Some(5), Some(0), "rwm")?,
        device_rule(true, C, Some(5), Some(1), "rwm")?,
        device_rule(true, C, Some(5), Some(2), "rwm")?,
        device_rule(true, C, Some(136), None, "rwm")?,
    ])
}

/// Device node for a host path, placed at `container_path`
pub fn host_device(host: &Path, container_path: &Path) -> Result<LinuxDevice> {
    let meta = std::fs::metadata(host)?;
    let ft = meta.file_type();
    let typ = if ft.is_char_device() {
        LinuxDeviceType::C
    } else if ft.is_block_device() {
        LinuxDeviceType::B
    } else {
        return Err(RuneError::usage(format!("{} is not a device", host.display())));
    };
    let (major, minor) = device_numbers(meta.rdev());
    Ok(LinuxDeviceBuilder::default()
        .path(container_path)
        .typ(typ)
        .major(major)
        .minor(minor)
        .file_mode(meta.mode() & 0o777)
        .uid(meta.uid())
        .gid(meta.gid())
        .build()?)
}

fn host_devices() -> Vec<LinuxDevice> {
    walkdir::WalkDir::new("/dev")
        .max_depth(3)
        .into_iter()
        .filter_entry(|e| {
            let p = e.path();
            !(p.starts_with("/dev/pts") || p.starts_with("/dev/shm") || p.starts_with("/dev/mqueue"))
        })
        .filter_map(|e| e.ok())
        .filter(|e| {
            let ft = e.file_type();
            ft.is_char_device() || ft.is_block_device()
        })
        .filter(|e| e.path() != Path::new("/dev/console"))
        .filter_map(|e| host_device(e.path(), e.path()).ok())
        .collect()
}

fn seccomp_arches() -> Vec<Arch> {
    match std::env::consts::ARCH {
        "x86_64" => vec![Arch::ScmpArchX86_64, Arch::ScmpArchX86, Arch::ScmpArchX32],
        "aarch64" => vec![Arch::ScmpArchAarch64, Arch::ScmpArchArm],
        _ => Vec::new(),
    }
}

/// Allow-by-default profile refusing privileged syscalls the process
/// holds no capability for
pub fn default_seccomp(caps: &HashSet<Capability>) -> Result<LinuxSeccomp> {
    let denied: Vec<String> = SECCOMP_DENY
        .iter()
        .filter(|(_, cap)| match cap {
            Some(c) => !Capability::from_str(c).map(|c| caps.contains(&c)).unwrap_or(false),
            None => true,
        })
        .map(|(name, _)| name.to_string())
        .collect();

    let rule = LinuxSyscallBuilder::default()
        .names(denied)
        .action(LinuxSeccompAction::ScmpActErrno)
        .errno_ret(libc::EPERM as u32)
        .build()?;

    Ok(LinuxSeccompBuilder::default()
        .default_action(LinuxSeccompAction::ScmpActAllow)
        .architectures(seccomp_arches())
        .syscalls(vec![rule])
        .build()?)
}

/// Whether the host kernel enforces AppArmor
pub fn apparmor_enabled() -> bool {
    std::fs::read_to_string("/sys/module/apparmor/parameters/enabled")
        .map(|s| s.trim_start().starts_with('Y'))
        .unwrap_or(false)
}

/// Locate the init binary on `PATH`
pub fn find_init_binary(name: Option<&str>) -> Result<PathBuf> {
    let name = name.unwrap_or(DEFAULT_INIT);
    if name.contains('/') {
        let p = PathBuf::from(name);
        return if p.is_file() {
            Ok(p)
        } else {
            Err(RuneError::usage(format!("init binary {} not found", name)))
        };
    }
    let path = std::env::var("PATH").unwrap_or_default();
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
        .ok_or_else(|| RuneError::usage(format!("init binary {:?} not found in PATH", name)))
}

/// Argument vector for an OCI hook entry
pub fn hook_args(event: &str, input: &SpecInput<'_>) -> Vec<String> {
    let opts = input.opts;
    let mut args = vec![
        input.hook.exe.to_string_lossy().into_owned(),
        "oci-hook".to_string(),
        event.to_string(),
        "--full-id".to_string(),
        format!("{}-{}", input.namespace, input.id),
        "--container-state-dir".to_string(),
        input.state_dir.to_string_lossy().into_owned(),
        "--data-store".to_string(),
        input.hook.data_root.to_string_lossy().into_owned(),
        "--namespace".to_string(),
        input.namespace.to_string(),
        "--cni-path".to_string(),
        input.hook.cni_path.clone(),
        "--cni-netconfpath".to_string(),
        input.hook.cni_netconfpath.clone(),
    ];
    let networks = match &opts.network {
        NetworkMode::None | NetworkMode::Host => vec![opts.network.label_value()],
        other => other.names(),
    };
    for net in networks {
        args.push("--network".to_string());
        args.push(net);
    }
    for server in &opts.dns.servers {
        args.push("--dns".to_string());
        args.push(server.clone());
    }
    for search in &opts.dns.search {
        args.push("--dns-search".to_string());
        args.push(search.clone());
    }
    for option in &opts.dns.options {
        args.push("--dns-option".to_string());
        args.push(option.clone());
    }
    for port in &opts.publish {
        args.push("--p".to_string());
        args.push(serde_json::to_string(port).unwrap_or_default());
    }
    if let Some(ip) = opts.ip {
        args.push("--ip".to_string());
        args.push(ip.to_string());
    }
    args
}

/// Build the OCI spec for one container
pub fn compose(input: &SpecInput<'_>) -> Result<Spec> {
    let opts = input.opts;
    let mut spec = Spec::default();

    // Root filesystem
    let root_path = if opts.rootfs { PathBuf::from(&opts.image) } else { PathBuf::from("rootfs") };
    spec.set_root(Some(RootBuilder::default().path(root_path).readonly(opts.read_only).build()?));

    // Process args, cwd, env, tty
    let image = if opts.rootfs { None } else { input.image };
    let mut args = resolve_args(opts, image)?;
    let cwd = opts
        .workdir
        .clone()
        .or_else(|| image.and_then(|c| c.working_dir.clone()).filter(|w| !w.is_empty()))
        .unwrap_or_else(|| "/".to_string());
    let env = resolve_env(opts, image, input.hostname, &input.user.home)?;

    // Mounts: defaults, user mounts, then generated files the user did not cover
    let mut mounts = default_mounts(opts.privileged, opts.shm_size)?;
    let user_destinations: HashSet<PathBuf> = input.mounts.mounts.iter().map(|m| m.destination().clone()).collect();
    mounts.retain(|m| !user_destinations.contains(m.destination()));
    mounts.extend(input.mounts.mounts.iter().cloned());
    let add_file = |mounts: &mut Vec<Mount>, dst: &str, src: &Path, ro: bool| -> Result<()> {
        if user_destinations.contains(Path::new(dst)) {
            return Ok(());
        }
        let options: &[&str] = if ro { &["rbind", "ro", "rprivate"] } else { &["bind", "rprivate"] };
        mounts.push(build_mount(dst, "bind", &src.to_string_lossy(), options)?);
        Ok(())
    };

    // Networks
    let mut namespaces = vec![
        LinuxNamespaceType::Pid,
        LinuxNamespaceType::Ipc,
        LinuxNamespaceType::Uts,
        LinuxNamespaceType::Mount,
        LinuxNamespaceType::Network,
    ];
    match &opts.network {
        NetworkMode::None => {}
        NetworkMode::Host => {
            namespaces.retain(|n| !matches!(n, LinuxNamespaceType::Network | LinuxNamespaceType::Uts));
            add_file(&mut mounts, "/etc/hosts", Path::new("/etc/hosts"), true)?;
            add_file(&mut mounts, "/etc/resolv.conf", Path::new("/etc/resolv.conf"), true)?;
        }
        NetworkMode::Bridge | NetworkMode::Networks(_) => {
            if let Some(hosts) = &input.hosts_file {
                add_file(&mut mounts, "/etc/hosts", hosts, false)?;
            }
        }
    }
    if let Some(hostname_file) = &input.hostname_file {
        add_file(&mut mounts, "/etc/hostname", hostname_file, false)?;
    }

    // Resources
    let cgroupns = opts.cgroupns.unwrap_or_else(CgroupnsMode::host_default);
    if cgroupns == CgroupnsMode::Private {
        namespaces.push(LinuxNamespaceType::Cgroup);
    }
    let mut resources = LinuxResourcesBuilder::default();
    if opts.cpus.is_some() || opts.cpuset_cpus.is_some() {
        let mut cpu = LinuxCpuBuilder::default();
        if let Some(cpus) = opts.cpus {
            cpu = cpu.quota((cpus * CPU_PERIOD as f64) as i64).period(CPU_PERIOD);
        }
        if let Some(set) = &opts.cpuset_cpus {
            cpu = cpu.cpus(set.clone());
        }
        resources = resources.cpu(cpu.build()?);
    }
    if let Some(limit) = opts.memory {
        resources = resources.memory(LinuxMemoryBuilder::default().limit(limit).build()?);
    }
    if let Some(limit) = opts.pids_limit {
        resources = resources.pids(LinuxPidsBuilder::default().limit(limit).build()?);
    }
    if let Some(weight) = opts.blkio_weight.filter(|w| *w != 0) {
        resources = resources.block_io(LinuxBlockIoBuilder::default().weight(weight).build()?);
    }

    // Capabilities and security
    let caps = resolve_capabilities(opts)?;
    let capabilities = LinuxCapabilitiesBuilder::default()
        .bounding(caps.clone())
        .effective(caps.clone())
        .permitted(caps.clone())
        .inheritable(HashSet::new())
        .ambient(HashSet::new())
        .build()?;

    let seccomp = if opts.privileged {
        None
    } else {
        match &opts.security.seccomp {
            SeccompProfile::Unconfined => None,
            SeccompProfile::Default => Some(default_seccomp(&caps)?),
            SeccompProfile::File(path) => Some(serde_json::from_slice::<LinuxSeccomp>(&std::fs::read(path)?)?),
        }
    };

    let apparmor = match opts.security.apparmor.as_deref() {
        Some("unconfined") => None,
        Some(profile) => Some(profile.to_string()),
        None if !opts.privileged && apparmor_enabled() => Some(DEFAULT_APPARMOR_PROFILE.to_string()),
        None => None,
    };

    // Devices
    let mut devices = Vec::new();
    let mut device_rules = if opts.privileged {
        devices.extend(host_devices());
        vec![device_rule(true, LinuxDeviceType::A, None, None, "rwm")?]
    } else {
        default_device_rules()?
    };
    for d in &opts.devices {
        let dev = host_device(&d.host, &d.container)?;
        device_rules.push(device_rule(true, dev.typ(), Some(dev.major()), Some(dev.minor()), &d.permissions)?);
        devices.retain(|existing| existing.path() != dev.path());
        devices.push(dev);
    }
    resources = resources.devices(device_rules);

    // Init
    if let Some(init) = &input.init_binary {
        let base = init
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_INIT.to_string());
        let target = format!("/sbin/{}", base);
        mounts.push(build_mount(&target, "bind", &init.to_string_lossy(), &["bind", "ro", "rprivate"])?);
        let mut wrapped = vec![target, "--".to_string()];
        wrapped.append(&mut args);
        args = wrapped;
    }

    // Process
    let user = UserBuilder::default()
        .uid(input.user.uid)
        .gid(input.user.gid)
        .additional_gids(input.user.additional_gids.clone())
        .build()?;
    let mut process = spec.process().clone().unwrap_or_default();
    process.set_terminal(Some(opts.tty));
    process.set_args(Some(args));
    process.set_env(Some(env));
    process.set_cwd(PathBuf::from(cwd));
    process.set_user(user);
    process.set_capabilities(Some(capabilities));
    process.set_rlimits(Some(rlimits(opts)?));
    process.set_no_new_privileges(Some(opts.security.no_new_privileges));
    process.set_apparmor_profile(apparmor);
    process.set_oom_score_adj(opts.oom_score_adj);
    spec.set_process(Some(process));

    // Linux section
    let mut linux = spec.linux().clone().unwrap_or_default();
    let namespaces = namespaces
        .into_iter()
        .map(|typ| LinuxNamespaceBuilder::default().typ(typ).build())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    linux.set_namespaces(Some(namespaces));
    linux.set_resources(Some(resources.build()?));
    linux.set_cgroups_path(Some(PathBuf::from(format!("/{}/{}", input.namespace, input.id))));
    linux.set_seccomp(seccomp);
    linux.set_devices(if devices.is_empty() { None } else { Some(devices) });
    linux.set_sysctl(if opts.sysctls.is_empty() {
        None
    } else {
        Some(opts.sysctls.clone().into_iter().collect())
    });
    if opts.privileged {
        linux.set_masked_paths(None);
        linux.set_readonly_paths(None);
    } else {
        linux.set_masked_paths(Some(string_vec(MASKED_PATHS)));
        linux.set_readonly_paths(Some(string_vec(READONLY_PATHS)));
    }
    spec.set_linux(Some(linux));

    spec.set_mounts(Some(mounts));

    // Hostname: shared with the host under host networking
    if matches!(opts.network, NetworkMode::Host) {
        spec.set_hostname(None);
    } else {
        spec.set_hostname(Some(input.hostname.to_string()));
    }

    // Hooks
    let hook = |event: &str| -> Result<oci_spec::runtime::Hook> {
        Ok(HookBuilder::default()
            .path(input.hook.exe.clone())
            .args(hook_args(event, input))
            .build()?)
    };
    spec.set_hooks(Some(
        HooksBuilder::default()
            .create_runtime(vec![hook("createRuntime")?])
            .poststop(vec![hook("postStop")?])
            .build()?,
    ));

    spec.set_annotations(Some(input.labels.clone()));
    debug!("composed spec for {}", input.id);
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::mounts::{materialize, plan};
    use crate::storage::layout::DataStore;
    use crate::storage::volume::VolumeStore;

    struct Fixture {
        dir: tempfile::TempDir,
        hook: HookContext,
        user: ResolvedUser,
        labels: HashMap<String, String>,
        resolved: ResolvedMounts,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let hook = HookContext {
                exe: PathBuf::from("/usr/local/bin/runectl"),
                data_root: dir.path().join("data"),
                cni_path: "/opt/cni/bin".into(),
                cni_netconfpath: "/etc/cni/net.d".into(),
            };
            let mut labels = HashMap::new();
            labels.insert("tier".to_string(), "web".to_string());
            Self {
                dir,
                hook,
                user: ResolvedUser::default(),
                labels,
                resolved: ResolvedMounts::default(),
            }
        }

        fn input<'a>(&'a self, opts: &'a CreateOptions, image: Option<&'a ContainerConfig>) -> SpecInput<'a> {
            SpecInput {
                id: "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
                namespace: "default",
                opts,
                image,
                state_dir: self.dir.path(),
                mounts: &self.resolved,
                user: &self.user,
                hostname: "0123456789ab",
                hosts_file: Some(self.dir.path().join("hosts")),
                hostname_file: Some(self.dir.path().join("hostname")),
                init_binary: None,
                hook: &self.hook,
                labels: &self.labels,
            }
        }
    }

    fn image() -> ContainerConfig {
        ContainerConfig {
            entrypoint: Some(vec!["/docker-entrypoint.sh".into()]),
            cmd: Some(vec!["nginx".into(), "-g".into(), "daemon off;".into()]),
            env: Some(vec!["NGINX_VERSION=1.25".into()]),
            working_dir: Some("/srv".into()),
            ..Default::default()
        }
    }

    fn destinations(spec: &Spec) -> Vec<String> {
        spec.mounts()
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.destination().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_args_resolution() {
        let img = image();
        let mut opts = CreateOptions::new("nginx");
        assert_eq!(resolve_args(&opts, Some(&img)).unwrap()[0], "/docker-entrypoint.sh");
        assert_eq!(resolve_args(&opts, Some(&img)).unwrap().len(), 4);

        opts.args = vec!["sh".into()];
        assert_eq!(resolve_args(&opts, Some(&img)).unwrap(), vec!["/docker-entrypoint.sh", "sh"]);

        opts.entrypoint = Some(String::new());
        assert_eq!(resolve_args(&opts, Some(&img)).unwrap(), vec!["sh"]);

        opts.args.clear();
        assert!(matches!(resolve_args(&opts, Some(&img)), Err(RuneError::NoCommand)));
        assert!(matches!(resolve_args(&CreateOptions::new("x"), None), Err(RuneError::NoCommand)));
    }

    #[test]
    fn test_env_order() {
        let mut opts = CreateOptions::new("nginx");
        opts.env = vec!["A=1".into(), "NGINX_VERSION=custom".into()];
        opts.tty = true;
        let env = resolve_env(&opts, Some(&image()), "host1", "/root").unwrap();
        assert_eq!(env[0], "HOSTNAME=host1");
        assert!(env[1].starts_with("PATH="));
        let img_pos = env.iter().position(|e| e == "NGINX_VERSION=1.25").unwrap();
        let user_pos = env.iter().position(|e| e == "NGINX_VERSION=custom").unwrap();
        assert!(img_pos < user_pos);
        assert!(env.contains(&"TERM=xterm".to_string()));
        assert_eq!(env.last().unwrap(), "HOME=/root");
    }

    #[test]
    fn test_capabilities() {
        let mut opts = CreateOptions::new("x");
        assert_eq!(resolve_capabilities(&opts).unwrap().len(), DEFAULT_CAPABILITIES.len());

        opts.cap_add = vec!["net_admin".into()];
        opts.cap_drop = vec!["CAP_CHOWN".into()];
        let caps = resolve_capabilities(&opts).unwrap();
        assert!(caps.contains(&Capability::NetAdmin));
        assert!(!caps.contains(&Capability::Chown));

        opts.cap_drop = vec!["ALL".into()];
        opts.cap_add = vec!["KILL".into()];
        assert_eq!(resolve_capabilities(&opts).unwrap().len(), 1);

        opts.cap_add = vec!["NOT_A_CAP".into()];
        assert!(resolve_capabilities(&opts).is_err());

        let mut privileged = CreateOptions::new("x");
        privileged.privileged = true;
        assert!(resolve_capabilities(&privileged).unwrap().contains(&Capability::SysAdmin));
    }

    #[test]
    fn test_seccomp_follows_capabilities() {
        let mut caps = HashSet::new();
        let profile = default_seccomp(&caps).unwrap();
        let names = profile.syscalls().as_ref().unwrap()[0].names().clone();
        assert!(names.contains(&"mount".to_string()));
        assert!(names.contains(&"ptrace".to_string()));

        caps.insert(Capability::SysAdmin);
        let profile = default_seccomp(&caps).unwrap();
        let names = profile.syscalls().as_ref().unwrap()[0].names().clone();
        assert!(!names.contains(&"mount".to_string()));
        assert!(names.contains(&"keyctl".to_string()));
    }

    #[test]
    fn test_compose_bridge_container() {
        let fx = Fixture::new();
        let img = image();
        let mut opts = CreateOptions::new("nginx");
        opts.cpus = Some(1.5);
        opts.memory = Some(64 * 1024 * 1024);
        opts.cgroupns = Some(CgroupnsMode::Private);
        opts.ulimits = vec!["nofile=2048:4096".parse().unwrap()];
        opts.publish = crate::network::ports::parse_publish("8080:80").unwrap();
        opts.dns.servers = vec!["1.1.1.1".into()];

        let spec = compose(&fx.input(&opts, Some(&img))).unwrap();

        let process = spec.process().as_ref().unwrap();
        assert_eq!(process.cwd(), &PathBuf::from("/srv"));
        assert_eq!(spec.hostname().as_deref(), Some("0123456789ab"));
        let rlimits = process.rlimits().as_ref().unwrap();
        assert_eq!(rlimits.len(), 1);
        assert_eq!(rlimits[0].soft(), 2048);

        let linux = spec.linux().as_ref().unwrap();
        let cpu = linux.resources().as_ref().unwrap().cpu().as_ref().unwrap();
        assert_eq!(cpu.quota(), Some(150_000));
        assert_eq!(cpu.period(), Some(100_000));
        let ns: Vec<LinuxNamespaceType> = linux.namespaces().as_ref().unwrap().iter().map(|n| n.typ()).collect();
        assert!(ns.contains(&LinuxNamespaceType::Network));
        assert!(ns.contains(&LinuxNamespaceType::Cgroup));
        assert!(linux.seccomp().is_some());
        assert_eq!(
            linux.cgroups_path().as_ref().unwrap(),
            &PathBuf::from("/default/0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef")
        );

        let dests = destinations(&spec);
        assert!(dests.contains(&"/etc/hosts".to_string()));
        assert!(dests.contains(&"/etc/hostname".to_string()));

        let hooks = spec.hooks().as_ref().unwrap();
        let create = &hooks.create_runtime().as_ref().unwrap()[0];
        let args = create.args().as_ref().unwrap();
        assert_eq!(&args[1..3], &["oci-hook".to_string(), "createRuntime".to_string()]);
        assert!(args.windows(2).any(|w| w[0] == "--network" && w[1] == "bridge"));
        assert!(args.windows(2).any(|w| w[0] == "--dns" && w[1] == "1.1.1.1"));
        assert!(args.iter().any(|a| a == "--p"));
        assert_eq!(spec.annotations().as_ref().unwrap()["tier"], "web");
    }

    #[test]
    fn test_compose_host_network_and_privileged() {
        let fx = Fixture::new();
        let img = image();
        let mut opts = CreateOptions::new("nginx");
        opts.network = NetworkMode::Host;
        opts.privileged = true;

        let mut input = fx.input(&opts, Some(&img));
        input.hosts_file = None;
        input.hostname_file = None;
        let spec = compose(&input).unwrap();

        let linux = spec.linux().as_ref().unwrap();
        let ns: Vec<LinuxNamespaceType> = linux.namespaces().as_ref().unwrap().iter().map(|n| n.typ()).collect();
        assert!(!ns.contains(&LinuxNamespaceType::Network));
        assert!(!ns.contains(&LinuxNamespaceType::Uts));
        assert!(linux.seccomp().is_none());
        assert!(linux.masked_paths().is_none());
        assert!(spec.hostname().is_none());

        let mounts = spec.mounts().as_ref().unwrap();
        let resolv = mounts
            .iter()
            .find(|m| m.destination() == Path::new("/etc/resolv.conf"))
            .unwrap();
        assert_eq!(resolv.source().as_ref().unwrap(), &PathBuf::from("/etc/resolv.conf"));
        let sys = mounts.iter().find(|m| m.destination() == Path::new("/sys")).unwrap();
        assert!(!sys.options().as_ref().unwrap().contains(&"ro".to_string()));
    }

    #[test]
    fn test_user_mount_replaces_defaults() {
        let mut fx = Fixture::new();
        let store = DataStore::new(fx.dir.path().join("data"));
        let volumes = VolumeStore::open(&store, "default").unwrap();
        let host = fx.dir.path().join("hosts-override");
        std::fs::write(&host, "127.0.0.1 localhost\n").unwrap();
        let reqs = plan(
            &[format!("{}:/etc/hosts", host.display())],
            &[],
            &["/dev/shm".to_string()],
            &[],
        )
        .unwrap();
        fx.resolved = materialize(&reqs, &volumes).unwrap();

        let img = image();
        let opts = CreateOptions::new("nginx");
        let spec = compose(&fx.input(&opts, Some(&img))).unwrap();
        let dests = destinations(&spec);
        assert_eq!(dests.iter().filter(|d| *d == "/etc/hosts").count(), 1);
        assert_eq!(dests.iter().filter(|d| *d == "/dev/shm").count(), 1);
    }

    #[test]
    fn test_rootfs_ignores_image_and_init_wraps_args() {
        let fx = Fixture::new();
        let img = image();
        let mut opts = CreateOptions::new("/srv/rootfs");
        opts.rootfs = true;
        opts.read_only = true;
        opts.args = vec!["/bin/app".into()];

        let mut input = fx.input(&opts, Some(&img));
        input.init_binary = Some(PathBuf::from("/usr/bin/tini"));
        let spec = compose(&input).unwrap();

        let root = spec.root().as_ref().unwrap();
        assert_eq!(root.path(), &PathBuf::from("/srv/rootfs"));
        assert_eq!(root.readonly(), Some(true));
        let process = spec.process().as_ref().unwrap();
        assert_eq!(process.args().as_ref().unwrap(), &vec!["/sbin/tini".to_string(), "--".into(), "/bin/app".into()]);
        assert_eq!(process.cwd(), &PathBuf::from("/"));
        assert!(destinations(&spec).contains(&"/sbin/tini".to_string()));
    }
}

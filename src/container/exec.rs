//! `exec`: additional processes in a running container

use super::io::{console_size, forward_signals, Attached, FifoSet, RawModeGuard};
use super::lifecycle::ContainerManager;
use super::options::CreateOptions;
use super::spec::resolve_capabilities;
use super::user::UserDb;
use crate::daemon::{TaskIo, TaskStatus};
use crate::error::{Result, RuneError};
use oci_spec::runtime::{LinuxCapabilitiesBuilder, Process, Spec, UserBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// `exec` flags
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub args: Vec<String>,
    pub interactive: bool,
    pub tty: bool,
    pub detach: bool,
    pub workdir: Option<String>,
    /// `KEY=VALUE` entries appended to the container environment
    pub env: Vec<String>,
    pub user: Option<String>,
    pub privileged: bool,
}

/// Derive the exec process from the container's init process
fn exec_process(base: &Process, opts: &ExecOptions, proc_root: &Path) -> Result<Process> {
    let mut process = base.clone();
    process.set_args(Some(opts.args.clone()));
    process.set_terminal(Some(opts.tty));
    if let Some(dir) = &opts.workdir {
        process.set_cwd(PathBuf::from(dir));
    }

    let mut env = process.env().clone().unwrap_or_default();
    for kv in &opts.env {
        let key = kv.split_once('=').map_or(kv.as_str(), |(k, _)| k);
        env.retain(|e| e.split_once('=').map_or(e.as_str(), |(k, _)| k) != key);
        env.push(kv.clone());
    }
    process.set_env(Some(env));

    if let Some(user) = &opts.user {
        let resolved = UserDb::load(proc_root)?.resolve(user, &[])?;
        process.set_user(
            UserBuilder::default()
                .uid(resolved.uid)
                .gid(resolved.gid)
                .additional_gids(resolved.additional_gids)
                .build()?,
        );
    }

    if opts.privileged {
        let all = resolve_capabilities(&CreateOptions {
            privileged: true,
            ..Default::default()
        })?;
        process.set_capabilities(Some(
            LinuxCapabilitiesBuilder::default()
                .bounding(all.clone())
                .effective(all.clone())
                .permitted(all)
                .inheritable(HashSet::new())
                .ambient(HashSet::new())
                .build()?,
        ));
    }
    Ok(process)
}

impl ContainerManager {
    /// Run a command inside a running container.
    ///
    /// Attached execs return once the process exits; a non-zero status
    /// becomes [`RuneError::ExitCode`].
    pub async fn exec(&self, target: &str, opts: &ExecOptions) -> Result<()> {
        if opts.args.is_empty() {
            return Err(RuneError::NoCommand);
        }
        if opts.tty && opts.detach && opts.interactive {
            return Err(RuneError::InteractiveDetachConflict);
        }
        let record = self.lookup(target).await?;
        let id = record.id.clone();
        let task = match self.task(&id).await? {
            Some(t) if t.status == TaskStatus::Running => t,
            Some(t) if t.status == TaskStatus::Paused => return Err(RuneError::ContainerPaused(id)),
            _ => return Err(RuneError::NotRunning(id)),
        };

        let spec: Spec = match &record.spec {
            Some(v) => serde_json::from_value(v.clone())?,
            None => return Err(RuneError::Internal(format!("container {} has no runtime spec", id))),
        };
        let base = spec.process().clone().unwrap_or_default();
        let proc_root = PathBuf::from(format!("/proc/{}/root", task.pid));
        let process = serde_json::to_value(exec_process(&base, opts, &proc_root)?)?;
        let exec_id = format!("exec-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);

        if opts.detach {
            self.client
                .tasks
                .exec(&self.scope, &id, &exec_id, process, &TaskIo::default())
                .await?;
            self.client.tasks.start(&self.scope, &id, &exec_id).await?;
            debug!("started detached exec {} in {}", exec_id, id);
            return Ok(());
        }

        let state_dir = self.data.ensure_container_dir(self.namespace(), &id)?;
        let _raw = if opts.tty && opts.interactive { Some(RawModeGuard::enable()?) } else { None };
        let fifos = FifoSet::create(&state_dir, &exec_id, opts.interactive, opts.tty)?;
        let io = fifos.task_io();
        let attached = Attached::start(fifos, None);

        let res = self.attached_exec(&id, &exec_id, process, &io, opts.tty).await;
        tokio::task::spawn_blocking(move || attached.finish())
            .await
            .map_err(|e| RuneError::Internal(format!("stdio copier: {}", e)))?;
        if let Err(e) = self.client.tasks.delete_process(&self.scope, &id, &exec_id).await {
            warn!("failed to delete exec process {}: {}", exec_id, e);
        }

        match res? {
            0 => Ok(()),
            code => Err(RuneError::ExitCode(code as i32)),
        }
    }

    async fn attached_exec(&self, id: &str, exec_id: &str, process: serde_json::Value, io: &TaskIo, tty: bool) -> Result<u32> {
        self.client.tasks.exec(&self.scope, id, exec_id, process, io).await?;
        let waiter = {
            let client = self.client.clone();
            let scope = self.scope.clone();
            let id = id.to_string();
            let exec_id = exec_id.to_string();
            tokio::spawn(async move { client.tasks.wait(&scope, &id, &exec_id).await })
        };
        self.client.tasks.start(&self.scope, id, exec_id).await?;
        if tty {
            if let Some((w, h)) = console_size() {
                let _ = self.client.tasks.resize(&self.scope, id, exec_id, w, h).await;
            }
        }
        let forwarder = forward_signals(
            self.client.clone(),
            self.scope.clone(),
            id.to_string(),
            exec_id.to_string(),
            tty,
        )?;
        let status = waiter
            .await
            .map_err(|e| RuneError::Internal(format!("wait exec: {}", e)))?;
        forwarder.abort();
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::lifecycle::tests::{harness, options};

    #[test]
    fn test_exec_process_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join("etc/passwd"), "app:x:1000:1000::/home/app:/bin/sh\n").unwrap();

        let mut base = Process::default();
        base.set_env(Some(vec!["PATH=/bin".into(), "MODE=prod".into()]));
        let opts = ExecOptions {
            args: vec!["env".into()],
            env: vec!["MODE=debug".into()],
            workdir: Some("/srv".into()),
            user: Some("app".into()),
            ..Default::default()
        };
        let p = exec_process(&base, &opts, dir.path()).unwrap();
        assert_eq!(p.args().as_ref().unwrap(), &vec!["env".to_string()]);
        assert_eq!(p.env().as_ref().unwrap(), &vec!["PATH=/bin".to_string(), "MODE=debug".to_string()]);
        assert_eq!(p.cwd(), &PathBuf::from("/srv"));
        assert_eq!(serde_json::to_value(p.user()).unwrap()["uid"], 1000);
    }

    #[tokio::test]
    async fn test_exec_requires_running_container() {
        let h = harness();
        let record = h.manager.create(&options("alpine")).await.unwrap();
        let opts = ExecOptions {
            args: vec!["ls".into()],
            detach: true,
            ..Default::default()
        };
        let err = h.manager.exec(&record.id, &opts).await.unwrap_err();
        assert!(matches!(err, RuneError::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_exec_exit_code() {
        let h = harness();
        let mut run = options("alpine");
        run.detach = true;
        let id = h.manager.run(&run).await.unwrap();

        let opts = ExecOptions {
            args: vec!["true".into()],
            detach: true,
            ..Default::default()
        };
        h.manager.exec(&id, &opts).await.unwrap();

        h.fake.set_auto_exit(Some(2));
        let opts = ExecOptions {
            args: vec!["false".into()],
            ..Default::default()
        };
        let err = h.manager.exec(&id, &opts).await.unwrap_err();
        assert!(matches!(err, RuneError::ExitCode(2)));
    }
}

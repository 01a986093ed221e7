//! `volume` subcommands

use super::{for_each_target, print_documents};
use crate::config::GlobalConfig;
use crate::container::format::render_rows_titled;
use crate::error::{Result, RuneError};
use crate::storage::{Volume, VolumeStore};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Subcommand, Debug)]
pub enum VolumeCommand {
    /// Create a volume
    Create(CreateArgs),
    /// List volumes
    #[command(name = "ls", visible_alias = "list")]
    List(ListArgs),
    /// Display detailed information on one or more volumes
    Inspect(InspectArgs),
    /// Remove one or more volumes
    #[command(name = "rm", visible_alias = "remove")]
    Remove(RemoveArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Set metadata for a volume
    #[arg(long)]
    pub label: Vec<String>,
    /// Volume name; generated when omitted
    pub name: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only display volume names
    #[arg(short, long)]
    pub quiet: bool,
    /// Format the output using a template
    #[arg(long)]
    pub format: Option<String>,
    /// Display the disk usage of volumes
    #[arg(short, long)]
    pub size: bool,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Format the output using a template
    #[arg(short, long)]
    pub format: Option<String>,
    /// Display the disk usage of volumes
    #[arg(short, long)]
    pub size: bool,
    #[arg(required = true)]
    pub volumes: Vec<String>,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Accepted for compatibility; removal never checks for users
    #[arg(short, long)]
    pub force: bool,
    #[arg(required = true)]
    pub volumes: Vec<String>,
}

/// One `volume ls` row
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct VolumeRow {
    driver: String,
    name: String,
    mountpoint: String,
    labels: String,
    size: String,
}

const VOLUME_TABLE: &str = "{{.Driver}}\t{{.Name}}";
const VOLUME_SIZE_TABLE: &str = "{{.Driver}}\t{{.Name}}\t{{.Size}}";

impl From<Volume> for VolumeRow {
    fn from(v: Volume) -> Self {
        VolumeRow {
            driver: v.driver,
            name: v.name,
            mountpoint: v.mountpoint.display().to_string(),
            labels: v.labels.iter().map(|(k, val)| format!("{}={}", k, val)).collect::<Vec<_>>().join(","),
            size: v.size.map(|s| super::image::human_size(s as i64)).unwrap_or_default(),
        }
    }
}

fn parse_labels(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for kv in raw {
        let (k, v) = kv.split_once('=').unwrap_or((kv.as_str(), ""));
        if k.is_empty() {
            return Err(RuneError::usage(format!("invalid label {:?}", kv)));
        }
        labels.insert(k.to_string(), v.to_string());
    }
    Ok(labels)
}

pub async fn run(config: &GlobalConfig, command: VolumeCommand) -> Result<()> {
    let store = VolumeStore::open(&config.data_store(), &config.namespace)?;
    match command {
        VolumeCommand::Create(args) => {
            let volume = match &args.name {
                Some(name) => store.create(name, parse_labels(&args.label)?)?,
                None if args.label.is_empty() => store.create_anonymous()?,
                None => return Err(RuneError::usage("labels need a volume name")),
            };
            println!("{}", volume.name);
            Ok(())
        }
        VolumeCommand::List(args) => {
            let volumes = store.list(args.size)?;
            if args.quiet {
                for v in &volumes {
                    println!("{}", v.name);
                }
                return Ok(());
            }
            let table = if args.size { VOLUME_SIZE_TABLE } else { VOLUME_TABLE };
            let rows: Vec<VolumeRow> = volumes.into_iter().map(VolumeRow::from).collect();
            print!(
                "{}",
                render_rows_titled(&rows, args.format.as_deref(), table, &[("Name", "VOLUME NAME")])?
            );
            Ok(())
        }
        VolumeCommand::Inspect(args) => {
            let mut docs = Vec::new();
            let mut failed = 0;
            for name in &args.volumes {
                match store.get(name) {
                    Ok(mut volume) => {
                        if args.size {
                            volume.size = Some(volume.disk_usage());
                        }
                        docs.push(serde_json::to_value(volume)?);
                    }
                    Err(e) => {
                        failed += 1;
                        eprintln!("Error response from daemon: {}", e);
                    }
                }
            }
            print_documents(&docs, args.format.as_deref())?;
            if failed > 0 {
                return Err(RuneError::Aggregate { failed });
            }
            Ok(())
        }
        VolumeCommand::Remove(args) => {
            let store = &store;
            for_each_target(&args.volumes, &mut std::io::stdout(), &mut std::io::stderr(), |name| async move {
                store.remove(&name)?;
                Ok(name)
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    fn config(dir: &std::path::Path) -> GlobalConfig {
        GlobalConfig {
            data_root: dir.join("data"),
            ..GlobalConfig::default()
        }
    }

    #[test]
    fn test_parse_volume_commands() {
        let cli = Cli::try_parse_from(["runectl", "volume", "create", "--label", "tier=db", "pgdata"]).unwrap();
        let Commands::Volume(VolumeCommand::Create(args)) = cli.command else {
            panic!("expected volume create");
        };
        assert_eq!(args.name.as_deref(), Some("pgdata"));
        assert_eq!(parse_labels(&args.label).unwrap().get("tier").map(String::as_str), Some("db"));

        let cli = Cli::try_parse_from(["runectl", "volume", "ls", "-q"]).unwrap();
        assert!(matches!(cli.command, Commands::Volume(VolumeCommand::List(ListArgs { quiet: true, .. }))));
    }

    #[tokio::test]
    async fn test_create_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        run(&config, VolumeCommand::Create(CreateArgs { label: vec![], name: Some("pgdata".into()) }))
            .await
            .unwrap();
        let store = VolumeStore::open(&config.data_store(), &config.namespace).unwrap();
        assert!(store.get("pgdata").unwrap().mountpoint.is_dir());

        let err = run(
            &config,
            VolumeCommand::Remove(RemoveArgs {
                force: false,
                volumes: vec!["pgdata".into(), "nope".into()],
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RuneError::Aggregate { failed: 1 }));
        assert!(store.get("pgdata").is_err());
    }
}

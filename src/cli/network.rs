//! `network` subcommands

use crate::config::GlobalConfig;
use crate::container::format::render_rows_titled;
use crate::error::{Result, RuneError};
use crate::network::{CreateNetworkOptions, NetworkManager};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// Create a network
    Create(CreateArgs),
    /// List networks
    #[command(name = "ls", visible_alias = "list")]
    List(ListArgs),
    /// Display detailed information on one or more networks
    Inspect(InspectArgs),
    /// Remove one or more networks
    #[command(name = "rm", visible_alias = "remove")]
    Remove(RemoveArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Driver to manage the network (bridge, macvlan, ipvlan)
    #[arg(short, long, default_value = "bridge")]
    pub driver: String,
    /// Set driver specific options
    #[arg(short, long)]
    pub opt: Vec<String>,
    /// IP address management driver (host-local or dhcp)
    #[arg(long, default_value = "host-local")]
    pub ipam_driver: String,
    /// Subnet in CIDR format
    #[arg(long)]
    pub subnet: Option<String>,
    /// Gateway for the master subnet
    #[arg(long)]
    pub gateway: Option<String>,
    /// Allocate container IPs from a sub-range
    #[arg(long)]
    pub ip_range: Option<String>,
    /// Set metadata on a network
    #[arg(long)]
    pub label: Vec<String>,
    pub name: String,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only display network names
    #[arg(short, long)]
    pub quiet: bool,
    /// Format the output using a template
    #[arg(long)]
    pub format: Option<String>,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Format the output using a template
    #[arg(short, long)]
    pub format: Option<String>,
    #[arg(required = true)]
    pub networks: Vec<String>,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    #[arg(required = true)]
    pub networks: Vec<String>,
}

/// Split `KEY=VALUE` pairs; a bare key gets an empty value
fn key_values(pairs: &[String], what: &str, require_value: bool) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((k, v)) if !k.is_empty() => {
                out.insert(k.to_string(), v.to_string());
            }
            None if !require_value && !pair.is_empty() => {
                out.insert(pair.clone(), String::new());
            }
            _ => return Err(RuneError::usage(format!("invalid {} {:?}, expected KEY=VALUE", what, pair))),
        }
    }
    Ok(out)
}

impl CreateArgs {
    pub fn to_options(&self) -> Result<CreateNetworkOptions> {
        Ok(CreateNetworkOptions {
            name: self.name.clone(),
            driver: self.driver.parse()?,
            options: key_values(&self.opt, "option", true)?,
            ipam_driver: self.ipam_driver.parse()?,
            subnet: self.subnet.clone(),
            gateway: self.gateway.clone(),
            ip_range: self.ip_range.clone(),
            labels: key_values(&self.label, "label", false)?,
        })
    }
}

/// One `network ls` row
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkRow {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    driver: String,
    labels: String,
}

const NETWORK_TABLE: &str = "{{.ID}}\t{{.Name}}\t{{.Driver}}";

fn network_id(id: Option<u32>) -> String {
    id.map(|i| format!("{:064x}", i)).unwrap_or_default()
}

pub async fn run(config: &GlobalConfig, command: NetworkCommand) -> Result<()> {
    let manager = NetworkManager::new(&config.cni_netconfpath);
    match command {
        NetworkCommand::Create(args) => {
            let created = manager.create(&args.to_options()?)?;
            println!("{}", network_id(created.id));
            Ok(())
        }
        NetworkCommand::List(args) => {
            let summaries = manager.list()?;
            if args.quiet {
                for s in &summaries {
                    println!("{}", s.name);
                }
                return Ok(());
            }
            let rows: Vec<NetworkRow> = summaries
                .into_iter()
                .map(|s| NetworkRow {
                    id: network_id(s.id).chars().take(12).collect(),
                    name: s.name,
                    driver: s.driver,
                    labels: s.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(","),
                })
                .collect();
            print!(
                "{}",
                render_rows_titled(&rows, args.format.as_deref(), NETWORK_TABLE, &[("ID", "NETWORK ID")])?
            );
            Ok(())
        }
        NetworkCommand::Inspect(args) => {
            let mut docs = Vec::new();
            let mut failed = 0;
            for name in &args.networks {
                match manager.inspect(name) {
                    Ok(doc) => docs.push(doc),
                    Err(e) => {
                        failed += 1;
                        eprintln!("Error response from daemon: {}", e);
                    }
                }
            }
            super::print_documents(&docs, args.format.as_deref())?;
            if failed > 0 {
                return Err(RuneError::Aggregate { failed });
            }
            Ok(())
        }
        NetworkCommand::Remove(args) => {
            let manager = &manager;
            super::for_each_target(&args.networks, &mut std::io::stdout(), &mut std::io::stderr(), |name| async move {
                manager.remove(&name).await?;
                Ok(name)
            })
            .await
        }
    }
}

//! Per-container resolv.conf

use crate::error::Result;
use crate::storage::atomic_write;
use std::path::{Path, PathBuf};

pub const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";
const FALLBACK_NAMESERVERS: [&str; 2] = ["8.8.8.8", "8.8.4.4"];

/// DNS settings from `--dns`, `--dns-search` and `--dns-option`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsConfig {
    pub servers: Vec<String>,
    pub search: Vec<String>,
    pub options: Vec<String>,
}

/// Nameservers of a host resolv.conf that a container can reach
fn host_nameservers(host: &str) -> Vec<String> {
    host.lines()
        .filter_map(|l| l.trim().strip_prefix("nameserver"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.starts_with("127.") && s != "::1")
        .collect()
}

/// Render the file: a `search` line, `nameserver` lines, then `options`
pub fn render(dns: &DnsConfig, host: Option<&str>) -> String {
    let mut servers = dns.servers.clone();
    if servers.is_empty() {
        servers = host.map(host_nameservers).unwrap_or_default();
    }
    if servers.is_empty() {
        servers = FALLBACK_NAMESERVERS.iter().map(|s| s.to_string()).collect();
    }

    let mut search = vec!["localdomain".to_string()];
    search.extend(dns.search.iter().filter(|s| s.as_str() != "localdomain").cloned());

    let mut out = format!("search {}\n", search.join(" "));
    for s in servers {
        out.push_str(&format!("nameserver {}\n", s));
    }
    if !dns.options.is_empty() {
        out.push_str(&format!("options {}\n", dns.options.join(" ")));
    }
    out
}

/// Write `<state_dir>/resolv.conf`, returning its path
pub fn write(state_dir: &Path, dns: &DnsConfig) -> Result<PathBuf> {
    let host = std::fs::read_to_string(HOST_RESOLV_CONF).ok();
    let path = state_dir.join("resolv.conf");
    atomic_write(&path, render(dns, host.as_deref()).as_bytes(), 0o644)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_servers() {
        let dns = DnsConfig {
            servers: vec!["1.1.1.1".into()],
            search: vec!["corp.example".into()],
            options: vec!["ndots:2".into()],
        };
        assert_eq!(
            render(&dns, Some("nameserver 9.9.9.9\n")),
            "search localdomain corp.example\nnameserver 1.1.1.1\noptions ndots:2\n"
        );
    }

    #[test]
    fn test_host_servers_skip_loopback() {
        let host = "# generated\nnameserver 127.0.0.53\nnameserver 10.0.0.2\n";
        assert_eq!(
            render(&DnsConfig::default(), Some(host)),
            "search localdomain\nnameserver 10.0.0.2\n"
        );
        let only_loopback = "nameserver 127.0.0.53\n";
        assert!(render(&DnsConfig::default(), Some(only_loopback)).contains("nameserver 8.8.8.8"));
    }

    #[test]
    fn test_write_into_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let dns = DnsConfig {
            servers: vec!["1.1.1.1".into()],
            ..Default::default()
        };
        let path = write(dir.path(), &dns).unwrap();
        assert!(std::fs::read_to_string(path).unwrap().contains("nameserver 1.1.1.1"));
    }
}

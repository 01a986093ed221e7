//! `-p` publish specs

use crate::error::{Result, RuneError};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, TcpListener, UdpSocket};

/// One published port, in the shape the portmap plugin consumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
    #[serde(rename = "hostIP", default, skip_serializing_if = "String::is_empty")]
    pub host_ip: String,
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ip = if self.host_ip.is_empty() { "0.0.0.0" } else { &self.host_ip };
        write!(f, "{}:{}->{}/{}", ip, self.host_port, self.container_port, self.protocol)
    }
}

fn parse_range(s: &str, raw: &str) -> Result<(u16, u16)> {
    let invalid = || RuneError::usage(format!("invalid port specification {:?}", raw));
    let (start, end) = match s.split_once('-') {
        Some((a, b)) => (a.parse::<u16>().map_err(|_| invalid())?, b.parse::<u16>().map_err(|_| invalid())?),
        None => {
            let p = s.parse::<u16>().map_err(|_| invalid())?;
            (p, p)
        }
    };
    if start == 0 || end < start {
        return Err(invalid());
    }
    Ok((start, end))
}

/// A host port the kernel currently considers free
fn free_port(protocol: &str, host_ip: &str) -> Result<u16> {
    let ip = if host_ip.is_empty() { "0.0.0.0" } else { host_ip };
    let port = if protocol == "udp" {
        UdpSocket::bind((ip, 0))?.local_addr()?.port()
    } else {
        TcpListener::bind((ip, 0))?.local_addr()?.port()
    };
    Ok(port)
}

/// Parse `[ip:][hostPort[-end]:]containerPort[-end][/proto]`.
///
/// An omitted host port is replaced by a free one.
pub fn parse_publish(raw: &str) -> Result<Vec<PortMapping>> {
    let invalid = || RuneError::usage(format!("invalid port specification {:?}", raw));
    let (spec, protocol) = match raw.rsplit_once('/') {
        Some((s, p)) => (s, p.to_ascii_lowercase()),
        None => (raw, "tcp".to_string()),
    };
    if !matches!(protocol.as_str(), "tcp" | "udp" | "sctp") {
        return Err(RuneError::usage(format!("invalid protocol {:?} in {:?}", protocol, raw)));
    }

    // IPv6 host addresses come bracketed: [::1]:8080:80
    let (host_ip, rest) = if let Some(stripped) = spec.strip_prefix('[') {
        let (ip, rest) = stripped.split_once("]:").ok_or_else(invalid)?;
        (ip.to_string(), rest)
    } else {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.len() {
            1 | 2 => (String::new(), spec),
            3 => (parts[0].to_string(), &spec[parts[0].len() + 1..]),
            _ => return Err(invalid()),
        }
    };
    if !host_ip.is_empty() {
        host_ip.parse::<IpAddr>().map_err(|_| invalid())?;
    }

    let (host, container) = match rest.split_once(':') {
        Some((h, c)) => (h, c),
        None => ("", rest),
    };
    let (c_start, c_end) = parse_range(container, raw)?;

    let host_ports: Vec<u16> = if host.is_empty() {
        (c_start..=c_end)
            .map(|_| free_port(&protocol, &host_ip))
            .collect::<Result<_>>()?
    } else {
        let (h_start, h_end) = parse_range(host, raw)?;
        if h_end - h_start != c_end - c_start {
            return Err(RuneError::usage(format!(
                "host and container port ranges differ in size in {:?}",
                raw
            )));
        }
        (h_start..=h_end).collect()
    };

    Ok((c_start..=c_end)
        .zip(host_ports)
        .map(|(container_port, host_port)| PortMapping {
            host_port,
            container_port,
            protocol: protocol.clone(),
            host_ip: host_ip.clone(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_spec() {
        let m = parse_publish("127.0.0.1:8080:80").unwrap();
        assert_eq!(
            m,
            vec![PortMapping {
                host_port: 8080,
                container_port: 80,
                protocol: "tcp".into(),
                host_ip: "127.0.0.1".into()
            }]
        );
        assert_eq!(m[0].to_string(), "127.0.0.1:8080->80/tcp");
    }

    #[test]
    fn test_ranges_and_protocol() {
        let m = parse_publish("9000-9001:90-91/udp").unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!((m[1].host_port, m[1].container_port), (9001, 91));
        assert_eq!(m[0].protocol, "udp");
        assert!(parse_publish("9000-9002:90-91").is_err());
    }

    #[test]
    fn test_container_port_only_gets_free_host_port() {
        let m = parse_publish("80").unwrap();
        assert_eq!(m[0].container_port, 80);
        assert_ne!(m[0].host_port, 0);
    }

    #[test]
    fn test_invalid_specs() {
        assert!(parse_publish("abc").is_err());
        assert!(parse_publish("1.2.3:80:80").is_err());
        assert!(parse_publish("80/icmp").is_err());
        assert!(parse_publish("0:80").is_err());
    }

    #[test]
    fn test_serializes_for_portmap_plugin() {
        let m = parse_publish("[::1]:8080:80").unwrap();
        let v = serde_json::to_value(&m[0]).unwrap();
        assert_eq!(v["hostIP"], "::1");
        assert_eq!(v["hostPort"], 8080);
        assert_eq!(v["containerPort"], 80);
    }
}

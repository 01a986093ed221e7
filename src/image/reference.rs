//! Image reference parsing and normalization

use crate::error::{Result, RuneError};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

pub const DEFAULT_DOMAIN: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";

fn path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$")
            .expect("static regex")
    })
}

/// A fully qualified image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub domain: String,
    pub path: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl Reference {
    /// Parse and normalize a user-supplied reference.
    ///
    /// `alpine` becomes `docker.io/library/alpine:latest`.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || RuneError::usage(format!("invalid reference format: {:?}", raw));
        if raw.is_empty() {
            return Err(invalid());
        }

        let (name, digest) = match raw.split_once('@') {
            Some((n, d)) => {
                let (algo, hex) = d.split_once(':').ok_or_else(invalid)?;
                if algo != "sha256" || hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(invalid());
                }
                (n, Some(d.to_string()))
            }
            None => (raw, None),
        };

        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], Some(name[split + 1..].to_string()))
            }
            None => (name, None),
        };
        if let Some(t) = &tag {
            if t.is_empty() || t.len() > 128 || !t.chars().all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c)) {
                return Err(invalid());
            }
        }

        let (domain, path) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
        };
        let path = if domain == DEFAULT_DOMAIN && !path.contains('/') {
            format!("library/{}", path)
        } else {
            path
        };
        if !path_pattern().is_match(&path) {
            return Err(invalid());
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self { domain, path, tag, digest })
    }

    /// `domain/path`
    pub fn repository(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    /// Tag or digest used to address the manifest
    pub fn object(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Registry host serving the repository
    pub fn registry_host(&self) -> &str {
        if self.domain == DEFAULT_DOMAIN {
            "registry-1.docker.io"
        } else {
            &self.domain
        }
    }

    /// Short Docker-style spelling, e.g. `alpine:latest`
    pub fn familiar(&self) -> String {
        let canonical = self.to_string();
        let trimmed = canonical
            .strip_prefix("docker.io/library/")
            .or_else(|| canonical.strip_prefix("docker.io/"))
            .unwrap_or(&canonical);
        trimmed.to_string()
    }

    /// Same repository with another tag
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            tag: Some(tag.to_string()),
            digest: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_names_are_normalized() {
        let r = Reference::parse("alpine").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/alpine:latest");
        assert_eq!(r.familiar(), "alpine:latest");
        assert_eq!(r.registry_host(), "registry-1.docker.io");

        let r = Reference::parse("user/app:1.0").unwrap();
        assert_eq!(r.to_string(), "docker.io/user/app:1.0");
        assert_eq!(r.familiar(), "user/app:1.0");
    }

    #[test]
    fn test_registry_with_port() {
        let r = Reference::parse("localhost:5000/team/app").unwrap();
        assert_eq!(r.domain, "localhost:5000");
        assert_eq!(r.path, "team/app");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.familiar(), "localhost:5000/team/app:latest");
    }

    #[test]
    fn test_digest_reference() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let r = Reference::parse(&format!("ghcr.io/o/app@{}", digest)).unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.object(), digest);
        assert!(Reference::parse("alpine@sha256:short").is_err());
    }

    #[test]
    fn test_invalid_references() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("Alpine").is_err());
        assert!(Reference::parse("alpine:").is_err());
        assert!(matches!(Reference::parse("a b"), Err(RuneError::Usage(_))));
    }
}

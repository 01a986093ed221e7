//! `--user` and `--group-add` resolution against a root filesystem

use crate::error::{Result, RuneError};
use std::path::Path;

/// Process identity for the OCI spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
    pub home: String,
    /// Name as given, kept for `inspect`
    pub username: String,
}

impl Default for ResolvedUser {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            additional_gids: Vec::new(),
            home: "/root".to_string(),
            username: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
    home: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 6 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                home: fields[5].to_string(),
            })
        })
        .collect()
}

fn parse_group(content: &str) -> Vec<GroupEntry> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 3 {
                return None;
            }
            let members = fields
                .get(3)
                .map(|m| m.split(',').filter(|s| !s.is_empty()).map(String::from).collect())
                .unwrap_or_default();
            Some(GroupEntry {
                name: fields[0].to_string(),
                gid: fields[2].parse().ok()?,
                members,
            })
        })
        .collect()
}

/// Files of a root filesystem, read lazily. A missing file is empty.
pub struct UserDb {
    passwd: Vec<PasswdEntry>,
    group: Vec<GroupEntry>,
}

impl UserDb {
    pub fn load(root: &Path) -> Result<Self> {
        let read = |rel: &str| -> Result<String> {
            match std::fs::read_to_string(root.join(rel)) {
                Ok(s) => Ok(s),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
                Err(e) => Err(e.into()),
            }
        };
        Ok(Self {
            passwd: parse_passwd(&read("etc/passwd")?),
            group: parse_group(&read("etc/group")?),
        })
    }

    #[cfg(test)]
    fn from_strings(passwd: &str, group: &str) -> Self {
        Self {
            passwd: parse_passwd(passwd),
            group: parse_group(group),
        }
    }

    fn group_id(&self, spec: &str) -> Result<u32> {
        if let Ok(gid) = spec.parse::<u32>() {
            return Ok(gid);
        }
        self.group
            .iter()
            .find(|g| g.name == spec)
            .map(|g| g.gid)
            .ok_or_else(|| RuneError::usage(format!("unable to find group {}: no matching entries in group file", spec)))
    }

    /// Resolve `user[:group]` plus `--group-add` entries.
    ///
    /// Numeric ids need no passwd entry; names must exist.
    pub fn resolve(&self, user: &str, group_add: &[String]) -> Result<ResolvedUser> {
        let (user_part, group_part) = match user.split_once(':') {
            Some((u, g)) => (u, Some(g)),
            None => (user, None),
        };
        let user_part = if user_part.is_empty() { "0" } else { user_part };

        let entry = match user_part.parse::<u32>() {
            Ok(uid) => self.passwd.iter().find(|p| p.uid == uid).cloned().or(Some(PasswdEntry {
                name: String::new(),
                uid,
                gid: 0,
                home: "/".to_string(),
            })),
            Err(_) => self.passwd.iter().find(|p| p.name == user_part).cloned(),
        }
        .ok_or_else(|| RuneError::usage(format!("unable to find user {}: no matching entries in passwd file", user_part)))?;

        let gid = match group_part {
            Some(g) if !g.is_empty() => self.group_id(g)?,
            _ => entry.gid,
        };

        let mut additional_gids: Vec<u32> = Vec::new();
        if !entry.name.is_empty() {
            for g in &self.group {
                if g.members.iter().any(|m| m == &entry.name) && g.gid != gid {
                    additional_gids.push(g.gid);
                }
            }
        }
        for g in group_add {
            additional_gids.push(self.group_id(g)?);
        }
        additional_gids.sort_unstable();
        additional_gids.dedup();

        let home = if entry.uid == 0 && entry.home == "/" { "/root".to_string() } else { entry.home };
        Ok(ResolvedUser {
            uid: entry.uid,
            gid,
            additional_gids,
            home,
            username: user.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/sh\n\
                          nobody:x:65534:65534:nobody:/nonexistent:/sbin/nologin\n\
                          app:x:1000:1000::/home/app:/bin/sh\n";
    const GROUP: &str = "root:x:0:\nwheel:x:10:app\napp:x:1000:\naudio:x:29:\n";

    #[test]
    fn test_resolve_by_name_picks_supplementary_groups() {
        let db = UserDb::from_strings(PASSWD, GROUP);
        let u = db.resolve("app", &[]).unwrap();
        assert_eq!((u.uid, u.gid), (1000, 1000));
        assert_eq!(u.additional_gids, vec![10]);
        assert_eq!(u.home, "/home/app");
    }

    #[test]
    fn test_resolve_numeric_without_entry() {
        let db = UserDb::from_strings("", "");
        let u = db.resolve("4242:4343", &[]).unwrap();
        assert_eq!((u.uid, u.gid), (4242, 4343));
        assert_eq!(u.home, "/");
    }

    #[test]
    fn test_resolve_group_names_and_group_add() {
        let db = UserDb::from_strings(PASSWD, GROUP);
        let u = db.resolve("nobody:audio", &["wheel".to_string(), "5".to_string()]).unwrap();
        assert_eq!(u.uid, 65534);
        assert_eq!(u.gid, 29);
        assert_eq!(u.additional_gids, vec![5, 10]);
    }

    #[test]
    fn test_unknown_names_fail() {
        let db = UserDb::from_strings(PASSWD, GROUP);
        assert!(db.resolve("ghost", &[]).is_err());
        assert!(db.resolve("app:ghosts", &[]).is_err());
    }

    #[test]
    fn test_load_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let db = UserDb::load(dir.path()).unwrap();
        let u = db.resolve("0", &[]).unwrap();
        assert_eq!(u.home, "/root");
    }
}

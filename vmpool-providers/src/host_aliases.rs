use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use vmpool_common::{CpiError, CpiResult};

use crate::HostAliases;

/// Hosts-style file (`<ip> <hostname>` per line). Upserts replace any line
/// already naming the hostname; other lines are preserved.
pub struct FileHostAliases {
    path: PathBuf,
}

impl FileHostAliases {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

pub(crate) fn upsert_line(contents: &str, hostname: &str, ip: IpAddr) -> String {
    let mut out: Vec<String> = contents
        .lines()
        .filter(|line| {
            let mut fields = line.split_whitespace();
            let _addr = fields.next();
            !fields.any(|name| name == hostname)
        })
        .map(|line| line.to_string())
        .collect();
    out.push(format!("{} {}", ip, hostname));
    let mut rendered = out.join("\n");
    rendered.push('\n');
    rendered
}

#[async_trait]
impl HostAliases for FileHostAliases {
    async fn upsert(&self, hostname: &str, ip: IpAddr) -> CpiResult<()> {
        let current = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(CpiError::cloud(format!(
                    "reading hosts file {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let updated = upsert_line(&current, hostname, ip);
        tokio::fs::write(&self.path, updated).await.map_err(|e| {
            CpiError::cloud(format!("writing hosts file {}: {}", self.path.display(), e))
        })?;
        tracing::debug!(hostname, %ip, path = %self.path.display(), "host alias updated");
        Ok(())
    }
}

/// Process-local aliases, used when no hosts file is configured.
#[derive(Default)]
pub struct MemoryHostAliases {
    entries: Mutex<BTreeMap<String, IpAddr>>,
}

impl MemoryHostAliases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hostname: &str) -> Option<IpAddr> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(hostname)
            .copied()
    }
}

#[async_trait]
impl HostAliases for MemoryHostAliases {
    async fn upsert(&self, hostname: &str, ip: IpAddr) -> CpiResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hostname.to_string(), ip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_existing_hostname() {
        let before = "127.0.0.1 localhost\n10.0.0.1 vm-a.example.com\n";
        let after = upsert_line(before, "vm-a.example.com", "10.0.0.9".parse().unwrap());
        assert_eq!(after, "127.0.0.1 localhost\n10.0.0.9 vm-a.example.com\n");
    }

    #[tokio::test]
    async fn file_aliases_create_missing_file() {
        let path = std::env::temp_dir().join(format!("vmpool-hosts-{}", std::process::id()));
        let _ = tokio::fs::remove_file(&path).await;
        let aliases = FileHostAliases::new(&path);
        aliases.upsert("vm-b", "10.1.1.1".parse().unwrap()).await.unwrap();
        aliases.upsert("vm-c", "10.1.1.2".parse().unwrap()).await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "10.1.1.1 vm-b\n10.1.1.2 vm-c\n");
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn memory_aliases() {
        let aliases = MemoryHostAliases::new();
        aliases.upsert("vm-d", "10.2.2.2".parse().unwrap()).await.unwrap();
        assert_eq!(aliases.get("vm-d"), Some("10.2.2.2".parse().unwrap()));
    }
}

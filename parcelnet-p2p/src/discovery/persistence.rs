//! Persisted peer state.
//!
//! The state file is JSON of the form
//! `{"bans": {"ip or ip:port": expiry}, "bootstrap": [{"IP": .., "Port": ..}]}`
//! with expiries in unix seconds.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::endpoint::Endpoint;
use crate::error::{P2pError, P2pResult};

/// Contents of the state file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistState {
    #[serde(default)]
    pub bans: BTreeMap<String, u64>,
    #[serde(default)]
    pub bootstrap: Vec<Endpoint>,
}

impl PersistState {
    /// Build a state, leaving out bans that expired before `now`.
    pub fn new<'a>(
        bans: impl IntoIterator<Item = (&'a String, &'a SystemTime)>,
        bootstrap: Vec<Endpoint>,
        now: SystemTime,
    ) -> Self {
        let bans = bans
            .into_iter()
            .filter(|(_, expiry)| **expiry > now)
            .map(|(key, expiry)| (key.clone(), to_unix(*expiry)))
            .collect();
        Self { bans, bootstrap }
    }

    /// Bans that are still active at `now`.
    pub fn active_bans(&self, now: SystemTime) -> Vec<(String, SystemTime)> {
        self.bans
            .iter()
            .map(|(key, secs)| (key.clone(), from_unix(*secs)))
            .filter(|(_, expiry)| *expiry > now)
            .collect()
    }
}

fn to_unix(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Far enough in the future for any ban, small enough for every platform.
const MAX_UNIX_SECS: u64 = 1 << 40;

fn from_unix(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.min(MAX_UNIX_SECS))
}

/// Load the state file. A missing file is empty state. The bootstrap list is
/// dropped when the file is older than `max_age`.
pub async fn load_state(path: &Path, max_age: Duration) -> P2pResult<PersistState> {
    let meta = match fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PersistState::default()),
        Err(e) => return Err(e.into()),
    };

    let contents = fs::read(path).await?;
    let mut state: PersistState = serde_json::from_slice(&contents)
        .map_err(|e| P2pError::Serialization(format!("Failed to parse peer file: {}", e)))?;

    let age = meta
        .modified()
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .unwrap_or_default();
    if age > max_age {
        tracing::debug!(path = ?path, age = ?age, "Peer file too old, ignoring bootstrap peers");
        state.bootstrap.clear();
    }

    tracing::info!(
        bans = state.bans.len(),
        bootstrap = state.bootstrap.len(),
        path = ?path,
        "Loaded peer file"
    );
    Ok(state)
}

/// Save the state file.
pub async fn save_state(path: &Path, state: &PersistState) -> P2pResult<()> {
    let contents = serde_json::to_vec(state)?;

    // Write to temp file first, then rename (atomic)
    let temp_path = path.with_extension("tmp");

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(&contents).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await?;

    tracing::debug!(
        bans = state.bans.len(),
        bootstrap = state.bootstrap.len(),
        path = ?path,
        "Saved peer file"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn ep(ip: &str, port: &str) -> Endpoint {
        Endpoint::new(ip, port).unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peers.json");
        let now = SystemTime::now();

        let mut bans = HashMap::new();
        bans.insert("10.0.0.1".to_string(), now + Duration::from_secs(3600));
        bans.insert("10.0.0.2:8108".to_string(), now - Duration::from_secs(1));

        let state = PersistState::new(&bans, vec![ep("10.0.0.3", "8108")], now);
        assert_eq!(state.bans.len(), 1);
        save_state(&path, &state).await.unwrap();

        let loaded = load_state(&path, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(loaded, state);

        let active = loaded.active_bans(now);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_old_file_drops_bootstrap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peers.json");

        let state = PersistState {
            bans: BTreeMap::from([("10.0.0.1".to_string(), 4_000_000_000)]),
            bootstrap: vec![ep("10.0.0.3", "8108")],
        };
        save_state(&path, &state).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let loaded = load_state(&path, Duration::from_millis(10)).await.unwrap();
        assert!(loaded.bootstrap.is_empty());
        assert_eq!(loaded.bans.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_and_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nonexistent.json");
        let loaded = load_state(&path, Duration::from_secs(60)).await.unwrap();
        assert_eq!(loaded, PersistState::default());

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, b"{\"bans\": [").unwrap();
        assert!(load_state(&corrupt, Duration::from_secs(60)).await.is_err());
    }

    #[test]
    fn test_json_format() {
        let state = PersistState {
            bans: BTreeMap::from([("1.2.3.4".to_string(), 100)]),
            bootstrap: vec![ep("5.6.7.8", "8108")],
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(
            json,
            r#"{"bans":{"1.2.3.4":100},"bootstrap":[{"IP":"5.6.7.8","Port":"8108"}]}"#
        );
    }
}

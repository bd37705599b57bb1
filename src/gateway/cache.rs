// src/gateway/cache.rs - Last good dashboard snapshot on disk
//
// Written after every successful fetch so `status --offline` can show hours
// without network. Never used to derive session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::types::DashboardSnapshot;
use crate::infra::paths;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDashboard {
    pub fetched_at: DateTime<Utc>,
    pub snapshot: DashboardSnapshot,
}

#[derive(Debug, Clone)]
pub struct DashboardCache {
    path: PathBuf,
}

impl Default for DashboardCache {
    fn default() -> Self {
        Self::new(paths::dashboard_cache_path())
    }
}

impl DashboardCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when nothing is cached. A corrupt file is treated as
    /// absent.
    pub fn load(&self) -> Option<CachedDashboard> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&content) {
            Ok(cached) => Some(cached),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Ignoring unreadable dashboard cache: {}", e);
                None
            }
        }
    }

    pub fn save(&self, snapshot: &DashboardSnapshot, fetched_at: DateTime<Utc>) -> anyhow::Result<()> {
        let cached = CachedDashboard {
            fetched_at,
            snapshot: snapshot.clone(),
        };
        let json = serde_json::to_vec_pretty(&cached)?;
        paths::write_atomic(&self.path, &json)?;
        Ok(())
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StudySession;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cache_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DashboardCache::new(dir.path().join("cache").join("dashboard.json"));
        assert!(cache.load().is_none());

        let at = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        let snapshot = DashboardSnapshot {
            user_sessions: vec![StudySession {
                id: 1,
                start_time: at,
                hours: Some(1.5),
                location: Some(2),
                period_instance: None,
            }],
            ..Default::default()
        };
        cache.save(&snapshot, at).unwrap();

        let loaded = cache.load().unwrap();
        assert_eq!(loaded.fetched_at, at);
        assert_eq!(loaded.snapshot, snapshot);

        cache.clear().unwrap();
        assert!(cache.load().is_none());
        cache.clear().unwrap();
    }

    #[test]
    fn test_corrupt_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dashboard.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(DashboardCache::new(path).load().is_none());
    }
}

/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_INITIALIZE_STALENESS_SECS: u64 = 180;
pub const DEFAULT_LAST_REQUEST_EXPIRY_SECS: u64 = 10;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SyncConfig {
    pub data_dir: Option<PathBuf>,
    pub query_base_url: Option<String>,
    pub query_token: Option<String>,
    /// Account whose per-user interaction stats are requested and stored.
    pub viewer_id: Option<String>,

    pub page_size: Option<u32>,
    /// Cached windows older than this are discarded at start-up.
    pub initialize_staleness_secs: Option<u64>,
    /// Identical non-refresh requests inside this window are suppressed.
    pub last_request_expiry_secs: Option<u64>,
    pub http_attempts: Option<u32>,
    pub http_timeout_secs: Option<u64>,

    pub log_filter: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            query_base_url: None,
            query_token: None,
            viewer_id: None,
            page_size: Some(DEFAULT_PAGE_SIZE),
            initialize_staleness_secs: Some(DEFAULT_INITIALIZE_STALENESS_SECS),
            last_request_expiry_secs: Some(DEFAULT_LAST_REQUEST_EXPIRY_SECS),
            http_attempts: Some(3),
            http_timeout_secs: Some(30),
            log_filter: Some("info".to_string()),
        }
    }
}

impl SyncConfig {
    /// Reads a JSON config file, then applies `FEEDSYNC_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).with_context(|| format!("read config: {}", path.display()))?;
        let mut cfg: SyncConfig =
            serde_json::from_slice(&raw).with_context(|| format!("parse config: {}", path.display()))?;
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("FEEDSYNC_DATA_DIR") {
            if !v.trim().is_empty() {
                self.data_dir = Some(PathBuf::from(v));
            }
        }
        if let Ok(v) = std::env::var("FEEDSYNC_QUERY_URL") {
            if !v.trim().is_empty() {
                self.query_base_url = Some(v.trim().to_string());
            }
        }
        if let Ok(v) = std::env::var("FEEDSYNC_QUERY_TOKEN") {
            if !v.trim().is_empty() {
                self.query_token = Some(v.trim().to_string());
            }
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 100)
    }

    pub fn initialize_staleness(&self) -> Duration {
        Duration::from_secs(
            self.initialize_staleness_secs
                .unwrap_or(DEFAULT_INITIALIZE_STALENESS_SECS),
        )
    }

    pub fn last_request_expiry(&self) -> Duration {
        Duration::from_secs(
            self.last_request_expiry_secs
                .unwrap_or(DEFAULT_LAST_REQUEST_EXPIRY_SECS),
        )
    }

    pub fn http_attempts(&self) -> u32 {
        self.http_attempts.unwrap_or(3).clamp(1, 5)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.unwrap_or(30).clamp(5, 120))
    }

    pub fn log_filter(&self) -> &str {
        self.log_filter
            .as_deref()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("info")
    }

    pub fn viewer_id(&self) -> Option<&str> {
        self.viewer_id
            .as_deref()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        match self.data_dir.as_ref() {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.resolve_data_dir()?.join("feedsync.db"))
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("FEEDSYNC_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "feedsync", "FeedSync")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("FEEDSYNC_CONFIG") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "feedsync", "FeedSync")
        .context("unable to determine platform config dir")?;
    Ok(proj.config_dir().join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_unset_fields_empty_and_accessors_fall_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, br#"{"page_size": 500, "viewer_id": "  "}"#).unwrap();

        let cfg = SyncConfig::load(&path).expect("load");
        assert_eq!(cfg.page_size(), 100);
        assert_eq!(cfg.initialize_staleness(), Duration::from_secs(180));
        assert_eq!(cfg.last_request_expiry(), Duration::from_secs(10));
        assert_eq!(cfg.viewer_id(), None);
        assert_eq!(cfg.log_filter(), "info");
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.page_size(), 20);
        assert_eq!(cfg.http_attempts(), 3);
        assert_eq!(cfg.http_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.initialize_staleness().as_secs(), 180);
    }

    #[test]
    fn invalid_json_is_reported_with_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{not json").unwrap();
        let err = SyncConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
    }
}

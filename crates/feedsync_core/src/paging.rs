/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use feedsync_protocol::PageRequest;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{
    SyncConfig, DEFAULT_INITIALIZE_STALENESS_SECS, DEFAULT_LAST_REQUEST_EXPIRY_SECS, DEFAULT_PAGE_SIZE,
};
use crate::error::{ExhaustReason, SyncError};
use crate::feed::{FeedIdentity, FeedSource, LoadDirection, PagingState};
use crate::feed_db::{self, CursorRow, FeedDb, FeedEntry};
use crate::freshness::{initialize_action, InitializeAction};
use crate::request_guard::DuplicateRequestGuard;

#[derive(Debug, Clone)]
pub struct PagingConfig {
    pub page_size: u32,
    pub initialize_staleness: Duration,
    pub last_request_expiry: Duration,
    pub viewer_id: Option<String>,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            initialize_staleness: Duration::from_secs(DEFAULT_INITIALIZE_STALENESS_SECS),
            last_request_expiry: Duration::from_secs(DEFAULT_LAST_REQUEST_EXPIRY_SECS),
            viewer_id: None,
        }
    }
}

impl From<&SyncConfig> for PagingConfig {
    fn from(cfg: &SyncConfig) -> Self {
        Self {
            page_size: cfg.page_size(),
            initialize_staleness: cfg.initialize_staleness(),
            last_request_expiry: cfg.last_request_expiry(),
            viewer_id: cfg.viewer_id().map(|s| s.to_string()),
        }
    }
}

#[derive(Debug)]
pub enum LoadOutcome {
    Success {
        exhausted: bool,
        reason: Option<ExhaustReason>,
    },
    /// Nothing was committed; the same load may be retried.
    Error(SyncError),
    /// The source cannot run in the current session (no viewer).
    NoOp,
}

impl LoadOutcome {
    fn more() -> Self {
        LoadOutcome::Success {
            exhausted: false,
            reason: None,
        }
    }

    fn exhausted(reason: ExhaustReason) -> Self {
        LoadOutcome::Success {
            exhausted: true,
            reason: Some(reason),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, LoadOutcome::Success { exhausted: true, .. })
    }

    pub fn exhaust_reason(&self) -> Option<ExhaustReason> {
        match self {
            LoadOutcome::Success { reason, .. } => *reason,
            _ => None,
        }
    }
}

/// What one committed load did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Committed {
    primary: usize,
    connected: usize,
    exhausted: Option<ExhaustReason>,
}

/// Drives one feed identity: decides what to fetch, and commits each
/// response (entities, connections, cursor) in a single transaction.
///
/// Callers keep at most one `load` in flight per controller; `&mut self`
/// enforces that for a single owner.
pub struct PagingController<S: FeedSource> {
    source: Arc<S>,
    db: FeedDb,
    feed: FeedIdentity,
    cfg: PagingConfig,
    guard: DuplicateRequestGuard,
    clock: Arc<dyn Clock>,
}

impl<S: FeedSource> PagingController<S> {
    pub fn new(
        source: Arc<S>,
        db: FeedDb,
        owner_id: impl Into<String>,
        spec: impl Into<String>,
        cfg: PagingConfig,
    ) -> Self {
        let feed = FeedIdentity::new(source.kind(), owner_id, spec);
        let guard = DuplicateRequestGuard::new(cfg.last_request_expiry);
        Self {
            source,
            db,
            feed,
            cfg,
            guard,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn feed(&self) -> &FeedIdentity {
        &self.feed
    }

    /// Live view of this feed: bumped after every committed change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.db.subscribe(&self.feed.key())
    }

    pub async fn list(&self, limit: u32, offset: u32) -> Result<Vec<FeedEntry>> {
        let entries = tokio::task::spawn_blocking({
            let db = self.db.clone();
            let key = self.feed.key();
            move || db.list_feed(&key, limit, offset)
        })
        .await??;
        Ok(entries)
    }

    /// Decides whether the cached window can be shown as-is. A stale or
    /// missing window is cleared before returning `ForceRefresh`.
    pub async fn initialize(&mut self) -> Result<InitializeAction> {
        let key = self.feed.key();
        let latest = tokio::task::spawn_blocking({
            let db = self.db.clone();
            let key = key.clone();
            move || db.latest_cursor(&key)
        })
        .await??;

        let now = self.clock.now_ms();
        let action = initialize_action(
            latest.as_ref().map(|c| c.cached_at_ms),
            now,
            self.cfg.initialize_staleness,
        );
        if action == InitializeAction::ForceRefresh {
            tokio::task::spawn_blocking({
                let db = self.db.clone();
                let key = key.clone();
                move || db.run_transaction(|tx| feed_db::delete_feed(tx, &key))
            })
            .await??;
            self.db.notify_changed(&key);
            self.guard.clear();
            info!(
                "feed {key}: cached window {}, refresh forced",
                if latest.is_some() { "stale" } else { "missing" }
            );
        } else {
            debug!("feed {key}: cached window fresh");
        }
        Ok(action)
    }

    pub async fn load(&mut self, direction: LoadDirection, state: &PagingState) -> LoadOutcome {
        if direction == LoadDirection::Prepend {
            return LoadOutcome::exhausted(ExhaustReason::PrependUnsupported);
        }
        if self.source.requires_viewer() && self.cfg.viewer_id.is_none() {
            debug!("feed {}: no viewer, skipping load", self.feed);
            return LoadOutcome::NoOp;
        }

        let boundary = match direction {
            LoadDirection::Append => match self.resolve_boundary(state).await {
                Ok(Some(cursor)) if !cursor.exhausted => Some(cursor),
                Ok(_) => return LoadOutcome::exhausted(ExhaustReason::EmptyBoundary),
                Err(e) => return LoadOutcome::Error(SyncError::Store(e)),
            },
            _ => None,
        };

        let request = PageRequest {
            feed_kind: self.feed.kind.as_str().to_string(),
            owner_id: self.feed.owner_id.clone(),
            spec: self.feed.spec.clone(),
            limit: self.cfg.page_size,
            until: boundary.as_ref().map(|c| c.since),
            viewer_id: self.cfg.viewer_id.clone(),
        };
        if !self.guard.admit(direction, &request, self.clock.now_ms()) {
            debug!("feed {}: duplicate {direction:?} request suppressed", self.feed);
            return LoadOutcome::exhausted(ExhaustReason::DuplicateRequestSuppressed);
        }

        let bag = match self.source.fetch_page(&request).await {
            Ok(bag) => {
                if bag.is_empty() {
                    debug!("feed {}: {direction:?} returned an empty page", self.feed);
                }
                bag
            }
            Err(e) => {
                self.guard.forget(direction);
                warn!("feed {}: fetch failed: {e:#}", self.feed);
                return LoadOutcome::Error(SyncError::Network(e));
            }
        };

        let cached_at_ms = self.clock.now_ms();
        let committed = tokio::task::spawn_blocking({
            let db = self.db.clone();
            let source = self.source.clone();
            let key = self.feed.key();
            let viewer_id = self.cfg.viewer_id.clone();
            move || {
                db.run_transaction(|tx| {
                    if direction == LoadDirection::Refresh {
                        feed_db::delete_feed(tx, &key)?;
                    }
                    let page = source.reconcile(tx, &bag, viewer_id.as_deref())?;
                    let primary = page.primary.len();
                    let Some(paging) = bag.paging.as_ref() else {
                        return finish_exhausted(tx, &key, boundary.as_ref(), primary, 0, ExhaustReason::EndOfFeed);
                    };

                    let refs = source.to_connections(&page, paging);
                    let start = feed_db::next_position(tx, &key)?;
                    let connected = feed_db::insert_connections(tx, &key, &refs, start)?;
                    let (Some(last), Some(since), Some(until)) = (refs.last(), paging.since, paging.until) else {
                        return finish_exhausted(tx, &key, boundary.as_ref(), primary, connected, ExhaustReason::EndOfFeed);
                    };
                    if let Some(b) = boundary.as_ref() {
                        if since >= b.since {
                            return finish_exhausted(
                                tx,
                                &key,
                                Some(b),
                                primary,
                                connected,
                                ExhaustReason::CursorNotOlder,
                            );
                        }
                    }
                    feed_db::upsert_cursor(
                        tx,
                        &CursorRow {
                            feed_key: key.clone(),
                            item_id: last.entity_id.clone(),
                            since,
                            until,
                            cached_at_ms,
                            exhausted: false,
                        },
                    )?;
                    Ok(Committed {
                        primary,
                        connected,
                        exhausted: None,
                    })
                })
            }
        })
        .await;

        let committed = match committed {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => {
                self.guard.forget(direction);
                warn!("feed {}: commit failed: {e:#}", self.feed);
                return LoadOutcome::Error(SyncError::Store(e));
            }
            Err(e) => {
                self.guard.forget(direction);
                return LoadOutcome::Error(SyncError::Store(e.into()));
            }
        };

        self.db.notify_changed(&self.feed.key());
        if direction == LoadDirection::Refresh {
            self.guard.clear();
        }
        let log_line = format!(
            "feed {}: {direction:?} stored {} items, {} new connections",
            self.feed, committed.primary, committed.connected
        );
        if direction == LoadDirection::Refresh {
            info!("{log_line}");
        } else {
            debug!("{log_line}");
        }

        match committed.exhausted {
            Some(reason) => {
                debug!("feed {}: end of pagination ({reason})", self.feed);
                LoadOutcome::exhausted(reason)
            }
            None => LoadOutcome::more(),
        }
    }

    /// Cursor to continue an append from: the consumer's last item, then the
    /// last stored connection, then the most recent cursor. An item whose
    /// cursor was evicted by a refresh falls through to the next source.
    async fn resolve_boundary(&self, state: &PagingState) -> Result<Option<CursorRow>> {
        let cursor = tokio::task::spawn_blocking({
            let db = self.db.clone();
            let key = self.feed.key();
            let last_item = state.last_item_id.clone();
            move || -> Result<Option<CursorRow>> {
                if let Some(item) = last_item.as_deref() {
                    if let Some(c) = db.cursor_for_item(&key, item)? {
                        return Ok(Some(c));
                    }
                }
                if let Some(conn) = db.last_connection(&key)? {
                    if let Some(c) = db.cursor_for_item(&key, &conn.entity_id)? {
                        return Ok(Some(c));
                    }
                }
                db.latest_cursor(&key)
            }
        })
        .await??;
        Ok(cursor)
    }
}

/// Ends pagination at `boundary`: later appends from it resolve to
/// `EmptyBoundary` until a refresh replaces the cursors.
fn finish_exhausted(
    conn: &rusqlite::Connection,
    feed_key: &str,
    boundary: Option<&CursorRow>,
    primary: usize,
    connected: usize,
    reason: ExhaustReason,
) -> Result<Committed> {
    if let Some(b) = boundary {
        feed_db::mark_cursor_exhausted(conn, feed_key, &b.item_id)?;
    }
    Ok(Committed {
        primary,
        connected,
        exhausted: Some(reason),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_config_follows_sync_config() {
        let cfg = SyncConfig {
            page_size: Some(0),
            viewer_id: Some(" viewer ".to_string()),
            ..SyncConfig::default()
        };
        let p = PagingConfig::from(&cfg);
        assert_eq!(p.page_size, 1);
        assert_eq!(p.viewer_id.as_deref(), Some("viewer"));
        assert_eq!(p.initialize_staleness, Duration::from_secs(180));
        assert_eq!(p.last_request_expiry, Duration::from_secs(10));
    }

    #[test]
    fn outcome_helpers() {
        assert!(LoadOutcome::exhausted(ExhaustReason::EmptyBoundary).is_exhausted());
        assert!(!LoadOutcome::more().is_exhausted());
        assert!(!LoadOutcome::NoOp.is_exhausted());
        assert_eq!(
            LoadOutcome::exhausted(ExhaustReason::PrependUnsupported).exhaust_reason(),
            Some(ExhaustReason::PrependUnsupported)
        );
    }
}

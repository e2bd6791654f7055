/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use feedsync_core::clock::ManualClock;
use feedsync_core::feed::{MessagesFeed, NotesFeed};
use feedsync_core::feed_db::EntityKind;
use feedsync_core::reconcile::{self, ReconciledPage};
use feedsync_core::{
    ExhaustReason, FeedDb, FeedKind, FeedSource, InitializeAction, LoadDirection, LoadOutcome, PagingConfig,
    PagingController, PagingState, RemoteQuery, SyncError,
};
use feedsync_protocol::{PageRequest, PagingMeta, ResponseBag};
use rusqlite::Connection;
use serde_json::{json, Value};

const START_MS: i64 = 1_700_000_000_000;

#[derive(Default)]
struct ScriptedRemote {
    responses: Mutex<VecDeque<std::result::Result<ResponseBag, String>>>,
    requests: Mutex<Vec<PageRequest>>,
    calls: AtomicUsize,
}

impl ScriptedRemote {
    fn push_ok(&self, bag: ResponseBag) {
        self.responses.lock().unwrap().push_back(Ok(bag));
    }

    fn push_err(&self, msg: &str) {
        self.responses.lock().unwrap().push_back(Err(msg.to_string()));
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> PageRequest {
        self.requests.lock().unwrap().last().cloned().expect("a request was sent")
    }
}

#[async_trait]
impl RemoteQuery for ScriptedRemote {
    async fn fetch_page(&self, request: &PageRequest) -> Result<ResponseBag> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(bag)) => Ok(bag),
            Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
            None => Ok(ResponseBag::default()),
        }
    }
}

fn note(id: &str, created_at: i64) -> Value {
    json!({
        "id": id,
        "pubkey": "alice",
        "created_at": created_at,
        "kind": 1,
        "tags": [],
        "content": format!("note {id}"),
        "sig": ""
    })
}

/// `n` notes named `{prefix}{i}`, newest first, with a paging window.
fn page(prefix: &str, n: usize, since: i64, until: i64) -> ResponseBag {
    let ids = (0..n).map(|i| format!("{prefix}{i}")).collect::<Vec<_>>();
    ResponseBag {
        events: ids
            .iter()
            .enumerate()
            .map(|(i, id)| note(id, until - i as i64))
            .collect(),
        paging: Some(PagingMeta {
            since: Some(since),
            until: Some(until),
            order_by: Some("created_at".to_string()),
            elements: ids,
        }),
        ..Default::default()
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    db: FeedDb,
    remote: Arc<ScriptedRemote>,
    clock: ManualClock,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = FeedDb::open(dir.path().join("feedsync.db")).expect("open db");
        Self {
            _dir: dir,
            db,
            remote: Arc::new(ScriptedRemote::default()),
            clock: ManualClock::new(START_MS),
        }
    }

    fn notes(&self) -> PagingController<NotesFeed> {
        PagingController::new(
            Arc::new(NotesFeed::new(self.remote.clone())),
            self.db.clone(),
            "alice",
            "latest",
            PagingConfig::default(),
        )
        .with_clock(Arc::new(self.clock.clone()))
    }

    fn key(&self) -> String {
        "notes:alice:latest".to_string()
    }

    fn connection_ids(&self) -> Vec<String> {
        self.db
            .list_connections(&self.key())
            .unwrap()
            .into_iter()
            .map(|c| c.entity_id)
            .collect()
    }
}

fn assert_more(outcome: &LoadOutcome) {
    assert!(
        matches!(outcome, LoadOutcome::Success { exhausted: false, reason: None }),
        "expected more pages, got {outcome:?}"
    );
}

#[tokio::test]
async fn refresh_then_empty_append_ends_pagination() {
    let h = Harness::new();
    let mut ctl = h.notes();

    assert_eq!(ctl.initialize().await.unwrap(), InitializeAction::ForceRefresh);

    h.remote.push_ok(page("n", 20, 100, 200));
    let outcome = ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;
    assert_more(&outcome);
    assert_eq!(h.db.count_entities(EntityKind::Post).unwrap(), 20);
    assert_eq!(h.db.count_connections(&h.key()).unwrap(), 20);
    let cursor = h.db.latest_cursor(&h.key()).unwrap().expect("cursor");
    assert_eq!((cursor.since, cursor.until), (100, 200));
    assert_eq!(cursor.item_id, "n19");
    assert_eq!(cursor.cached_at_ms, START_MS);

    let outcome = ctl.load(LoadDirection::Append, &PagingState::with_last_item("n19")).await;
    assert_eq!(h.remote.last_request().until, Some(100));
    assert!(outcome.is_exhausted());
    assert_eq!(outcome.exhaust_reason(), Some(ExhaustReason::EndOfFeed));
    assert_eq!(h.db.count_cursors(&h.key()).unwrap(), 1);

    h.clock.advance_ms(60_000);
    let outcome = ctl.load(LoadDirection::Append, &PagingState::with_last_item("n19")).await;
    assert_eq!(outcome.exhaust_reason(), Some(ExhaustReason::EmptyBoundary));
    assert_eq!(h.remote.calls(), 2);
}

#[tokio::test]
async fn append_continues_strictly_older_and_keeps_order() {
    let h = Harness::new();
    let mut ctl = h.notes();

    h.remote.push_ok(page("a", 3, 100, 200));
    assert_more(&ctl.load(LoadDirection::Refresh, &PagingState::empty()).await);
    h.remote.push_ok(page("b", 2, 50, 99));
    assert_more(&ctl.load(LoadDirection::Append, &PagingState::with_last_item("a2")).await);

    assert_eq!(h.connection_ids(), vec!["a0", "a1", "a2", "b0", "b1"]);
    let next = h.db.cursor_for_item(&h.key(), "b1").unwrap().expect("cursor for new batch");
    assert_eq!(next.since, 50);
    assert!(next.since < h.db.cursor_for_item(&h.key(), "a2").unwrap().unwrap().since);

    // no paging state: falls back to the last stored connection
    h.remote.push_ok(page("c", 1, 10, 49));
    assert_more(&ctl.load(LoadDirection::Append, &PagingState::empty()).await);
    assert_eq!(h.remote.last_request().until, Some(50));
}

#[tokio::test]
async fn refresh_evicts_connections_but_keeps_entities() {
    let h = Harness::new();
    let mut ctl = h.notes();

    h.remote.push_ok(page("old", 5, 100, 200));
    ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;
    h.remote.push_ok(page("new", 3, 300, 400));
    assert_more(&ctl.load(LoadDirection::Refresh, &PagingState::empty()).await);

    assert_eq!(h.connection_ids(), vec!["new0", "new1", "new2"]);
    assert_eq!(h.db.count_cursors(&h.key()).unwrap(), 1);
    assert_eq!(h.db.count_entities(EntityKind::Post).unwrap(), 8);
    assert!(h.db.get_post("old4").unwrap().is_some());
}

#[tokio::test]
async fn stale_paging_state_does_not_resurrect_evicted_window() {
    let h = Harness::new();
    let mut ctl = h.notes();

    h.remote.push_ok(page("old", 5, 100, 200));
    ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;
    h.remote.push_ok(page("new", 3, 300, 400));
    ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;

    h.remote.push_ok(page("next", 2, 250, 299));
    let outcome = ctl.load(LoadDirection::Append, &PagingState::with_last_item("old4")).await;
    assert_more(&outcome);
    assert_eq!(h.remote.last_request().until, Some(300));
    assert_eq!(h.connection_ids(), vec!["new0", "new1", "new2", "next0", "next1"]);
}

#[tokio::test]
async fn identical_append_inside_expiry_hits_network_once() {
    let h = Harness::new();
    let mut ctl = h.notes();

    h.remote.push_ok(page("a", 3, 100, 200));
    ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;

    let state = PagingState::with_last_item("a2");
    h.remote.push_ok(page("b", 2, 50, 99));
    assert_more(&ctl.load(LoadDirection::Append, &state).await);
    h.clock.advance_ms(9_999);
    let outcome = ctl.load(LoadDirection::Append, &state).await;
    assert_eq!(outcome.exhaust_reason(), Some(ExhaustReason::DuplicateRequestSuppressed));
    assert_eq!(h.remote.calls(), 2);

    h.clock.advance_ms(1);
    h.remote.push_ok(page("b", 2, 50, 99));
    assert_more(&ctl.load(LoadDirection::Append, &state).await);
    assert_eq!(h.remote.calls(), 3);
    assert_eq!(h.db.count_connections(&h.key()).unwrap(), 5);
}

#[tokio::test]
async fn refresh_is_never_suppressed() {
    let h = Harness::new();
    let mut ctl = h.notes();
    h.remote.push_ok(page("a", 1, 100, 200));
    ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;
    h.remote.push_ok(page("a", 1, 100, 200));
    assert_more(&ctl.load(LoadDirection::Refresh, &PagingState::empty()).await);
    assert_eq!(h.remote.calls(), 2);
}

#[tokio::test]
async fn append_after_refresh_is_not_suppressed() {
    let h = Harness::new();
    let mut ctl = h.notes();
    let state = PagingState::with_last_item("a2");

    h.remote.push_ok(page("a", 3, 100, 200));
    ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;
    h.remote.push_ok(page("b", 2, 50, 99));
    assert_more(&ctl.load(LoadDirection::Append, &state).await);

    // the refresh rebuilds the same window, so the next append repeats the old request
    h.clock.advance_ms(2_000);
    h.remote.push_ok(page("a", 3, 100, 200));
    assert_more(&ctl.load(LoadDirection::Refresh, &PagingState::empty()).await);
    assert_eq!(h.connection_ids(), vec!["a0", "a1", "a2"]);

    h.clock.advance_ms(1_000);
    h.remote.push_ok(page("b", 2, 50, 99));
    let outcome = ctl.load(LoadDirection::Append, &state).await;
    assert_more(&outcome);
    assert_eq!(h.remote.calls(), 4);
    assert_eq!(h.remote.last_request().until, Some(100));
    assert_eq!(h.connection_ids(), vec!["a0", "a1", "a2", "b0", "b1"]);
}

#[tokio::test]
async fn network_failure_commits_nothing_and_retry_is_allowed() {
    let h = Harness::new();
    let mut ctl = h.notes();

    h.remote.push_ok(page("a", 3, 100, 200));
    ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;

    h.remote.push_err("connection reset");
    let state = PagingState::with_last_item("a2");
    let outcome = ctl.load(LoadDirection::Append, &state).await;
    assert!(matches!(outcome, LoadOutcome::Error(SyncError::Network(_))));
    assert_eq!(h.db.count_connections(&h.key()).unwrap(), 3);
    assert_eq!(h.db.count_cursors(&h.key()).unwrap(), 1);

    h.remote.push_ok(page("b", 2, 50, 99));
    assert_more(&ctl.load(LoadDirection::Append, &state).await);
    assert_eq!(h.remote.calls(), 3);
}

#[tokio::test]
async fn failed_refresh_keeps_previous_window() {
    let h = Harness::new();
    let mut ctl = h.notes();
    h.remote.push_ok(page("a", 3, 100, 200));
    ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;

    h.remote.push_err("timeout");
    let outcome = ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;
    assert!(matches!(outcome, LoadOutcome::Error(_)));
    assert_eq!(h.connection_ids(), vec!["a0", "a1", "a2"]);
}

#[tokio::test]
async fn staleness_decides_initialize() {
    let h = Harness::new();
    let mut ctl = h.notes();

    h.remote.push_ok(page("a", 3, 100, 200));
    ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;

    h.clock.advance_ms(180_000);
    assert_eq!(ctl.initialize().await.unwrap(), InitializeAction::SkipRefresh);
    assert_eq!(h.db.count_connections(&h.key()).unwrap(), 3);

    h.clock.advance_ms(1);
    assert_eq!(ctl.initialize().await.unwrap(), InitializeAction::ForceRefresh);
    assert_eq!(h.db.count_connections(&h.key()).unwrap(), 0);
    assert_eq!(h.db.count_cursors(&h.key()).unwrap(), 0);
    assert_eq!(h.db.count_entities(EntityKind::Post).unwrap(), 3);
}

#[tokio::test]
async fn prepend_is_always_exhausted_without_network() {
    let h = Harness::new();
    let mut ctl = h.notes();
    let outcome = ctl.load(LoadDirection::Prepend, &PagingState::with_last_item("x")).await;
    assert_eq!(outcome.exhaust_reason(), Some(ExhaustReason::PrependUnsupported));
    assert_eq!(h.remote.calls(), 0);
}

#[tokio::test]
async fn append_on_empty_feed_has_no_boundary() {
    let h = Harness::new();
    let mut ctl = h.notes();
    let outcome = ctl.load(LoadDirection::Append, &PagingState::empty()).await;
    assert_eq!(outcome.exhaust_reason(), Some(ExhaustReason::EmptyBoundary));
    assert_eq!(h.remote.calls(), 0);
}

#[tokio::test]
async fn window_not_older_than_boundary_writes_no_cursor() {
    let h = Harness::new();
    let mut ctl = h.notes();
    h.remote.push_ok(page("a", 2, 100, 200));
    ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;

    h.remote.push_ok(page("b", 2, 100, 150));
    let outcome = ctl.load(LoadDirection::Append, &PagingState::with_last_item("a1")).await;
    assert_eq!(outcome.exhaust_reason(), Some(ExhaustReason::CursorNotOlder));
    assert_eq!(h.db.count_connections(&h.key()).unwrap(), 4);
    assert_eq!(h.db.count_cursors(&h.key()).unwrap(), 1);

    let outcome = ctl.load(LoadDirection::Append, &PagingState::with_last_item("b1")).await;
    assert_eq!(outcome.exhaust_reason(), Some(ExhaustReason::EmptyBoundary));
}

#[tokio::test]
async fn refresh_without_paging_clears_feed() {
    let h = Harness::new();
    let mut ctl = h.notes();
    h.remote.push_ok(page("a", 2, 100, 200));
    ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;

    let mut bag = page("z", 2, 0, 0);
    bag.paging = None;
    h.remote.push_ok(bag);
    let outcome = ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;
    assert_eq!(outcome.exhaust_reason(), Some(ExhaustReason::EndOfFeed));
    assert!(h.connection_ids().is_empty());
    assert_eq!(h.db.count_cursors(&h.key()).unwrap(), 0);
    assert!(h.db.get_post("z0").unwrap().is_some());
}

#[tokio::test]
async fn messages_without_viewer_are_a_noop() {
    let h = Harness::new();
    let source = Arc::new(MessagesFeed::new(h.remote.clone()));
    let mut ctl = PagingController::new(source.clone(), h.db.clone(), "", "bob", PagingConfig::default());
    assert!(matches!(
        ctl.load(LoadDirection::Refresh, &PagingState::empty()).await,
        LoadOutcome::NoOp
    ));
    assert_eq!(h.remote.calls(), 0);

    let cfg = PagingConfig {
        viewer_id: Some("alice".to_string()),
        ..PagingConfig::default()
    };
    let mut ctl = PagingController::new(source, h.db.clone(), "alice", "bob", cfg);
    h.remote.push_ok(ResponseBag {
        events: vec![json!({"id": "dm1", "pubkey": "bob", "created_at": 5, "kind": 4,
                            "tags": [["p", "alice"]], "content": "ciphertext"})],
        paging: Some(PagingMeta {
            since: Some(5),
            until: Some(5),
            order_by: None,
            elements: vec!["dm1".to_string()],
        }),
        ..Default::default()
    });
    assert_more(&ctl.load(LoadDirection::Refresh, &PagingState::empty()).await);
    assert_eq!(h.remote.last_request().viewer_id.as_deref(), Some("alice"));
    assert_eq!(h.db.count_connections("messages:alice:bob").unwrap(), 1);
}

#[tokio::test]
async fn subscribers_are_notified_after_commit() {
    let h = Harness::new();
    let mut ctl = h.notes();
    let mut rx = ctl.subscribe();
    h.remote.push_ok(page("a", 2, 100, 200));
    ctl.load(LoadDirection::Refresh, &PagingState::empty()).await;
    assert!(rx.has_changed().unwrap());

    let entries = ctl.list(10, 0).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].entity_id, "a0");
    assert_eq!(entries[0].text.as_deref(), Some("note a0"));
}

/// Persists the page like any source, then fails before connections are
/// written.
struct FailingSource {
    inner: NotesFeed,
}

#[async_trait]
impl FeedSource for FailingSource {
    fn kind(&self) -> FeedKind {
        FeedKind::Notes
    }

    fn accepts(&self, kind: EntityKind) -> bool {
        self.inner.accepts(kind)
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<ResponseBag> {
        self.inner.fetch_page(request).await
    }

    fn reconcile(&self, conn: &Connection, bag: &ResponseBag, viewer_id: Option<&str>) -> Result<ReconciledPage> {
        reconcile::reconcile_bag(conn, bag, viewer_id)?;
        anyhow::bail!("disk full")
    }
}

#[tokio::test]
async fn store_failure_mid_batch_rolls_back_everything() {
    let h = Harness::new();
    let mut ok = h.notes();
    h.remote.push_ok(page("a", 2, 100, 200));
    ok.load(LoadDirection::Refresh, &PagingState::empty()).await;

    let source = Arc::new(FailingSource {
        inner: NotesFeed::new(h.remote.clone()),
    });
    let mut failing = PagingController::new(source, h.db.clone(), "alice", "latest", PagingConfig::default());
    h.remote.push_ok(page("b", 3, 300, 400));
    let outcome = failing.load(LoadDirection::Refresh, &PagingState::empty()).await;
    assert!(matches!(outcome, LoadOutcome::Error(SyncError::Store(_))));

    assert_eq!(h.connection_ids(), vec!["a0", "a1"]);
    assert!(h.db.get_post("b0").unwrap().is_none());
    assert_eq!(h.db.count_entities(EntityKind::Post).unwrap(), 2);
}

/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use anyhow::Context;
use feedsync_core::config::{default_config_path, SyncConfig};
use feedsync_core::feed::{ArticlesFeed, FeedSource, FollowPacksFeed, MessagesFeed, NotesFeed};
use feedsync_core::logging::init_tracing;
use feedsync_core::query_client::HttpQueryClient;
use feedsync_core::{FeedDb, InitializeAction, LoadDirection, LoadOutcome, PagingConfig, PagingController, PagingState};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = default_config_path()?;
    let cfg = if config_path.exists() {
        SyncConfig::load(&config_path)?
    } else {
        let mut cfg = SyncConfig::default();
        cfg.apply_env();
        cfg
    };
    init_tracing(cfg.log_filter());

    let feed = std::env::var("FEEDSYNC_FEED").unwrap_or_else(|_| "notes".to_string());
    let owner = std::env::var("FEEDSYNC_OWNER").unwrap_or_else(|_| "global".to_string());
    let spec = std::env::var("FEEDSYNC_SPEC").unwrap_or_else(|_| "latest".to_string());
    let appends: u32 = std::env::var("FEEDSYNC_APPENDS")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(2);

    let db_path = cfg.db_path()?;
    let db = FeedDb::open(&db_path)?;
    info!("store: {}", db.path().display());
    let remote = Arc::new(HttpQueryClient::from_config(&cfg)?);

    match feed.trim() {
        "notes" => run(Arc::new(NotesFeed::new(remote)), db, &cfg, owner, spec, appends).await,
        "articles" => run(Arc::new(ArticlesFeed::new(remote)), db, &cfg, owner, spec, appends).await,
        "follow_packs" => run(Arc::new(FollowPacksFeed::new(remote)), db, &cfg, owner, spec, appends).await,
        "messages" => run(Arc::new(MessagesFeed::new(remote)), db, &cfg, owner, spec, appends).await,
        other => Err(anyhow::anyhow!("unknown feed kind: {other}")),
    }
}

async fn run<S: FeedSource>(
    source: Arc<S>,
    db: FeedDb,
    cfg: &SyncConfig,
    owner: String,
    spec: String,
    appends: u32,
) -> anyhow::Result<()> {
    let mut controller = PagingController::new(source, db, owner, spec, PagingConfig::from(cfg));
    info!("feed: {}", controller.feed());

    let mut outcome = match controller.initialize().await.context("initialize")? {
        InitializeAction::ForceRefresh => Some(controller.load(LoadDirection::Refresh, &PagingState::empty()).await),
        InitializeAction::SkipRefresh => None,
    };

    for _ in 0..appends {
        if let Some(o) = outcome.as_ref() {
            if o.is_exhausted() || matches!(o, LoadOutcome::NoOp) {
                break;
            }
            if let LoadOutcome::Error(e) = o {
                warn!("load failed: {e}");
                break;
            }
        }
        let entries = controller.list(500, 0).await?;
        let state = entries
            .last()
            .map(|e| PagingState::with_last_item(e.entity_id.clone()))
            .unwrap_or_default();
        outcome = Some(controller.load(LoadDirection::Append, &state).await);
    }
    if let Some(o) = outcome.as_ref() {
        info!("last outcome: {o:?}");
    }

    for entry in controller.list(500, 0).await? {
        let who = entry.author_name.or(entry.author_id).unwrap_or_default();
        let text = entry.text.unwrap_or_default().replace('\n', " ");
        let text = text.chars().take(80).collect::<String>();
        match entry.reposted_by {
            Some(by) => println!("{:>4} {} [repost by {by}] {who}: {text}", entry.position, entry.entity_kind.as_str()),
            None => println!("{:>4} {} {who}: {text}", entry.position, entry.entity_kind.as_str()),
        }
    }
    Ok(())
}

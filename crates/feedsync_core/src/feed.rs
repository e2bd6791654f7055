/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use feedsync_protocol::{PageRequest, PagingMeta, ResponseBag};
use rusqlite::Connection;

use crate::feed_db::{ConnectionRef, EntityKind};
use crate::reconcile::{self, ReconciledPage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    Notes,
    Articles,
    FollowPacks,
    Messages,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Notes => "notes",
            FeedKind::Articles => "articles",
            FeedKind::FollowPacks => "follow_packs",
            FeedKind::Messages => "messages",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// (owner, feed specification) a page is requested under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedIdentity {
    pub kind: FeedKind,
    pub owner_id: String,
    pub spec: String,
}

impl FeedIdentity {
    pub fn new(kind: FeedKind, owner_id: impl Into<String>, spec: impl Into<String>) -> Self {
        Self {
            kind,
            owner_id: owner_id.into().trim().to_string(),
            spec: spec.into().trim().to_string(),
        }
    }

    /// Key used by connection and cursor tables.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.kind.as_str(), self.owner_id, self.spec)
    }
}

impl fmt::Display for FeedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadDirection {
    Refresh,
    Prepend,
    Append,
}

/// What the paging consumer currently shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagingState {
    pub last_item_id: Option<String>,
}

impl PagingState {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_last_item(id: impl Into<String>) -> Self {
        Self {
            last_item_id: Some(id.into()),
        }
    }
}

/// Remote query API boundary. Implementations own any retry policy.
#[async_trait]
pub trait RemoteQuery: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<ResponseBag>;
}

/// One content kind driven by the generic paging controller.
#[async_trait]
pub trait FeedSource: Send + Sync + 'static {
    fn kind(&self) -> FeedKind;

    /// Entity kinds that become feed members. Everything else in a page is
    /// persisted but not connected.
    fn accepts(&self, kind: EntityKind) -> bool;

    /// Sources that need a logged-in viewer report `NoOp` without one.
    fn requires_viewer(&self) -> bool {
        false
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<ResponseBag>;

    fn reconcile(&self, conn: &Connection, bag: &ResponseBag, viewer_id: Option<&str>) -> Result<ReconciledPage> {
        reconcile::reconcile_bag(conn, bag, viewer_id)
    }

    /// Feed members in server order. `paging.elements` decides the order
    /// when present, otherwise newest first.
    fn to_connections(&self, page: &ReconciledPage, paging: &PagingMeta) -> Vec<ConnectionRef> {
        let accepted = page
            .primary
            .iter()
            .filter(|p| self.accepts(p.kind))
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(accepted.len());
        if !paging.elements.is_empty() {
            for id in &paging.elements {
                if let Some(item) = accepted.iter().find(|p| &p.id == id) {
                    if seen.insert(item.id.clone()) {
                        out.push(ConnectionRef::new(item.id.clone(), item.kind));
                    }
                }
            }
            return out;
        }

        let mut sorted = accepted;
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        for item in sorted {
            if seen.insert(item.id.clone()) {
                out.push(ConnectionRef::new(item.id.clone(), item.kind));
            }
        }
        out
    }
}

macro_rules! remote_source {
    ($name:ident, $kind:expr, [$($accepted:expr),+ $(,)?]) => {
        #[derive(Clone)]
        pub struct $name {
            remote: Arc<dyn RemoteQuery>,
        }

        impl $name {
            pub fn new(remote: Arc<dyn RemoteQuery>) -> Self {
                Self { remote }
            }
        }

        #[async_trait]
        impl FeedSource for $name {
            fn kind(&self) -> FeedKind {
                $kind
            }

            fn accepts(&self, kind: EntityKind) -> bool {
                [$($accepted),+].contains(&kind)
            }

            async fn fetch_page(&self, request: &PageRequest) -> Result<ResponseBag> {
                self.remote.fetch_page(request).await
            }
        }
    };
}

remote_source!(NotesFeed, FeedKind::Notes, [EntityKind::Post, EntityKind::Repost]);
remote_source!(ArticlesFeed, FeedKind::Articles, [EntityKind::Article]);
remote_source!(FollowPacksFeed, FeedKind::FollowPacks, [EntityKind::FollowPack]);

/// Direct-message conversation between the viewer (owner) and one peer (spec).
#[derive(Clone)]
pub struct MessagesFeed {
    remote: Arc<dyn RemoteQuery>,
}

impl MessagesFeed {
    pub fn new(remote: Arc<dyn RemoteQuery>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl FeedSource for MessagesFeed {
    fn kind(&self) -> FeedKind {
        FeedKind::Messages
    }

    fn accepts(&self, kind: EntityKind) -> bool {
        kind == EntityKind::DirectMessage
    }

    fn requires_viewer(&self) -> bool {
        true
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<ResponseBag> {
        self.remote.fetch_page(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::PrimaryItem;

    struct NoRemote;

    #[async_trait]
    impl RemoteQuery for NoRemote {
        async fn fetch_page(&self, _request: &PageRequest) -> Result<ResponseBag> {
            anyhow::bail!("offline")
        }
    }

    fn page(items: &[(&str, EntityKind, i64)]) -> ReconciledPage {
        ReconciledPage {
            primary: items
                .iter()
                .map(|(id, kind, created_at)| PrimaryItem {
                    id: id.to_string(),
                    kind: *kind,
                    created_at: *created_at,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn feed_key_is_trimmed_and_kind_scoped() {
        let a = FeedIdentity::new(FeedKind::Notes, " alice ", "latest");
        let b = FeedIdentity::new(FeedKind::Articles, "alice", "latest");
        assert_eq!(a.key(), "notes:alice:latest");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn elements_order_wins_and_filters_foreign_kinds() {
        let source = NotesFeed::new(Arc::new(NoRemote));
        let page = page(&[
            ("n1", EntityKind::Post, 10),
            ("a1", EntityKind::Article, 30),
            ("r1", EntityKind::Repost, 20),
        ]);
        let paging = PagingMeta {
            elements: vec!["r1".into(), "missing".into(), "a1".into(), "n1".into(), "r1".into()],
            ..Default::default()
        };
        let ids = source
            .to_connections(&page, &paging)
            .into_iter()
            .map(|c| c.entity_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["r1", "n1"]);
    }

    #[test]
    fn without_elements_newest_first() {
        let source = ArticlesFeed::new(Arc::new(NoRemote));
        let page = page(&[
            ("old", EntityKind::Article, 1),
            ("new", EntityKind::Article, 9),
            ("mid", EntityKind::Article, 5),
        ]);
        let ids = source
            .to_connections(&page, &PagingMeta::default())
            .into_iter()
            .map(|c| c.entity_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn messages_need_a_viewer() {
        let source = MessagesFeed::new(Arc::new(NoRemote));
        assert!(source.requires_viewer());
        assert!(source.accepts(EntityKind::DirectMessage));
        assert!(!source.accepts(EntityKind::Post));
        assert!(!FollowPacksFeed::new(Arc::new(NoRemote)).requires_viewer());
    }
}

/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Profile,
    Post,
    Article,
    Repost,
    Highlight,
    FollowPack,
    DirectMessage,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Profile => "profile",
            EntityKind::Post => "post",
            EntityKind::Article => "article",
            EntityKind::Repost => "repost",
            EntityKind::Highlight => "highlight",
            EntityKind::FollowPack => "follow_pack",
            EntityKind::DirectMessage => "direct_message",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "profile" => EntityKind::Profile,
            "post" => EntityKind::Post,
            "article" => EntityKind::Article,
            "repost" => EntityKind::Repost,
            "highlight" => EntityKind::Highlight,
            "follow_pack" => EntityKind::FollowPack,
            "direct_message" => EntityKind::DirectMessage,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRow {
    pub id: String,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub picture: Option<String>,
    pub about: Option<String>,
    pub nip05: Option<String>,
    pub lud16: Option<String>,
    pub created_at: i64,
    pub raw_json: String,
}

impl ProfileRow {
    pub fn best_name(&self) -> Option<String> {
        self.display_name
            .as_deref()
            .or(self.name.as_deref())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRow {
    pub id: String,
    pub author_id: String,
    pub created_at: i64,
    pub kind: u32,
    pub content: String,
    pub tags_json: String,
    pub raw_json: String,
    pub reply_to_id: Option<String>,
    pub root_id: Option<String>,
    pub quoted_id: Option<String>,
    /// Back-filled from `profiles`.
    pub author_name: Option<String>,
    /// Back-filled from the parent post.
    pub reply_to_author_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleRow {
    pub id: String,
    pub author_id: String,
    pub d_tag: String,
    pub coordinate: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub image: Option<String>,
    pub published_at: Option<i64>,
    pub created_at: i64,
    pub content: String,
    pub raw_json: String,
    pub author_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepostRow {
    pub id: String,
    pub reposter_id: String,
    pub post_id: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighlightRow {
    pub id: String,
    pub author_id: String,
    pub created_at: i64,
    pub content: String,
    pub article_coordinate: Option<String>,
    pub referenced_event_id: Option<String>,
    /// Back-filled from `articles.coordinate`.
    pub article_id: Option<String>,
    pub raw_json: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaResourceRow {
    pub url: String,
    pub mime_type: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPreviewRow {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentType {
    Media,
    Link,
}

impl AttachmentType {
    fn as_str(&self) -> &'static str {
        match self {
            AttachmentType::Media => "media",
            AttachmentType::Link => "link",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostAttachmentRow {
    pub post_id: String,
    pub url: String,
    pub attachment_type: AttachmentType,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayHintRow {
    pub event_id: String,
    pub relay_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStatsRow {
    pub event_id: String,
    pub likes: i64,
    pub replies: i64,
    pub reposts: i64,
    pub zaps: i64,
    pub sats_zapped: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserStatsRow {
    pub event_id: String,
    pub viewer_id: String,
    pub liked: bool,
    pub replied: bool,
    pub reposted: bool,
    pub zapped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapReceiptRow {
    pub id: String,
    pub target_event_id: Option<String>,
    pub sender_id: Option<String>,
    pub receiver_id: Option<String>,
    pub amount_sats: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowPackRow {
    pub id: String,
    pub author_id: String,
    pub d_tag: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub members: Vec<String>,
    pub created_at: i64,
    pub raw_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub created_at: i64,
    /// Ciphertext as received; decryption happens outside the store.
    pub content: String,
}

/// Feed membership for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRef {
    pub entity_id: String,
    pub entity_kind: EntityKind,
}

impl ConnectionRef {
    pub fn new(entity_id: impl Into<String>, entity_kind: EntityKind) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredConnection {
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub position: i64,
}

/// Pagination boundaries of one fetched batch, keyed by the batch's last
/// (oldest) item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorRow {
    pub feed_key: String,
    pub item_id: String,
    pub since: i64,
    pub until: i64,
    pub cached_at_ms: i64,
    /// Set once a load from this boundary came back empty.
    pub exhausted: bool,
}

/// Read model returned by the live feed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub position: i64,
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub created_at: Option<i64>,
    pub author_id: Option<String>,
    pub author_name: Option<String>,
    pub text: Option<String>,
    /// Set for reposts: who reposted the entry's content.
    pub reposted_by: Option<String>,
    pub stats: Option<EventStatsRow>,
}

#[derive(Clone)]
pub struct FeedDb {
    path: PathBuf,
    watchers: Arc<Mutex<HashMap<String, watch::Sender<u64>>>>,
}

impl FeedDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data dir: {}", parent.display()))?;
        }
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS profiles (
              id TEXT PRIMARY KEY,
              name TEXT NULL,
              display_name TEXT NULL,
              picture TEXT NULL,
              about TEXT NULL,
              nip05 TEXT NULL,
              lud16 TEXT NULL,
              created_at INTEGER NOT NULL,
              raw_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS posts (
              id TEXT PRIMARY KEY,
              author_id TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              kind INTEGER NOT NULL,
              content TEXT NOT NULL,
              tags_json TEXT NOT NULL,
              raw_json TEXT NOT NULL,
              reply_to_id TEXT NULL,
              root_id TEXT NULL,
              quoted_id TEXT NULL,
              author_name TEXT NULL,
              reply_to_author_id TEXT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_posts_author ON posts(author_id);
            CREATE INDEX IF NOT EXISTS idx_posts_reply_to ON posts(reply_to_id);

            CREATE TABLE IF NOT EXISTS articles (
              id TEXT PRIMARY KEY,
              author_id TEXT NOT NULL,
              d_tag TEXT NOT NULL,
              coordinate TEXT NOT NULL,
              title TEXT NULL,
              summary TEXT NULL,
              image TEXT NULL,
              published_at INTEGER NULL,
              created_at INTEGER NOT NULL,
              content TEXT NOT NULL,
              raw_json TEXT NOT NULL,
              author_name TEXT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_articles_coordinate ON articles(coordinate, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_articles_author ON articles(author_id);

            CREATE TABLE IF NOT EXISTS reposts (
              id TEXT PRIMARY KEY,
              reposter_id TEXT NOT NULL,
              post_id TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reposts_post ON reposts(post_id);

            CREATE TABLE IF NOT EXISTS highlights (
              id TEXT PRIMARY KEY,
              author_id TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              content TEXT NOT NULL,
              article_coordinate TEXT NULL,
              referenced_event_id TEXT NULL,
              article_id TEXT NULL,
              raw_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_highlights_coordinate ON highlights(article_coordinate);

            CREATE TABLE IF NOT EXISTS media_resources (
              url TEXT PRIMARY KEY,
              mime_type TEXT NULL,
              width INTEGER NULL,
              height INTEGER NULL,
              duration_secs REAL NULL
            );

            CREATE TABLE IF NOT EXISTS link_previews (
              url TEXT PRIMARY KEY,
              title TEXT NULL,
              description TEXT NULL,
              image_url TEXT NULL,
              mime_type TEXT NULL
            );

            CREATE TABLE IF NOT EXISTS post_attachments (
              post_id TEXT NOT NULL,
              url TEXT NOT NULL,
              attachment_type TEXT NOT NULL,
              position INTEGER NOT NULL,
              PRIMARY KEY(post_id, url)
            );
            CREATE INDEX IF NOT EXISTS idx_post_attachments_post ON post_attachments(post_id);

            CREATE TABLE IF NOT EXISTS relay_hints (
              event_id TEXT NOT NULL,
              relay_url TEXT NOT NULL,
              PRIMARY KEY(event_id, relay_url)
            );

            CREATE TABLE IF NOT EXISTS event_stats (
              event_id TEXT PRIMARY KEY,
              likes INTEGER NOT NULL,
              replies INTEGER NOT NULL,
              reposts INTEGER NOT NULL,
              zaps INTEGER NOT NULL,
              sats_zapped INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS event_user_stats (
              event_id TEXT NOT NULL,
              viewer_id TEXT NOT NULL,
              liked INTEGER NOT NULL,
              replied INTEGER NOT NULL,
              reposted INTEGER NOT NULL,
              zapped INTEGER NOT NULL,
              PRIMARY KEY(event_id, viewer_id)
            );

            CREATE TABLE IF NOT EXISTS zap_receipts (
              id TEXT PRIMARY KEY,
              target_event_id TEXT NULL,
              sender_id TEXT NULL,
              receiver_id TEXT NULL,
              amount_sats INTEGER NOT NULL,
              created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_zap_receipts_target ON zap_receipts(target_event_id, amount_sats DESC);

            CREATE TABLE IF NOT EXISTS follow_packs (
              id TEXT PRIMARY KEY,
              author_id TEXT NOT NULL,
              d_tag TEXT NOT NULL,
              title TEXT NULL,
              description TEXT NULL,
              image TEXT NULL,
              members_json TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              raw_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS direct_messages (
              id TEXT PRIMARY KEY,
              sender_id TEXT NOT NULL,
              receiver_id TEXT NULL,
              created_at INTEGER NOT NULL,
              content TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_direct_messages_pair ON direct_messages(sender_id, receiver_id, created_at DESC);

            -- Feed membership. Deleting rows here never touches the entity tables.
            CREATE TABLE IF NOT EXISTS feed_connections (
              feed_key TEXT NOT NULL,
              entity_id TEXT NOT NULL,
              entity_kind TEXT NOT NULL,
              position INTEGER NOT NULL,
              PRIMARY KEY(feed_key, entity_id)
            );
            CREATE INDEX IF NOT EXISTS idx_feed_connections_position ON feed_connections(feed_key, position);
            CREATE INDEX IF NOT EXISTS idx_feed_connections_entity ON feed_connections(entity_id);

            CREATE TABLE IF NOT EXISTS feed_cursors (
              feed_key TEXT NOT NULL,
              item_id TEXT NOT NULL,
              since INTEGER NOT NULL,
              until INTEGER NOT NULL,
              cached_at_ms INTEGER NOT NULL,
              exhausted INTEGER NOT NULL DEFAULT 0,
              PRIMARY KEY(feed_key, item_id)
            );
            CREATE INDEX IF NOT EXISTS idx_feed_cursors_cached ON feed_cursors(feed_key, cached_at_ms DESC);
            "#,
        )?;
        ensure_columns(&conn, "media_resources", &[("duration_secs", "REAL NULL")])?;
        ensure_columns(&conn, "articles", &[("author_name", "TEXT NULL")])?;
        ensure_columns(&conn, "feed_cursors", &[("exhausted", "INTEGER NOT NULL DEFAULT 0")])?;
        Ok(Self {
            path,
            watchers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open db: {}", self.path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// Runs `block` inside one transaction. Any error rolls back every write
    /// the block made. The write lock is taken up front, so a concurrent
    /// writer waits on `busy_timeout` instead of failing mid-transaction.
    pub fn run_transaction<T>(&self, block: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = block(&tx)?;
        tx.commit().context("commit")?;
        Ok(out)
    }

    /// Live query handle for one feed. The value is bumped after every
    /// committed change to that feed's connections.
    pub fn subscribe(&self, feed_key: &str) -> watch::Receiver<u64> {
        let mut g = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        g.entry(feed_key.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// Bumps the feed's live query. Feeds nobody subscribed to are skipped,
    /// and entries whose receivers are all gone are dropped.
    pub fn notify_changed(&self, feed_key: &str) {
        let mut g = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = g.get(feed_key) else {
            return;
        };
        if tx.receiver_count() == 0 {
            g.remove(feed_key);
            return;
        }
        tx.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn latest_cursor(&self, feed_key: &str) -> Result<Option<CursorRow>> {
        latest_cursor(&self.conn()?, feed_key)
    }

    pub fn cursor_for_item(&self, feed_key: &str, item_id: &str) -> Result<Option<CursorRow>> {
        cursor_for_item(&self.conn()?, feed_key, item_id)
    }

    pub fn last_connection(&self, feed_key: &str) -> Result<Option<StoredConnection>> {
        last_connection(&self.conn()?, feed_key)
    }

    pub fn list_connections(&self, feed_key: &str) -> Result<Vec<StoredConnection>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT entity_id, entity_kind, position FROM feed_connections WHERE feed_key=?1 ORDER BY position ASC",
        )?;
        let mut rows = stmt.query(params![feed_key])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            if let Some(c) = map_connection(row)? {
                out.push(c);
            }
        }
        Ok(out)
    }

    pub fn count_connections(&self, feed_key: &str) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM feed_connections WHERE feed_key=?1",
            params![feed_key],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    pub fn count_cursors(&self, feed_key: &str) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM feed_cursors WHERE feed_key=?1",
            params![feed_key],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    pub fn count_entities(&self, kind: EntityKind) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", entity_table(kind)), [], |r| {
            r.get(0)
        })?;
        Ok(n.max(0) as u64)
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<ProfileRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, display_name, picture, about, nip05, lud16, created_at, raw_json FROM profiles WHERE id=?1",
                params![id],
                |r| {
                    Ok(ProfileRow {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        display_name: r.get(2)?,
                        picture: r.get(3)?,
                        about: r.get(4)?,
                        nip05: r.get(5)?,
                        lud16: r.get(6)?,
                        created_at: r.get(7)?,
                        raw_json: r.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_post(&self, id: &str) -> Result<Option<PostRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, author_id, created_at, kind, content, tags_json, raw_json, reply_to_id, root_id, quoted_id, author_name, reply_to_author_id FROM posts WHERE id=?1",
                params![id],
                |r| {
                    Ok(PostRow {
                        id: r.get(0)?,
                        author_id: r.get(1)?,
                        created_at: r.get(2)?,
                        kind: r.get(3)?,
                        content: r.get(4)?,
                        tags_json: r.get(5)?,
                        raw_json: r.get(6)?,
                        reply_to_id: r.get(7)?,
                        root_id: r.get(8)?,
                        quoted_id: r.get(9)?,
                        author_name: r.get(10)?,
                        reply_to_author_id: r.get(11)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_article(&self, id: &str) -> Result<Option<ArticleRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, author_id, d_tag, coordinate, title, summary, image, published_at, created_at, content, raw_json, author_name FROM articles WHERE id=?1",
                params![id],
                |r| {
                    Ok(ArticleRow {
                        id: r.get(0)?,
                        author_id: r.get(1)?,
                        d_tag: r.get(2)?,
                        coordinate: r.get(3)?,
                        title: r.get(4)?,
                        summary: r.get(5)?,
                        image: r.get(6)?,
                        published_at: r.get(7)?,
                        created_at: r.get(8)?,
                        content: r.get(9)?,
                        raw_json: r.get(10)?,
                        author_name: r.get(11)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_highlight(&self, id: &str) -> Result<Option<HighlightRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, author_id, created_at, content, article_coordinate, referenced_event_id, article_id, raw_json FROM highlights WHERE id=?1",
                params![id],
                |r| {
                    Ok(HighlightRow {
                        id: r.get(0)?,
                        author_id: r.get(1)?,
                        created_at: r.get(2)?,
                        content: r.get(3)?,
                        article_coordinate: r.get(4)?,
                        referenced_event_id: r.get(5)?,
                        article_id: r.get(6)?,
                        raw_json: r.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_repost(&self, id: &str) -> Result<Option<RepostRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, reposter_id, post_id, created_at FROM reposts WHERE id=?1",
                params![id],
                |r| {
                    Ok(RepostRow {
                        id: r.get(0)?,
                        reposter_id: r.get(1)?,
                        post_id: r.get(2)?,
                        created_at: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_follow_pack(&self, id: &str) -> Result<Option<FollowPackRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, author_id, d_tag, title, description, image, members_json, created_at, raw_json FROM follow_packs WHERE id=?1",
                params![id],
                |r| {
                    let members_json: String = r.get(6)?;
                    Ok(FollowPackRow {
                        id: r.get(0)?,
                        author_id: r.get(1)?,
                        d_tag: r.get(2)?,
                        title: r.get(3)?,
                        description: r.get(4)?,
                        image: r.get(5)?,
                        members: serde_json::from_str(&members_json).unwrap_or_default(),
                        created_at: r.get(7)?,
                        raw_json: r.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_event_stats(&self, event_id: &str) -> Result<Option<EventStatsRow>> {
        event_stats(&self.conn()?, event_id)
    }

    pub fn get_user_stats(&self, event_id: &str, viewer_id: &str) -> Result<Option<UserStatsRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT event_id, viewer_id, liked, replied, reposted, zapped FROM event_user_stats WHERE event_id=?1 AND viewer_id=?2",
                params![event_id, viewer_id],
                |r| {
                    Ok(UserStatsRow {
                        event_id: r.get(0)?,
                        viewer_id: r.get(1)?,
                        liked: r.get::<_, i64>(2)? != 0,
                        replied: r.get::<_, i64>(3)? != 0,
                        reposted: r.get::<_, i64>(4)? != 0,
                        zapped: r.get::<_, i64>(5)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_zap_receipts(&self, target_event_id: &str, limit: u32) -> Result<Vec<ZapReceiptRow>> {
        let conn = self.conn()?;
        let limit = limit.clamp(1, 500);
        let mut stmt = conn.prepare(
            "SELECT id, target_event_id, sender_id, receiver_id, amount_sats, created_at FROM zap_receipts WHERE target_event_id=?1 ORDER BY amount_sats DESC, created_at DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![target_event_id, limit as i64])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(ZapReceiptRow {
                id: r.get(0)?,
                target_event_id: r.get(1)?,
                sender_id: r.get(2)?,
                receiver_id: r.get(3)?,
                amount_sats: r.get(4)?,
                created_at: r.get(5)?,
            });
        }
        Ok(out)
    }

    pub fn list_post_attachments(&self, post_id: &str) -> Result<Vec<PostAttachmentRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT post_id, url, attachment_type, position FROM post_attachments WHERE post_id=?1 ORDER BY position ASC",
        )?;
        let mut rows = stmt.query(params![post_id])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            let ty: String = r.get(2)?;
            out.push(PostAttachmentRow {
                post_id: r.get(0)?,
                url: r.get(1)?,
                attachment_type: if ty == "link" {
                    AttachmentType::Link
                } else {
                    AttachmentType::Media
                },
                position: r.get(3)?,
            });
        }
        Ok(out)
    }

    pub fn list_relay_hints(&self, event_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT relay_url FROM relay_hints WHERE event_id=?1 ORDER BY relay_url ASC")?;
        let rows = stmt.query_map(params![event_id], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Feed contents in fetched order, joined with their entities and stats.
    pub fn list_feed(&self, feed_key: &str, limit: u32, offset: u32) -> Result<Vec<FeedEntry>> {
        let conn = self.conn()?;
        let limit = limit.clamp(1, 500);
        let mut stmt = conn.prepare(
            "SELECT entity_id, entity_kind, position FROM feed_connections WHERE feed_key=?1 ORDER BY position ASC LIMIT ?2 OFFSET ?3",
        )?;
        let mut rows = stmt.query(params![feed_key, limit as i64, offset as i64])?;
        let mut connections = Vec::new();
        while let Some(row) = rows.next()? {
            if let Some(c) = map_connection(row)? {
                connections.push(c);
            }
        }
        drop(rows);

        let mut out = Vec::with_capacity(connections.len());
        for c in connections {
            out.push(feed_entry(&conn, c)?);
        }
        Ok(out)
    }

    /// Deletes posts and articles that no feed references and that were
    /// created before `cutoff_secs`. Connected entities, and entities
    /// referenced by a connected repost or highlight, are kept.
    pub fn prune_orphan_entities(&self, cutoff_secs: i64, limit: u32) -> Result<u64> {
        let mut conn = self.conn()?;
        let limit = limit.clamp(1, 10_000) as i64;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let posts = tx.execute(
            r#"
            DELETE FROM posts WHERE id IN (
              SELECT p.id FROM posts p
              WHERE p.created_at < ?1
                AND NOT EXISTS (SELECT 1 FROM feed_connections c WHERE c.entity_id = p.id)
                AND NOT EXISTS (
                  SELECT 1 FROM reposts r JOIN feed_connections c ON c.entity_id = r.id
                  WHERE r.post_id = p.id
                )
                AND NOT EXISTS (
                  SELECT 1 FROM posts q JOIN feed_connections c ON c.entity_id = q.id
                  WHERE q.quoted_id = p.id OR q.reply_to_id = p.id
                )
              LIMIT ?2
            )
            "#,
            params![cutoff_secs, limit],
        )?;
        let articles = tx.execute(
            r#"
            DELETE FROM articles WHERE id IN (
              SELECT a.id FROM articles a
              WHERE a.created_at < ?1
                AND NOT EXISTS (SELECT 1 FROM feed_connections c WHERE c.entity_id = a.id)
                AND NOT EXISTS (
                  SELECT 1 FROM highlights h JOIN feed_connections c ON c.entity_id = h.id
                  WHERE h.article_id = a.id
                )
              LIMIT ?2
            )
            "#,
            params![cutoff_secs, limit],
        )?;
        tx.execute(
            "DELETE FROM post_attachments WHERE post_id NOT IN (SELECT id FROM posts)",
            [],
        )?;
        tx.commit()?;
        Ok((posts + articles) as u64)
    }
}

pub fn upsert_profile(conn: &Connection, row: &ProfileRow) -> Result<()> {
    conn.execute(
        r#"INSERT INTO profiles(id, name, display_name, picture, about, nip05, lud16, created_at, raw_json)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
           ON CONFLICT(id) DO UPDATE SET
             name=excluded.name, display_name=excluded.display_name, picture=excluded.picture,
             about=excluded.about, nip05=excluded.nip05, lud16=excluded.lud16,
             created_at=excluded.created_at, raw_json=excluded.raw_json
           WHERE excluded.created_at >= profiles.created_at"#,
        params![
            row.id,
            row.name,
            row.display_name,
            row.picture,
            row.about,
            row.nip05,
            row.lud16,
            row.created_at,
            row.raw_json
        ],
    )?;
    Ok(())
}

pub fn upsert_post(conn: &Connection, row: &PostRow) -> Result<()> {
    conn.execute(
        r#"INSERT INTO posts(id, author_id, created_at, kind, content, tags_json, raw_json, reply_to_id, root_id, quoted_id, author_name, reply_to_author_id)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
           ON CONFLICT(id) DO UPDATE SET
             author_id=excluded.author_id, created_at=excluded.created_at, kind=excluded.kind,
             content=excluded.content, tags_json=excluded.tags_json, raw_json=excluded.raw_json,
             reply_to_id=excluded.reply_to_id, root_id=excluded.root_id, quoted_id=excluded.quoted_id,
             author_name=COALESCE(excluded.author_name, posts.author_name),
             reply_to_author_id=COALESCE(excluded.reply_to_author_id, posts.reply_to_author_id)"#,
        params![
            row.id,
            row.author_id,
            row.created_at,
            row.kind,
            row.content,
            row.tags_json,
            row.raw_json,
            row.reply_to_id,
            row.root_id,
            row.quoted_id,
            row.author_name,
            row.reply_to_author_id
        ],
    )?;
    Ok(())
}

pub fn upsert_article(conn: &Connection, row: &ArticleRow) -> Result<()> {
    conn.execute(
        r#"INSERT INTO articles(id, author_id, d_tag, coordinate, title, summary, image, published_at, created_at, content, raw_json, author_name)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
           ON CONFLICT(id) DO UPDATE SET
             author_id=excluded.author_id, d_tag=excluded.d_tag, coordinate=excluded.coordinate,
             title=excluded.title, summary=excluded.summary, image=excluded.image,
             published_at=excluded.published_at, created_at=excluded.created_at,
             content=excluded.content, raw_json=excluded.raw_json,
             author_name=COALESCE(excluded.author_name, articles.author_name)"#,
        params![
            row.id,
            row.author_id,
            row.d_tag,
            row.coordinate,
            row.title,
            row.summary,
            row.image,
            row.published_at,
            row.created_at,
            row.content,
            row.raw_json,
            row.author_name
        ],
    )?;
    Ok(())
}

pub fn upsert_repost(conn: &Connection, row: &RepostRow) -> Result<()> {
    conn.execute(
        r#"INSERT INTO reposts(id, reposter_id, post_id, created_at) VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT(id) DO UPDATE SET
             reposter_id=excluded.reposter_id, post_id=excluded.post_id, created_at=excluded.created_at"#,
        params![row.id, row.reposter_id, row.post_id, row.created_at],
    )?;
    Ok(())
}

pub fn upsert_highlight(conn: &Connection, row: &HighlightRow) -> Result<()> {
    conn.execute(
        r#"INSERT INTO highlights(id, author_id, created_at, content, article_coordinate, referenced_event_id, article_id, raw_json)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
           ON CONFLICT(id) DO UPDATE SET
             author_id=excluded.author_id, created_at=excluded.created_at, content=excluded.content,
             article_coordinate=excluded.article_coordinate, referenced_event_id=excluded.referenced_event_id,
             article_id=COALESCE(excluded.article_id, highlights.article_id), raw_json=excluded.raw_json"#,
        params![
            row.id,
            row.author_id,
            row.created_at,
            row.content,
            row.article_coordinate,
            row.referenced_event_id,
            row.article_id,
            row.raw_json
        ],
    )?;
    Ok(())
}

pub fn upsert_media_resource(conn: &Connection, row: &MediaResourceRow) -> Result<()> {
    conn.execute(
        r#"INSERT INTO media_resources(url, mime_type, width, height, duration_secs) VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(url) DO UPDATE SET
             mime_type=excluded.mime_type, width=excluded.width, height=excluded.height,
             duration_secs=excluded.duration_secs"#,
        params![row.url, row.mime_type, row.width, row.height, row.duration_secs],
    )?;
    Ok(())
}

pub fn upsert_link_preview(conn: &Connection, row: &LinkPreviewRow) -> Result<()> {
    conn.execute(
        r#"INSERT INTO link_previews(url, title, description, image_url, mime_type) VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(url) DO UPDATE SET
             title=excluded.title, description=excluded.description, image_url=excluded.image_url,
             mime_type=excluded.mime_type"#,
        params![row.url, row.title, row.description, row.image_url, row.mime_type],
    )?;
    Ok(())
}

pub fn upsert_post_attachment(conn: &Connection, row: &PostAttachmentRow) -> Result<()> {
    conn.execute(
        r#"INSERT INTO post_attachments(post_id, url, attachment_type, position) VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT(post_id, url) DO UPDATE SET
             attachment_type=excluded.attachment_type, position=excluded.position"#,
        params![row.post_id, row.url, row.attachment_type.as_str(), row.position],
    )?;
    Ok(())
}

pub fn upsert_relay_hint(conn: &Connection, row: &RelayHintRow) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO relay_hints(event_id, relay_url) VALUES (?1, ?2)",
        params![row.event_id, row.relay_url],
    )?;
    Ok(())
}

pub fn upsert_event_stats(conn: &Connection, row: &EventStatsRow) -> Result<()> {
    conn.execute(
        r#"INSERT INTO event_stats(event_id, likes, replies, reposts, zaps, sats_zapped) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT(event_id) DO UPDATE SET
             likes=excluded.likes, replies=excluded.replies, reposts=excluded.reposts,
             zaps=excluded.zaps, sats_zapped=excluded.sats_zapped"#,
        params![row.event_id, row.likes, row.replies, row.reposts, row.zaps, row.sats_zapped],
    )?;
    Ok(())
}

pub fn upsert_user_stats(conn: &Connection, row: &UserStatsRow) -> Result<()> {
    conn.execute(
        r#"INSERT INTO event_user_stats(event_id, viewer_id, liked, replied, reposted, zapped) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT(event_id, viewer_id) DO UPDATE SET
             liked=excluded.liked, replied=excluded.replied, reposted=excluded.reposted, zapped=excluded.zapped"#,
        params![
            row.event_id,
            row.viewer_id,
            row.liked as i64,
            row.replied as i64,
            row.reposted as i64,
            row.zapped as i64
        ],
    )?;
    Ok(())
}

pub fn upsert_zap_receipt(conn: &Connection, row: &ZapReceiptRow) -> Result<()> {
    conn.execute(
        r#"INSERT INTO zap_receipts(id, target_event_id, sender_id, receiver_id, amount_sats, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT(id) DO UPDATE SET
             target_event_id=excluded.target_event_id, sender_id=excluded.sender_id,
             receiver_id=excluded.receiver_id, amount_sats=excluded.amount_sats, created_at=excluded.created_at"#,
        params![
            row.id,
            row.target_event_id,
            row.sender_id,
            row.receiver_id,
            row.amount_sats,
            row.created_at
        ],
    )?;
    Ok(())
}

pub fn upsert_follow_pack(conn: &Connection, row: &FollowPackRow) -> Result<()> {
    let members_json = serde_json::to_string(&row.members).context("serialize follow pack members")?;
    conn.execute(
        r#"INSERT INTO follow_packs(id, author_id, d_tag, title, description, image, members_json, created_at, raw_json)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
           ON CONFLICT(id) DO UPDATE SET
             author_id=excluded.author_id, d_tag=excluded.d_tag, title=excluded.title,
             description=excluded.description, image=excluded.image, members_json=excluded.members_json,
             created_at=excluded.created_at, raw_json=excluded.raw_json"#,
        params![
            row.id,
            row.author_id,
            row.d_tag,
            row.title,
            row.description,
            row.image,
            members_json,
            row.created_at,
            row.raw_json
        ],
    )?;
    Ok(())
}

pub fn upsert_direct_message(conn: &Connection, row: &DirectMessageRow) -> Result<()> {
    conn.execute(
        r#"INSERT INTO direct_messages(id, sender_id, receiver_id, created_at, content) VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(id) DO UPDATE SET
             sender_id=excluded.sender_id, receiver_id=excluded.receiver_id,
             created_at=excluded.created_at, content=excluded.content"#,
        params![row.id, row.sender_id, row.receiver_id, row.created_at, row.content],
    )?;
    Ok(())
}

/// Second pass over identifiers touched by one batch: fills denormalized
/// columns from rows that now exist, in both directions (new children of
/// old parents and old children of new parents).
pub fn resolve_cross_references(
    conn: &Connection,
    profile_ids: &[String],
    post_ids: &[String],
    article_ids: &[String],
    highlight_ids: &[String],
) -> Result<()> {
    {
        let mut by_author = conn.prepare(
            r#"UPDATE posts SET author_name = COALESCE((
                 SELECT COALESCE(NULLIF(TRIM(display_name), ''), NULLIF(TRIM(name), ''))
                 FROM profiles WHERE profiles.id = posts.author_id), author_name)
               WHERE author_id = ?1"#,
        )?;
        let mut articles_by_author = conn.prepare(
            r#"UPDATE articles SET author_name = COALESCE((
                 SELECT COALESCE(NULLIF(TRIM(display_name), ''), NULLIF(TRIM(name), ''))
                 FROM profiles WHERE profiles.id = articles.author_id), author_name)
               WHERE author_id = ?1"#,
        )?;
        for id in profile_ids {
            by_author.execute(params![id])?;
            articles_by_author.execute(params![id])?;
        }
    }

    {
        let mut own_name = conn.prepare(
            r#"UPDATE posts SET author_name = COALESCE((
                 SELECT COALESCE(NULLIF(TRIM(display_name), ''), NULLIF(TRIM(name), ''))
                 FROM profiles WHERE profiles.id = posts.author_id), author_name)
               WHERE id = ?1"#,
        )?;
        let mut parent_author = conn.prepare(
            r#"UPDATE posts SET reply_to_author_id = (
                 SELECT parent.author_id FROM posts parent WHERE parent.id = posts.reply_to_id)
               WHERE id = ?1 AND reply_to_id IS NOT NULL
                 AND EXISTS (SELECT 1 FROM posts parent WHERE parent.id = posts.reply_to_id)"#,
        )?;
        let mut children = conn.prepare(
            "UPDATE posts SET reply_to_author_id = (SELECT author_id FROM posts parent WHERE parent.id = ?1) WHERE reply_to_id = ?1",
        )?;
        for id in post_ids {
            own_name.execute(params![id])?;
            parent_author.execute(params![id])?;
            children.execute(params![id])?;
        }
    }

    {
        let mut own_name = conn.prepare(
            r#"UPDATE articles SET author_name = COALESCE((
                 SELECT COALESCE(NULLIF(TRIM(display_name), ''), NULLIF(TRIM(name), ''))
                 FROM profiles WHERE profiles.id = articles.author_id), author_name)
               WHERE id = ?1"#,
        )?;
        let mut highlights_for_article = conn.prepare(
            r#"UPDATE highlights SET article_id = ?1
               WHERE article_coordinate = (SELECT coordinate FROM articles WHERE id = ?1)
                 AND (article_id IS NULL OR article_id NOT IN (SELECT id FROM articles)
                      OR (SELECT created_at FROM articles WHERE id = highlights.article_id)
                         <= (SELECT created_at FROM articles WHERE id = ?1))"#,
        )?;
        for id in article_ids {
            own_name.execute(params![id])?;
            highlights_for_article.execute(params![id])?;
        }
    }

    {
        let mut article_for_highlight = conn.prepare(
            r#"UPDATE highlights SET article_id = COALESCE((
                 SELECT a.id FROM articles a
                 WHERE a.coordinate = highlights.article_coordinate
                 ORDER BY a.created_at DESC LIMIT 1), article_id)
               WHERE id = ?1 AND article_coordinate IS NOT NULL"#,
        )?;
        for id in highlight_ids {
            article_for_highlight.execute(params![id])?;
        }
    }
    Ok(())
}

/// Removes every connection and cursor of a feed. Entities stay.
pub fn delete_feed(conn: &Connection, feed_key: &str) -> Result<()> {
    conn.execute("DELETE FROM feed_connections WHERE feed_key=?1", params![feed_key])?;
    conn.execute("DELETE FROM feed_cursors WHERE feed_key=?1", params![feed_key])?;
    Ok(())
}

pub fn next_position(conn: &Connection, feed_key: &str) -> Result<i64> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(position) FROM feed_connections WHERE feed_key=?1",
        params![feed_key],
        |r| r.get(0),
    )?;
    Ok(max.map(|m| m + 1).unwrap_or(0))
}

/// Appends connections starting at `start_position`. Entities already in the
/// feed keep their original position. Returns how many rows were added.
pub fn insert_connections(
    conn: &Connection,
    feed_key: &str,
    refs: &[ConnectionRef],
    start_position: i64,
) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO feed_connections(feed_key, entity_id, entity_kind, position) VALUES (?1, ?2, ?3, ?4)",
    )?;
    let mut added = 0usize;
    let mut position = start_position;
    for r in refs {
        let n = stmt.execute(params![feed_key, r.entity_id, r.entity_kind.as_str(), position])?;
        if n > 0 {
            added += 1;
            position += 1;
        }
    }
    Ok(added)
}

pub fn upsert_cursor(conn: &Connection, row: &CursorRow) -> Result<()> {
    conn.execute(
        r#"INSERT INTO feed_cursors(feed_key, item_id, since, until, cached_at_ms, exhausted) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT(feed_key, item_id) DO UPDATE SET
             since=excluded.since, until=excluded.until, cached_at_ms=excluded.cached_at_ms,
             exhausted=excluded.exhausted"#,
        params![
            row.feed_key,
            row.item_id,
            row.since,
            row.until,
            row.cached_at_ms,
            row.exhausted as i64
        ],
    )?;
    Ok(())
}

pub fn mark_cursor_exhausted(conn: &Connection, feed_key: &str, item_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE feed_cursors SET exhausted=1 WHERE feed_key=?1 AND item_id=?2",
        params![feed_key, item_id],
    )?;
    Ok(())
}

/// Most recently cached cursor; among equal timestamps the oldest window.
pub fn latest_cursor(conn: &Connection, feed_key: &str) -> Result<Option<CursorRow>> {
    let row = conn
        .query_row(
            "SELECT feed_key, item_id, since, until, cached_at_ms, exhausted FROM feed_cursors WHERE feed_key=?1 ORDER BY cached_at_ms DESC, since ASC LIMIT 1",
            params![feed_key],
            map_cursor,
        )
        .optional()?;
    Ok(row)
}

pub fn cursor_for_item(conn: &Connection, feed_key: &str, item_id: &str) -> Result<Option<CursorRow>> {
    let row = conn
        .query_row(
            "SELECT feed_key, item_id, since, until, cached_at_ms, exhausted FROM feed_cursors WHERE feed_key=?1 AND item_id=?2",
            params![feed_key, item_id],
            map_cursor,
        )
        .optional()?;
    Ok(row)
}

pub fn last_connection(conn: &Connection, feed_key: &str) -> Result<Option<StoredConnection>> {
    let mut stmt = conn.prepare(
        "SELECT entity_id, entity_kind, position FROM feed_connections WHERE feed_key=?1 ORDER BY position DESC LIMIT 1",
    )?;
    let mut rows = stmt.query(params![feed_key])?;
    match rows.next()? {
        Some(row) => map_connection(row),
        None => Ok(None),
    }
}

fn event_stats(conn: &Connection, event_id: &str) -> Result<Option<EventStatsRow>> {
    let row = conn
        .query_row(
            "SELECT event_id, likes, replies, reposts, zaps, sats_zapped FROM event_stats WHERE event_id=?1",
            params![event_id],
            |r| {
                Ok(EventStatsRow {
                    event_id: r.get(0)?,
                    likes: r.get(1)?,
                    replies: r.get(2)?,
                    reposts: r.get(3)?,
                    zaps: r.get(4)?,
                    sats_zapped: r.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn map_cursor(r: &rusqlite::Row<'_>) -> rusqlite::Result<CursorRow> {
    Ok(CursorRow {
        feed_key: r.get(0)?,
        item_id: r.get(1)?,
        since: r.get(2)?,
        until: r.get(3)?,
        cached_at_ms: r.get(4)?,
        exhausted: r.get::<_, i64>(5)? != 0,
    })
}

fn map_connection(row: &rusqlite::Row<'_>) -> Result<Option<StoredConnection>> {
    let entity_id: String = row.get(0)?;
    let kind: String = row.get(1)?;
    let position: i64 = row.get(2)?;
    Ok(EntityKind::parse(&kind).map(|entity_kind| StoredConnection {
        entity_id,
        entity_kind,
        position,
    }))
}

fn entity_table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Profile => "profiles",
        EntityKind::Post => "posts",
        EntityKind::Article => "articles",
        EntityKind::Repost => "reposts",
        EntityKind::Highlight => "highlights",
        EntityKind::FollowPack => "follow_packs",
        EntityKind::DirectMessage => "direct_messages",
    }
}

fn feed_entry(conn: &Connection, c: StoredConnection) -> Result<FeedEntry> {
    let mut entry = FeedEntry {
        position: c.position,
        entity_id: c.entity_id.clone(),
        entity_kind: c.entity_kind,
        created_at: None,
        author_id: None,
        author_name: None,
        text: None,
        reposted_by: None,
        stats: None,
    };

    let content_id = match c.entity_kind {
        EntityKind::Repost => {
            let repost: Option<(String, String, i64)> = conn
                .query_row(
                    "SELECT reposter_id, post_id, created_at FROM reposts WHERE id=?1",
                    params![c.entity_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            match repost {
                Some((reposter, post_id, created_at)) => {
                    entry.reposted_by = Some(reposter);
                    entry.created_at = Some(created_at);
                    post_id
                }
                None => return Ok(entry),
            }
        }
        _ => c.entity_id.clone(),
    };

    let summary: Option<(i64, String, Option<String>, Option<String>)> = match c.entity_kind {
        EntityKind::Post | EntityKind::Repost => conn
            .query_row(
                "SELECT created_at, author_id, author_name, content FROM posts WHERE id=?1",
                params![content_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?,
        EntityKind::Article => conn
            .query_row(
                "SELECT created_at, author_id, author_name, COALESCE(title, summary) FROM articles WHERE id=?1",
                params![content_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?,
        EntityKind::Highlight => conn
            .query_row(
                "SELECT h.created_at, h.author_id, COALESCE(NULLIF(TRIM(p.display_name), ''), NULLIF(TRIM(p.name), '')), h.content FROM highlights h LEFT JOIN profiles p ON p.id = h.author_id WHERE h.id=?1",
                params![content_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?,
        EntityKind::FollowPack => conn
            .query_row(
                "SELECT f.created_at, f.author_id, COALESCE(NULLIF(TRIM(p.display_name), ''), NULLIF(TRIM(p.name), '')), f.title FROM follow_packs f LEFT JOIN profiles p ON p.id = f.author_id WHERE f.id=?1",
                params![content_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?,
        EntityKind::DirectMessage => conn
            .query_row(
                "SELECT d.created_at, d.sender_id, COALESCE(NULLIF(TRIM(p.display_name), ''), NULLIF(TRIM(p.name), '')), d.content FROM direct_messages d LEFT JOIN profiles p ON p.id = d.sender_id WHERE d.id=?1",
                params![content_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?,
        EntityKind::Profile => conn
            .query_row(
                "SELECT created_at, id, COALESCE(display_name, name), about FROM profiles WHERE id=?1",
                params![content_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?,
    };

    if let Some((created_at, author_id, author_name, text)) = summary {
        if entry.created_at.is_none() {
            entry.created_at = Some(created_at);
        }
        entry.author_id = Some(author_id);
        entry.author_name = author_name;
        entry.text = text;
    }
    entry.stats = event_stats(conn, &content_id)?;
    Ok(entry)
}

fn ensure_columns(conn: &Connection, table: &str, cols: &[(&str, &str)]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut existing = std::collections::HashSet::new();
    for r in rows {
        existing.insert(r?);
    }
    for (name, ty) in cols {
        if !existing.contains(*name) {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {ty}"), [])?;
        }
    }
    Ok(())
}

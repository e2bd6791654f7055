/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Turns one `ResponseBag` into rows. Everything happens on the caller's
//! connection, which is expected to be inside the load transaction.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use feedsync_protocol::{
    kinds, ResponseBag, WireEvent, WireEventStats, WireLinkPreview, WireMediaResource, WireRelayHint,
    WireUserStats,
};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::feed_db::{
    self, ArticleRow, AttachmentType, DirectMessageRow, EntityKind, EventStatsRow, FollowPackRow,
    HighlightRow, LinkPreviewRow, MediaResourceRow, PostAttachmentRow, PostRow, ProfileRow,
    RelayHintRow, RepostRow, UserStatsRow, ZapReceiptRow,
};

/// A top-level item of the page, eligible to become a feed member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryItem {
    pub id: String,
    pub kind: EntityKind,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileCounts {
    pub profiles: usize,
    pub posts: usize,
    pub articles: usize,
    pub reposts: usize,
    pub highlights: usize,
    pub zap_receipts: usize,
    pub follow_packs: usize,
    pub direct_messages: usize,
    pub media: usize,
    pub link_previews: usize,
    pub attachments: usize,
    pub event_stats: usize,
    pub user_stats: usize,
    pub relay_hints: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciledPage {
    pub primary: Vec<PrimaryItem>,
    /// Items skipped because they could not be decoded.
    pub dropped: usize,
    pub counts: ReconcileCounts,
}

enum Entity {
    Profile(ProfileRow),
    Post(PostRow),
    Repost(RepostRow, Option<PostRow>),
    Article(ArticleRow),
    Highlight(HighlightRow),
    Zap(ZapReceiptRow),
    FollowPack(FollowPackRow),
    DirectMessage(DirectMessageRow),
}

impl Entity {
    fn primary(&self) -> Option<PrimaryItem> {
        let (id, kind, created_at) = match self {
            Entity::Profile(r) => (&r.id, EntityKind::Profile, r.created_at),
            Entity::Post(r) => (&r.id, EntityKind::Post, r.created_at),
            Entity::Repost(r, _) => (&r.id, EntityKind::Repost, r.created_at),
            Entity::Article(r) => (&r.id, EntityKind::Article, r.created_at),
            Entity::Highlight(r) => (&r.id, EntityKind::Highlight, r.created_at),
            Entity::FollowPack(r) => (&r.id, EntityKind::FollowPack, r.created_at),
            Entity::DirectMessage(r) => (&r.id, EntityKind::DirectMessage, r.created_at),
            Entity::Zap(_) => return None,
        };
        Some(PrimaryItem {
            id: id.clone(),
            kind,
            created_at,
        })
    }
}

#[derive(Default)]
struct Batch {
    seen: HashSet<String>,
    /// Profiles are keyed by pubkey, apart from event ids.
    profile_slots: HashMap<String, usize>,
    profiles: Vec<ProfileRow>,
    posts: Vec<PostRow>,
    articles: Vec<ArticleRow>,
    reposts: Vec<RepostRow>,
    highlights: Vec<HighlightRow>,
    zaps: Vec<ZapReceiptRow>,
    follow_packs: Vec<FollowPackRow>,
    direct_messages: Vec<DirectMessageRow>,
}

impl Batch {
    fn push(&mut self, entity: Entity) {
        match entity {
            Entity::Profile(r) => match self.profile_slots.get(&r.id) {
                Some(&slot) => {
                    if r.created_at >= self.profiles[slot].created_at {
                        self.profiles[slot] = r;
                    }
                }
                None => {
                    self.profile_slots.insert(r.id.clone(), self.profiles.len());
                    self.profiles.push(r);
                }
            },
            Entity::Post(r) => self.push_post(r),
            Entity::Repost(r, embedded) => {
                if let Some(post) = embedded {
                    self.push_post(post);
                }
                if self.seen.insert(r.id.clone()) {
                    self.reposts.push(r);
                }
            }
            Entity::Article(r) => {
                if self.seen.insert(r.id.clone()) {
                    self.articles.push(r);
                }
            }
            Entity::Highlight(r) => {
                if self.seen.insert(r.id.clone()) {
                    self.highlights.push(r);
                }
            }
            Entity::Zap(r) => {
                if self.seen.insert(r.id.clone()) {
                    self.zaps.push(r);
                }
            }
            Entity::FollowPack(r) => {
                if self.seen.insert(r.id.clone()) {
                    self.follow_packs.push(r);
                }
            }
            Entity::DirectMessage(r) => {
                if self.seen.insert(r.id.clone()) {
                    self.direct_messages.push(r);
                }
            }
        }
    }

    fn push_post(&mut self, r: PostRow) {
        if self.seen.insert(r.id.clone()) {
            self.posts.push(r);
        }
    }

    /// In-memory half of cross-reference resolution, limited to rows that
    /// arrived together. The SQL pass covers rows from earlier batches.
    fn back_fill(&mut self) {
        let names: HashMap<String, String> = self
            .profiles
            .iter()
            .filter_map(|p| p.best_name().map(|n| (p.id.clone(), n)))
            .collect();
        let post_authors: HashMap<String, String> = self
            .posts
            .iter()
            .map(|p| (p.id.clone(), p.author_id.clone()))
            .collect();

        for post in &mut self.posts {
            if post.author_name.is_none() {
                post.author_name = names.get(&post.author_id).cloned();
            }
            if let Some(parent) = post.reply_to_id.as_ref() {
                if let Some(author) = post_authors.get(parent) {
                    post.reply_to_author_id = Some(author.clone());
                }
            }
        }
        for article in &mut self.articles {
            if article.author_name.is_none() {
                article.author_name = names.get(&article.author_id).cloned();
            }
        }

        let mut newest_by_coordinate: HashMap<&str, (&str, i64)> = HashMap::new();
        for a in &self.articles {
            let slot = newest_by_coordinate
                .entry(a.coordinate.as_str())
                .or_insert((a.id.as_str(), a.created_at));
            if a.created_at > slot.1 {
                *slot = (a.id.as_str(), a.created_at);
            }
        }
        for h in &mut self.highlights {
            if let Some(coord) = h.article_coordinate.as_deref() {
                if let Some((id, _)) = newest_by_coordinate.get(coord) {
                    h.article_id = Some(id.to_string());
                }
            }
        }
    }
}

/// Decodes, cross-links and upserts everything in `bag`. Undecodable items
/// are logged and skipped; any store error aborts the whole call.
pub fn reconcile_bag(conn: &Connection, bag: &ResponseBag, viewer_id: Option<&str>) -> Result<ReconciledPage> {
    let mut page = ReconciledPage::default();

    let media: HashMap<String, MediaResourceRow> = decode_all::<WireMediaResource>("media", &bag.media, &mut page.dropped)
        .into_iter()
        .filter(|m| !m.url.trim().is_empty())
        .map(|m| {
            (
                m.url.clone(),
                MediaResourceRow {
                    url: m.url,
                    mime_type: m.mime_type,
                    width: m.width,
                    height: m.height,
                    duration_secs: m.duration_secs,
                },
            )
        })
        .collect();
    let previews: HashMap<String, LinkPreviewRow> =
        decode_all::<WireLinkPreview>("link_previews", &bag.link_previews, &mut page.dropped)
            .into_iter()
            .filter(|l| !l.url.trim().is_empty())
            .map(|l| {
                (
                    l.url.clone(),
                    LinkPreviewRow {
                        url: l.url,
                        title: l.title,
                        description: l.description,
                        image_url: l.image_url,
                        mime_type: l.mime_type,
                    },
                )
            })
            .collect();

    let mut batch = Batch::default();
    for value in &bag.referenced_events {
        if let Some(entity) = decode_entity("referenced_events", value, &mut page.dropped) {
            batch.push(entity);
        }
    }
    let mut primary_seen = HashSet::new();
    for value in &bag.events {
        if let Some(entity) = decode_entity("events", value, &mut page.dropped) {
            if let Some(item) = entity.primary() {
                if primary_seen.insert(item.id.clone()) {
                    page.primary.push(item);
                }
            }
            batch.push(entity);
        }
    }
    batch.back_fill();

    let stats = decode_all::<WireEventStats>("event_stats", &bag.event_stats, &mut page.dropped);
    let user_stats = decode_all::<WireUserStats>("user_stats", &bag.user_stats, &mut page.dropped);
    let hints = decode_all::<WireRelayHint>("relay_hints", &bag.relay_hints, &mut page.dropped);

    let counts = &mut page.counts;
    for r in &batch.profiles {
        feed_db::upsert_profile(conn, r)?;
        counts.profiles += 1;
    }
    for r in &batch.posts {
        feed_db::upsert_post(conn, r)?;
        counts.posts += 1;
    }
    for r in &batch.articles {
        feed_db::upsert_article(conn, r)?;
        counts.articles += 1;
    }
    for r in &batch.reposts {
        feed_db::upsert_repost(conn, r)?;
        counts.reposts += 1;
    }
    for r in &batch.highlights {
        feed_db::upsert_highlight(conn, r)?;
        counts.highlights += 1;
    }
    for r in &batch.follow_packs {
        feed_db::upsert_follow_pack(conn, r)?;
        counts.follow_packs += 1;
    }
    for r in &batch.direct_messages {
        feed_db::upsert_direct_message(conn, r)?;
        counts.direct_messages += 1;
    }
    for r in &batch.zaps {
        feed_db::upsert_zap_receipt(conn, r)?;
        counts.zap_receipts += 1;
    }

    for r in media.values() {
        feed_db::upsert_media_resource(conn, r)?;
        counts.media += 1;
    }
    for r in previews.values() {
        feed_db::upsert_link_preview(conn, r)?;
        counts.link_previews += 1;
    }
    for post in &batch.posts {
        for att in attachments_for(post, &media, &previews) {
            feed_db::upsert_post_attachment(conn, &att)?;
            counts.attachments += 1;
        }
    }

    for s in stats {
        feed_db::upsert_event_stats(
            conn,
            &EventStatsRow {
                event_id: s.event_id,
                likes: s.likes,
                replies: s.replies,
                reposts: s.reposts,
                zaps: s.zaps,
                sats_zapped: s.satszapped,
            },
        )?;
        counts.event_stats += 1;
    }
    match viewer_id {
        Some(viewer) => {
            for s in user_stats {
                feed_db::upsert_user_stats(
                    conn,
                    &UserStatsRow {
                        event_id: s.event_id,
                        viewer_id: viewer.to_string(),
                        liked: s.liked,
                        replied: s.replied,
                        reposted: s.reposted,
                        zapped: s.zapped,
                    },
                )?;
                counts.user_stats += 1;
            }
        }
        None if !user_stats.is_empty() => {
            debug!("ignoring {} user stats without a viewer", user_stats.len());
        }
        None => {}
    }
    for h in hints {
        feed_db::upsert_relay_hint(
            conn,
            &RelayHintRow {
                event_id: h.event_id,
                relay_url: h.relay_url,
            },
        )?;
        counts.relay_hints += 1;
    }

    feed_db::resolve_cross_references(
        conn,
        &batch.profiles.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
        &batch.posts.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
        &batch.articles.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
        &batch.highlights.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
    )?;

    if page.dropped > 0 {
        warn!("reconcile dropped {} malformed items", page.dropped);
    }
    Ok(page)
}

fn decode_all<T: DeserializeOwned>(section: &'static str, values: &[Value], dropped: &mut usize) -> Vec<T> {
    let mut out = Vec::with_capacity(values.len());
    for v in values {
        match serde_json::from_value::<T>(v.clone()) {
            Ok(item) => out.push(item),
            Err(e) => drop_item(
                SyncError::MalformedItem {
                    section,
                    reason: e.to_string(),
                },
                dropped,
            ),
        }
    }
    out
}

fn drop_item(err: SyncError, dropped: &mut usize) {
    warn!("{err}");
    *dropped += 1;
}

fn decode_entity(section: &'static str, value: &Value, dropped: &mut usize) -> Option<Entity> {
    let ev = match serde_json::from_value::<WireEvent>(value.clone()) {
        Ok(ev) => ev,
        Err(e) => {
            drop_item(
                SyncError::MalformedItem {
                    section,
                    reason: e.to_string(),
                },
                dropped,
            );
            return None;
        }
    };
    match event_to_entity(&ev, value) {
        Ok(Some(entity)) => Some(entity),
        Ok(None) => {
            debug!("skipping unsupported event kind {} ({})", ev.kind, ev.id);
            None
        }
        Err(reason) => {
            drop_item(SyncError::MalformedItem { section, reason }, dropped);
            None
        }
    }
}

fn event_to_entity(ev: &WireEvent, raw: &Value) -> std::result::Result<Option<Entity>, String> {
    if ev.id.trim().is_empty() {
        return Err("missing id".to_string());
    }
    if ev.pubkey.trim().is_empty() {
        return Err(format!("{}: missing pubkey", ev.id));
    }
    let raw_json = raw.to_string();
    let entity = match ev.kind {
        kinds::METADATA => Entity::Profile(profile_from(ev, raw_json)?),
        kinds::TEXT_NOTE => Entity::Post(post_from(ev, raw_json)),
        kinds::REPOST | kinds::GENERIC_REPOST => {
            let embedded = serde_json::from_str::<WireEvent>(&ev.content)
                .ok()
                .filter(|inner| inner.kind == kinds::TEXT_NOTE && !inner.id.trim().is_empty());
            let post_id = ev
                .first_tag("e")
                .map(|s| s.to_string())
                .or_else(|| embedded.as_ref().map(|inner| inner.id.clone()))
                .ok_or_else(|| format!("{}: repost without target", ev.id))?;
            let embedded = embedded.map(|inner| {
                let raw = serde_json::to_string(&inner).unwrap_or_default();
                post_from(&inner, raw)
            });
            Entity::Repost(
                RepostRow {
                    id: ev.id.clone(),
                    reposter_id: ev.pubkey.clone(),
                    post_id,
                    created_at: ev.created_at,
                },
                embedded,
            )
        }
        kinds::LONG_FORM => {
            let d_tag = ev
                .first_tag("d")
                .ok_or_else(|| format!("{}: article without d tag", ev.id))?
                .to_string();
            Entity::Article(ArticleRow {
                id: ev.id.clone(),
                author_id: ev.pubkey.clone(),
                coordinate: format!("{}:{}:{}", kinds::LONG_FORM, ev.pubkey, d_tag),
                d_tag,
                title: non_empty(ev.first_tag("title")),
                summary: non_empty(ev.first_tag("summary")),
                image: non_empty(ev.first_tag("image")),
                published_at: ev.first_tag("published_at").and_then(|s| s.trim().parse().ok()),
                created_at: ev.created_at,
                content: ev.content.clone(),
                raw_json,
                author_name: None,
            })
        }
        kinds::HIGHLIGHT => Entity::Highlight(HighlightRow {
            id: ev.id.clone(),
            author_id: ev.pubkey.clone(),
            created_at: ev.created_at,
            content: ev.content.clone(),
            article_coordinate: non_empty(ev.first_tag("a")),
            referenced_event_id: non_empty(ev.first_tag("e")),
            article_id: None,
            raw_json,
        }),
        kinds::ZAP_RECEIPT => {
            let request = ev
                .first_tag("description")
                .and_then(|d| serde_json::from_str::<WireEvent>(d).ok());
            let amount_sats = request
                .as_ref()
                .and_then(|r| r.first_tag("amount"))
                .and_then(|a| a.trim().parse::<i64>().ok())
                .map(|msats| msats / 1000)
                .unwrap_or(0);
            Entity::Zap(ZapReceiptRow {
                id: ev.id.clone(),
                target_event_id: non_empty(ev.first_tag("e")),
                sender_id: request.map(|r| r.pubkey),
                receiver_id: non_empty(ev.first_tag("p")),
                amount_sats,
                created_at: ev.created_at,
            })
        }
        kinds::FOLLOW_PACK => {
            let d_tag = ev.first_tag("d").unwrap_or_default().to_string();
            Entity::FollowPack(FollowPackRow {
                id: ev.id.clone(),
                author_id: ev.pubkey.clone(),
                d_tag,
                title: non_empty(ev.first_tag("title")),
                description: non_empty(ev.first_tag("description")),
                image: non_empty(ev.first_tag("image")),
                members: ev.tag_values("p").map(|s| s.to_string()).collect(),
                created_at: ev.created_at,
                raw_json,
            })
        }
        kinds::ENCRYPTED_DM => Entity::DirectMessage(DirectMessageRow {
            id: ev.id.clone(),
            sender_id: ev.pubkey.clone(),
            receiver_id: non_empty(ev.first_tag("p")),
            created_at: ev.created_at,
            content: ev.content.clone(),
        }),
        _ => return Ok(None),
    };
    Ok(Some(entity))
}

fn profile_from(ev: &WireEvent, raw_json: String) -> std::result::Result<ProfileRow, String> {
    let meta: Value = serde_json::from_str(&ev.content).map_err(|e| format!("{}: profile content: {e}", ev.id))?;
    let field = |name: &str| {
        meta.get(name)
            .and_then(|v| v.as_str())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };
    Ok(ProfileRow {
        id: ev.pubkey.clone(),
        name: field("name"),
        display_name: field("display_name"),
        picture: field("picture"),
        about: field("about"),
        nip05: field("nip05"),
        lud16: field("lud16"),
        created_at: ev.created_at,
        raw_json,
    })
}

fn post_from(ev: &WireEvent, raw_json: String) -> PostRow {
    let positional = ev.tags.iter().filter(|t| t.first().map(|s| s.as_str()) == Some("e")).all(|t| t.get(3).is_none());
    let (reply_to_id, root_id) = if positional {
        // legacy ordering: first e tag is the root, last is the parent
        let es = ev.tag_values("e").collect::<Vec<_>>();
        (es.last().map(|s| s.to_string()), es.first().map(|s| s.to_string()))
    } else {
        let root = ev.marked_tag("e", "root").map(|s| s.to_string());
        let reply = ev.marked_tag("e", "reply").map(|s| s.to_string()).or_else(|| root.clone());
        (reply, root)
    };
    PostRow {
        id: ev.id.clone(),
        author_id: ev.pubkey.clone(),
        created_at: ev.created_at,
        kind: ev.kind,
        content: ev.content.clone(),
        tags_json: serde_json::to_string(&ev.tags).unwrap_or_else(|_| "[]".to_string()),
        raw_json,
        reply_to_id,
        root_id,
        quoted_id: non_empty(ev.first_tag("q")),
        author_name: None,
        reply_to_author_id: None,
    }
}

fn attachments_for(
    post: &PostRow,
    media: &HashMap<String, MediaResourceRow>,
    previews: &HashMap<String, LinkPreviewRow>,
) -> Vec<PostAttachmentRow> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let urls = post
        .content
        .split_whitespace()
        .map(|w| w.trim_end_matches(|c: char| matches!(c, ',' | '.' | ')' | ']' | '!' | '?')))
        .filter(|w| w.starts_with("http://") || w.starts_with("https://"));
    for url in urls {
        let attachment_type = if media.contains_key(url) {
            AttachmentType::Media
        } else if previews.contains_key(url) {
            AttachmentType::Link
        } else {
            continue;
        };
        if !seen.insert(url.to_string()) {
            continue;
        }
        out.push(PostAttachmentRow {
            post_id: post.id.clone(),
            url: url.to_string(),
            attachment_type,
            position: out.len() as i64,
        });
    }
    out
}

fn non_empty(v: Option<&str>) -> Option<String> {
    v.map(|s| s.trim()).filter(|s| !s.is_empty()).map(|s| s.to_string())
}

/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod kinds {
    pub const METADATA: u32 = 0;
    pub const TEXT_NOTE: u32 = 1;
    pub const ENCRYPTED_DM: u32 = 4;
    pub const REPOST: u32 = 6;
    pub const GENERIC_REPOST: u32 = 16;
    pub const ZAP_RECEIPT: u32 = 9735;
    pub const HIGHLIGHT: u32 = 9802;
    pub const LONG_FORM: u32 = 30023;
    pub const FOLLOW_PACK: u32 = 39089;
}

/// One page query sent to the remote query API.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub feed_kind: String,
    pub owner_id: String,
    pub spec: String,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct PagingMeta {
    #[serde(default)]
    pub since: Option<i64>,
    #[serde(default)]
    pub until: Option<i64>,
    #[serde(default)]
    pub order_by: Option<String>,
    /// Ids of the primary items, in server order.
    #[serde(default)]
    pub elements: Vec<String>,
}

/// Everything one query call returned. Items stay as raw JSON so that a
/// single undecodable entry can be skipped without rejecting the page.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ResponseBag {
    #[serde(default)]
    pub paging: Option<PagingMeta>,
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default)]
    pub referenced_events: Vec<Value>,
    #[serde(default)]
    pub event_stats: Vec<Value>,
    #[serde(default)]
    pub user_stats: Vec<Value>,
    #[serde(default)]
    pub media: Vec<Value>,
    #[serde(default)]
    pub link_previews: Vec<Value>,
    #[serde(default)]
    pub relay_hints: Vec<Value>,
}

impl ResponseBag {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.referenced_events.is_empty()
            && self.event_stats.is_empty()
            && self.user_stats.is_empty()
            && self.media.is_empty()
            && self.link_previews.is_empty()
            && self.relay_hints.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WireEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sig: String,
}

impl WireEvent {
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(|s| s.as_str()) == Some(name))
            .filter_map(|t| t.get(1).map(|s| s.as_str()))
    }

    pub fn first_tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(|s| s.as_str()) == Some(name))
            .and_then(|t| t.get(1).map(|s| s.as_str()))
    }

    /// Value of the first `name` tag whose marker (4th element) equals `marker`.
    pub fn marked_tag(&self, name: &str, marker: &str) -> Option<&str> {
        self.tags
            .iter()
            .filter(|t| t.first().map(|s| s.as_str()) == Some(name))
            .find(|t| t.get(3).map(|s| s.as_str()) == Some(marker))
            .and_then(|t| t.get(1).map(|s| s.as_str()))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WireEventStats {
    pub event_id: String,
    #[serde(default)]
    pub likes: i64,
    #[serde(default)]
    pub replies: i64,
    #[serde(default)]
    pub reposts: i64,
    #[serde(default)]
    pub zaps: i64,
    #[serde(default)]
    pub satszapped: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WireUserStats {
    pub event_id: String,
    #[serde(default)]
    pub liked: bool,
    #[serde(default)]
    pub replied: bool,
    #[serde(default)]
    pub reposted: bool,
    #[serde(default)]
    pub zapped: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WireMediaResource {
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WireLinkPreview {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WireRelayHint {
    pub event_id: String,
    pub relay_url: String,
}

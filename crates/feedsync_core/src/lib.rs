/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
pub mod feed_db;
pub mod freshness;
pub mod http_retry;
pub mod logging;
pub mod paging;
pub mod query_client;
pub mod reconcile;
pub mod request_guard;

pub use error::{ExhaustReason, SyncError};
pub use feed::{FeedIdentity, FeedKind, FeedSource, LoadDirection, PagingState, RemoteQuery};
pub use feed_db::FeedDb;
pub use freshness::InitializeAction;
pub use paging::{LoadOutcome, PagingConfig, PagingController};

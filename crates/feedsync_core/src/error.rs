/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Transport or query-layer failure. Nothing was committed, so the same
    /// load can simply be issued again.
    #[error("network failure: {0:#}")]
    Network(anyhow::Error),
    #[error("store failure: {0:#}")]
    Store(anyhow::Error),
    /// Per-item decode failure. The reconciler logs and drops these; they
    /// never fail a batch.
    #[error("malformed {section} item: {reason}")]
    MalformedItem { section: &'static str, reason: String },
}

/// Why a successful load reported the end of pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustReason {
    /// The server returned no further items or no paging window.
    EndOfFeed,
    /// Append had no cursor to continue from.
    EmptyBoundary,
    /// Same request issued again inside the expiry window.
    DuplicateRequestSuppressed,
    /// Feeds only grow backward in time.
    PrependUnsupported,
    /// The server answered an append with a window that is not older than
    /// the boundary we asked for.
    CursorNotOlder,
}

impl fmt::Display for ExhaustReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExhaustReason::EndOfFeed => "end_of_feed",
            ExhaustReason::EmptyBoundary => "empty_boundary",
            ExhaustReason::DuplicateRequestSuppressed => "duplicate_request_suppressed",
            ExhaustReason::PrependUnsupported => "prepend_unsupported",
            ExhaustReason::CursorNotOlder => "cursor_not_older",
        };
        f.write_str(s)
    }
}

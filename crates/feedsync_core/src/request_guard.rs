/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;
use std::time::Duration;

use feedsync_protocol::PageRequest;

use crate::feed::LoadDirection;

#[derive(Debug, Clone)]
struct IssuedRequest {
    request: PageRequest,
    issued_at_ms: i64,
}

/// Remembers the last request per load direction for one feed identity.
/// Owned by the paging controller of that feed, never shared.
#[derive(Debug, Clone)]
pub struct DuplicateRequestGuard {
    expiry: Duration,
    last: HashMap<LoadDirection, IssuedRequest>,
}

impl DuplicateRequestGuard {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            last: HashMap::new(),
        }
    }

    /// Returns `false` when `request` repeats the previous request for the
    /// same direction within the expiry window. Otherwise records it and
    /// returns `true`. Refresh always passes.
    pub fn admit(&mut self, direction: LoadDirection, request: &PageRequest, now_ms: i64) -> bool {
        if direction != LoadDirection::Refresh {
            if let Some(prev) = self.last.get(&direction) {
                let expiry_ms = i64::try_from(self.expiry.as_millis()).unwrap_or(i64::MAX);
                let age = now_ms.saturating_sub(prev.issued_at_ms);
                if prev.request == *request && age < expiry_ms {
                    return false;
                }
            }
        }
        self.last.insert(
            direction,
            IssuedRequest {
                request: request.clone(),
                issued_at_ms: now_ms,
            },
        );
        true
    }

    /// Drops the remembered request for `direction`, so a retry after a
    /// failed fetch is not vetoed.
    pub fn forget(&mut self, direction: LoadDirection) {
        self.last.remove(&direction);
    }

    pub fn clear(&mut self) {
        self.last.clear();
    }
}

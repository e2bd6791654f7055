/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializeAction {
    ForceRefresh,
    SkipRefresh,
}

/// Start-up decision for a cached window. No cursor at all means there is
/// nothing to reuse. A cursor written "in the future" (clock moved back) is
/// treated as fresh.
pub fn initialize_action(cached_at_ms: Option<i64>, now_ms: i64, staleness: Duration) -> InitializeAction {
    match cached_at_ms {
        None => InitializeAction::ForceRefresh,
        Some(cached_at) if is_stale(cached_at, now_ms, staleness) => InitializeAction::ForceRefresh,
        Some(_) => InitializeAction::SkipRefresh,
    }
}

pub fn is_stale(cached_at_ms: i64, now_ms: i64, staleness: Duration) -> bool {
    let max_age = i64::try_from(staleness.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_sub(cached_at_ms) > max_age
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE_MIN: Duration = Duration::from_secs(180);

    #[test]
    fn missing_cursor_forces_refresh() {
        assert_eq!(initialize_action(None, 1_000, THREE_MIN), InitializeAction::ForceRefresh);
    }

    #[test]
    fn boundary_is_exclusive() {
        let cached = 1_000_000;
        assert_eq!(
            initialize_action(Some(cached), cached + 180_000, THREE_MIN),
            InitializeAction::SkipRefresh
        );
        assert_eq!(
            initialize_action(Some(cached), cached + 180_001, THREE_MIN),
            InitializeAction::ForceRefresh
        );
    }

    #[test]
    fn cursor_from_the_future_is_fresh() {
        assert!(!is_stale(5_000, 1_000, THREE_MIN));
    }
}

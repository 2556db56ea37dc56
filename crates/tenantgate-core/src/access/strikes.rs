// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Consecutive rate-limit refusals per session and per IP.
//!
//! Counts live in process memory and are approximate across replicas; the
//! bans they trigger are written through the store.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Subject {
    Session(Uuid),
    Ip(String),
}

#[derive(Debug, Clone, Copy)]
struct Strike {
    count: u32,
    last: Instant,
}

/// Strike counts after recording a refusal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrikeCount {
    pub session: u32,
    pub ip: u32,
}

/// Sharded strike counters.
#[derive(Debug)]
pub struct StrikeTracker {
    window: Duration,
    counts: DashMap<(Uuid, Subject), Strike>,
}

impl StrikeTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            counts: DashMap::new(),
        }
    }

    fn bump(&self, key: (Uuid, Subject), now: Instant) -> u32 {
        let mut entry = self.counts.entry(key).or_insert(Strike {
            count: 0,
            last: now,
        });
        if now.duration_since(entry.last) > self.window {
            entry.count = 0;
        }
        entry.count += 1;
        entry.last = now;
        entry.count
    }

    /// Record a refusal for the IP and, when known, the session.
    pub fn strike(&self, workspace_id: Uuid, ip: &str, session_id: Option<Uuid>) -> StrikeCount {
        let now = Instant::now();
        StrikeCount {
            session: session_id
                .map(|id| self.bump((workspace_id, Subject::Session(id)), now))
                .unwrap_or(0),
            ip: self.bump((workspace_id, Subject::Ip(ip.to_string())), now),
        }
    }

    /// An allowed hit ends the run of consecutive refusals.
    pub fn reset(&self, workspace_id: Uuid, ip: &str, session_id: Option<Uuid>) {
        self.counts.remove(&(workspace_id, Subject::Ip(ip.to_string())));
        if let Some(id) = session_id {
            self.counts.remove(&(workspace_id, Subject::Session(id)));
        }
    }

    pub fn clear_session(&self, workspace_id: Uuid, session_id: Uuid) {
        self.counts.remove(&(workspace_id, Subject::Session(session_id)));
    }

    pub fn clear_ip(&self, workspace_id: Uuid, ip: &str) {
        self.counts.remove(&(workspace_id, Subject::Ip(ip.to_string())));
    }

    /// Drop counters idle for longer than the window.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.counts
            .retain(|_, strike| now.duration_since(strike.last) <= self.window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strikes_accumulate_and_reset() {
        let tracker = StrikeTracker::new(Duration::from_secs(60));
        let ws = Uuid::new_v4();
        let session = Uuid::new_v4();

        assert_eq!(tracker.strike(ws, "10.0.0.1", Some(session)), StrikeCount { session: 1, ip: 1 });
        assert_eq!(tracker.strike(ws, "10.0.0.1", None), StrikeCount { session: 0, ip: 2 });
        assert_eq!(tracker.strike(ws, "10.0.0.1", Some(session)).session, 2);

        tracker.reset(ws, "10.0.0.1", Some(session));
        assert_eq!(tracker.strike(ws, "10.0.0.1", Some(session)), StrikeCount { session: 1, ip: 1 });
    }

    #[test]
    fn test_workspaces_are_independent() {
        let tracker = StrikeTracker::new(Duration::from_secs(60));
        tracker.strike(Uuid::new_v4(), "10.0.0.1", None);
        assert_eq!(tracker.strike(Uuid::new_v4(), "10.0.0.1", None).ip, 1);
    }

    #[test]
    fn test_window_expiry_restarts_count() {
        let tracker = StrikeTracker::new(Duration::ZERO);
        let ws = Uuid::new_v4();
        tracker.strike(ws, "10.0.0.1", None);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracker.strike(ws, "10.0.0.1", None).ip, 1);
        tracker.sweep();
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Three-threshold rate decision.

use std::time::Duration;

use serde::Serialize;

use crate::config::AccessSettings;
use crate::store::RateLimitConfig;

/// Outcome of the rate window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateDecision {
    Allow,
    RequireCaptcha,
    RateLimited,
}

/// Effective thresholds for one workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub window: Duration,
    pub soft: u32,
    pub hard: u32,
}

impl Thresholds {
    /// Merge a workspace's rate-limit document over the deployment defaults.
    ///
    /// `hard_limit` falls back to `soft_limit + burst`, then `2 * soft_limit`.
    pub fn resolve(config: &RateLimitConfig, defaults: &AccessSettings) -> Self {
        let window = config
            .window_seconds
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.default_window);
        let soft = config.soft_limit.unwrap_or(defaults.default_soft_limit).max(1);
        let hard = match (config.hard_limit, config.soft_limit, config.burst) {
            (Some(hard), _, _) => hard,
            (None, Some(soft), Some(burst)) => soft.saturating_add(burst),
            (None, Some(soft), None) => soft.saturating_mul(2),
            (None, None, _) => defaults.default_hard_limit,
        };
        Self {
            window,
            soft,
            hard: hard.max(soft),
        }
    }

    /// Halved thresholds applied to graylisted callers.
    pub fn graylisted(self) -> Self {
        Self {
            window: self.window,
            soft: (self.soft / 2).max(1),
            hard: (self.hard / 2).max(1),
        }
    }
}

/// Decide from the number of hits already recorded inside the window.
pub fn decide(prior_hits: i64, thresholds: &Thresholds) -> RateDecision {
    if prior_hits >= i64::from(thresholds.hard) {
        RateDecision::RateLimited
    } else if prior_hits >= i64::from(thresholds.soft) {
        RateDecision::RequireCaptcha
    } else {
        RateDecision::Allow
    }
}

/// Whether `ip` matches an IP list entry. Entries ending in `*` match by prefix.
pub fn ip_listed(list: &[String], ip: &str) -> bool {
    list.iter().map(|e| e.trim()).any(|entry| match entry.strip_suffix('*') {
        Some(prefix) => ip.starts_with(prefix),
        None => entry == ip,
    })
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry delay: exponential in the attempt number, capped, with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffSettings;

/// Delay before the next claim after `attempts` failed runs (1-based).
pub fn delay(settings: &BackoffSettings, attempts: u32) -> Duration {
    let base = settings.base.as_millis() as f64;
    let cap = settings.max.as_millis() as f64;
    let exp = attempts.saturating_sub(1).min(30) as i32;
    let raw = (base * 2f64.powi(exp)).min(cap);

    let jitter = settings.jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
    } else {
        1.0
    };
    Duration::from_millis((raw * factor).min(cap).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(jitter: f64) -> BackoffSettings {
        BackoffSettings {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter,
        }
    }

    #[test]
    fn test_exponential_without_jitter() {
        let s = settings(0.0);
        assert_eq!(delay(&s, 1), Duration::from_secs(1));
        assert_eq!(delay(&s, 2), Duration::from_secs(2));
        assert_eq!(delay(&s, 4), Duration::from_secs(8));
        assert_eq!(delay(&s, 10), Duration::from_secs(30));
        assert_eq!(delay(&s, u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let s = settings(0.2);
        for _ in 0..100 {
            let d = delay(&s, 3);
            assert!(d >= Duration::from_millis(3200) && d <= Duration::from_millis(4800));
        }
        assert!(delay(&s, 20) <= Duration::from_secs(30));
    }
}

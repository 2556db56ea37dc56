// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dimension and plan catalog.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::Plan;

pub const REQUESTS: &str = "requests";
pub const TOKENS: &str = "tokens";
pub const STORAGE: &str = "storage";
pub const BANDWIDTH: &str = "bandwidth";

/// What happens when usage passes a dimension's limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OveragePolicy {
    /// Refuse the consume.
    Block,
    /// Record only.
    Allow,
    /// Accept and charge the overage.
    Prorate,
}

/// A billable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub unit: String,
    pub unit_price: f64,
    pub included_amount: f64,
}

/// Limits and overage policy of a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanTerms {
    pub plan: Plan,
    pub policy: OveragePolicy,
    /// Per-dimension caps. A missing or negative entry is unlimited.
    pub limits: BTreeMap<String, f64>,
}

/// Closed set of dimensions with their prices.
#[derive(Debug, Clone)]
pub struct Catalog {
    currency: String,
    dimensions: BTreeMap<String, Dimension>,
}

impl Catalog {
    /// The standard catalog: requests, tokens, storage and bandwidth.
    pub fn standard(currency: impl Into<String>) -> Self {
        let mut catalog = Self {
            currency: currency.into(),
            dimensions: BTreeMap::new(),
        };
        catalog
            .insert(REQUESTS, "request", 0.0002, 10_000.0)
            .insert(TOKENS, "token", 0.00002, 200_000.0)
            .insert(STORAGE, "GB", 0.10, 5.0)
            .insert(BANDWIDTH, "GB", 0.05, 10.0);
        catalog
    }

    /// Add or replace a dimension.
    pub fn insert(&mut self, name: &str, unit: &str, unit_price: f64, included_amount: f64) -> &mut Self {
        self.dimensions.insert(
            name.to_string(),
            Dimension {
                name: name.to_string(),
                unit: unit.to_string(),
                unit_price,
                included_amount,
            },
        );
        self
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.get(name)
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions.values()
    }

    /// Terms of a plan over this catalog's dimensions.
    pub fn plan_terms(&self, plan: Plan) -> PlanTerms {
        let (policy, caps): (OveragePolicy, &[(&str, f64)]) = match plan {
            Plan::Free => (
                OveragePolicy::Block,
                &[
                    (REQUESTS, 10_000.0),
                    (TOKENS, 200_000.0),
                    (STORAGE, 5.0),
                    (BANDWIDTH, 10.0),
                ],
            ),
            Plan::Pro => (
                OveragePolicy::Prorate,
                &[
                    (REQUESTS, 100_000.0),
                    (TOKENS, 2_000_000.0),
                    (STORAGE, 50.0),
                    (BANDWIDTH, 100.0),
                ],
            ),
            Plan::Enterprise => (OveragePolicy::Allow, &[]),
        };
        PlanTerms {
            plan,
            policy,
            limits: caps
                .iter()
                .filter(|(name, _)| self.dimensions.contains_key(*name))
                .map(|(name, cap)| (name.to_string(), *cap))
                .collect(),
        }
    }

    /// Reject empty maps, unknown dimensions and negative or non-finite amounts.
    pub fn validate(&self, usage: &BTreeMap<String, f64>) -> Result<()> {
        if usage.is_empty() {
            return Err(Error::InvalidUsage("usage map is empty".to_string()));
        }
        for (name, amount) in usage {
            if !self.dimensions.contains_key(name) {
                return Err(Error::InvalidUsage(format!("unknown dimension '{name}'")));
            }
            if !amount.is_finite() || *amount < 0.0 {
                return Err(Error::InvalidUsage(format!(
                    "amount for '{name}' must be a non-negative number"
                )));
            }
        }
        Ok(())
    }

    /// Cost of adding `amount` on top of `prior` usage of `name`.
    ///
    /// `block` and `allow` charge the part above the included amount;
    /// `prorate` charges the part above `max(included, limit)`.
    pub fn price(
        &self,
        name: &str,
        policy: OveragePolicy,
        limit: Option<f64>,
        prior: f64,
        amount: f64,
    ) -> f64 {
        let Some(dim) = self.dimensions.get(name) else {
            return 0.0;
        };
        let free_up_to = match (policy, limit) {
            (OveragePolicy::Prorate, Some(limit)) => dim.included_amount.max(limit),
            _ => dim.included_amount,
        };
        let priced = (prior + amount - free_up_to.max(prior)).max(0.0);
        priced * dim.unit_price
    }
}

/// Effective limit of a dimension: `None` when unlimited.
pub fn limit_of(limits: &BTreeMap<String, f64>, name: &str) -> Option<f64> {
    limits.get(name).copied().filter(|l| *l >= 0.0)
}

/// Round a monetary amount to `places` decimals.
pub fn round_to(amount: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (amount * factor).round() / factor
}

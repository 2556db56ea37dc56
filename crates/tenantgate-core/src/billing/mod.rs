// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Billing engine: metered usage against per-period quotas and budgets.
//!
//! [`BillingEngine::consume`] is linearizable per workspace. An in-process
//! mutex serializes consumes of one workspace and the store runs the
//! read-modify-write in a single write transaction, so concurrent consumes
//! combine additively and a cancelled consume leaves no partial usage.

pub mod catalog;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub use self::catalog::{Catalog, Dimension, OveragePolicy, PlanTerms, limit_of, round_to};

use crate::audit::{AuditRecord, AuditSink};
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::store::{BudgetSettings, Plan, Quota, QuotaWrite, Store, UsageEvent, Workspace};

/// Why a consume was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    QuotaExceeded,
    SpendLimit,
}

/// Current-period quota as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaSnapshot {
    pub plan: Plan,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub limits: BTreeMap<String, f64>,
    pub usage: BTreeMap<String, f64>,
    pub remaining: BTreeMap<String, f64>,
    pub cost_to_date: f64,
    pub spend_blocked: bool,
}

impl QuotaSnapshot {
    fn from_quota(quota: &Quota) -> Self {
        Self {
            plan: quota.plan,
            period_start: quota.period_start,
            period_end: quota.period_end,
            limits: quota.limits.clone(),
            usage: quota.usage.clone(),
            remaining: remaining(quota),
            cost_to_date: round_to(quota.cost_to_date, 2),
            spend_blocked: quota.spend_blocked,
        }
    }
}

/// Period-to-date spend against the budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSummary {
    pub currency: String,
    pub monthly_budget: f64,
    pub spent: f64,
    pub remaining: f64,
    pub percent_used: f64,
    pub thresholds: Vec<f64>,
    pub crossed_thresholds: Vec<f64>,
    pub spend_limit: Option<f64>,
    pub spend_limit_enabled: bool,
    pub spend_blocked: bool,
}

impl BudgetSummary {
    fn new(quota: &Quota, budget: Option<&BudgetSettings>, currency: &str) -> Self {
        let spent = round_to(quota.cost_to_date, 2);
        let (monthly_budget, thresholds, spend_limit, spend_limit_enabled, currency) = match budget {
            Some(b) => (
                b.monthly_budget,
                b.thresholds.clone(),
                b.spend_limit,
                b.spend_limit_enabled,
                b.currency.clone(),
            ),
            None => (0.0, Vec::new(), None, false, currency.to_string()),
        };
        let percent_used = if monthly_budget > 0.0 {
            round_to(quota.cost_to_date / monthly_budget * 100.0, 2)
        } else {
            0.0
        };
        Self {
            currency,
            monthly_budget,
            spent,
            remaining: round_to((monthly_budget - quota.cost_to_date).max(0.0), 2),
            percent_used,
            thresholds,
            crossed_thresholds: quota.alerted_thresholds.clone(),
            spend_limit,
            spend_limit_enabled,
            spend_blocked: quota.spend_blocked,
        }
    }
}

/// Outcome of [`BillingEngine::consume`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumeResult {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RefusalReason>,
    pub plan: Plan,
    pub quota: QuotaSnapshot,
    pub exceeded: Vec<String>,
    pub cost_delta: f64,
    pub currency: String,
    pub budget: BudgetSummary,
}

impl ConsumeResult {
    /// The result when allowed, otherwise the matching policy error.
    pub fn into_allowed(self) -> Result<Self> {
        match self.reason {
            None if self.allowed => Ok(self),
            Some(RefusalReason::SpendLimit) => Err(Error::SpendLimit {
                spent: self.budget.spent,
                limit: self.budget.spend_limit.unwrap_or_default(),
                currency: self.currency,
            }),
            _ => Err(Error::QuotaExceeded {
                exceeded: self.exceeded,
                remaining: self.quota.remaining,
            }),
        }
    }
}

/// Cost estimate for a usage map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
    pub plan: Plan,
    pub currency: String,
    pub total: f64,
    pub breakdown: BTreeMap<String, f64>,
    /// Dimensions a consume of this usage would currently exceed.
    pub would_exceed: Vec<String>,
}

/// Budget settings as submitted by a workspace admin.
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetInput {
    pub monthly_budget: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<f64>,
    #[serde(default)]
    pub spend_limit: Option<f64>,
    #[serde(default)]
    pub spend_limit_enabled: bool,
}

fn default_thresholds() -> Vec<f64> {
    vec![0.5, 0.8, 1.0]
}

#[derive(Debug, Default)]
struct Evaluation {
    reason: Option<RefusalReason>,
    exceeded: Vec<String>,
    cost_delta: f64,
    crossed: Vec<f64>,
    budget: Option<BudgetSettings>,
}

/// Quota and budget enforcement.
pub struct BillingEngine {
    store: Arc<dyn Store>,
    catalog: Catalog,
    audit: AuditSink,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl BillingEngine {
    pub fn new(store: Arc<dyn Store>, catalog: Catalog, audit: AuditSink) -> Self {
        Self {
            store,
            catalog,
            audit,
            locks: DashMap::new(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn initial_quota(&self, workspace: &Workspace, now: DateTime<Utc>) -> Quota {
        let (period_start, period_end) = crate::time::month_period(now);
        Quota {
            workspace_id: workspace.id,
            period_start,
            period_end,
            plan: workspace.plan,
            limits: self.catalog.plan_terms(workspace.plan).limits,
            usage: BTreeMap::new(),
            cost_to_date: 0.0,
            alerted_thresholds: Vec::new(),
            spend_blocked: false,
            updated_at: now,
        }
    }

    /// Add `usage` to the workspace's current-period quota.
    ///
    /// A refusal is a successful call with `allowed == false`; usage is
    /// unchanged. See [`ConsumeResult::into_allowed`].
    pub async fn consume(
        &self,
        ctx: &RequestContext,
        workspace: &Workspace,
        usage: &BTreeMap<String, f64>,
    ) -> Result<ConsumeResult> {
        self.catalog.validate(usage)?;
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let lock = self.locks.entry(workspace.id).or_default().clone();
        let _guard = lock.lock().await;

        let now = crate::time::now();
        let initial = self.initial_quota(workspace, now);
        let policy = self.catalog.plan_terms(workspace.plan).policy;
        let currency = self.catalog.currency().to_string();

        let mut eval = Evaluation::default();
        let catalog = &self.catalog;
        let eval_ref = &mut eval;
        let workspace_id = workspace.id;
        let ledger_currency = currency.clone();

        let quota = self
            .store
            .update_quota(
                &initial,
                Box::new(move |quota: &Quota, budget: Option<&BudgetSettings>| {
                    eval_ref.budget = budget.cloned();

                    let mut exceeded = Vec::new();
                    let mut cost_delta = 0.0;
                    for (name, amount) in usage {
                        let prior = quota.usage.get(name).copied().unwrap_or(0.0);
                        let limit = limit_of(&quota.limits, name);
                        if policy == OveragePolicy::Block
                            && let Some(limit) = limit
                            && prior + amount > limit
                        {
                            exceeded.push(name.clone());
                        }
                        cost_delta += catalog.price(name, policy, limit, prior, *amount);
                    }

                    if !exceeded.is_empty() {
                        eval_ref.reason = Some(RefusalReason::QuotaExceeded);
                        eval_ref.exceeded = exceeded;
                        return Ok(None);
                    }
                    if quota.spend_blocked && (policy == OveragePolicy::Block || cost_delta > 0.0) {
                        eval_ref.reason = Some(RefusalReason::SpendLimit);
                        return Ok(None);
                    }

                    let mut next = quota.clone();
                    for (name, amount) in usage {
                        *next.usage.entry(name.clone()).or_insert(0.0) += amount;
                    }
                    next.cost_to_date += cost_delta;
                    next.updated_at = now;

                    if let Some(budget) = budget {
                        if budget.monthly_budget > 0.0 {
                            let mut thresholds = budget.thresholds.clone();
                            thresholds.sort_by(f64::total_cmp);
                            for t in thresholds {
                                if t > 0.0
                                    && t <= 1.0
                                    && !next.alerted_thresholds.contains(&t)
                                    && next.cost_to_date >= t * budget.monthly_budget
                                {
                                    next.alerted_thresholds.push(t);
                                    eval_ref.crossed.push(t);
                                }
                            }
                        }
                        if budget.spend_limit_enabled
                            && let Some(limit) = budget.spend_limit
                            && next.cost_to_date >= limit
                        {
                            next.spend_blocked = true;
                        }
                    }

                    eval_ref.cost_delta = cost_delta;
                    Ok(Some(QuotaWrite {
                        event: Some(UsageEvent {
                            id: Uuid::new_v4(),
                            workspace_id,
                            usage: usage.clone(),
                            cost: cost_delta,
                            currency: ledger_currency,
                            recorded_at: now,
                        }),
                        quota: next,
                    }))
                }),
            )
            .await?;

        let budget = BudgetSummary::new(&quota, eval.budget.as_ref(), &currency);
        for threshold in &eval.crossed {
            warn!(
                workspace_id = %workspace.id,
                threshold = threshold,
                spent = budget.spent,
                monthly_budget = budget.monthly_budget,
                "Budget threshold crossed"
            );
            self.audit
                .record(
                    ctx,
                    AuditRecord::new(workspace.id, "budget_threshold_crossed", "budget").metadata(
                        json!({
                            "threshold": threshold,
                            "spent": budget.spent,
                            "monthly_budget": budget.monthly_budget,
                            "currency": budget.currency,
                            "period_start": quota.period_start,
                        }),
                    ),
                )
                .await;
        }
        if let Some(reason) = eval.reason {
            info!(
                workspace_id = %workspace.id,
                reason = ?reason,
                exceeded = ?eval.exceeded,
                "Usage consume refused"
            );
        }

        Ok(ConsumeResult {
            allowed: eval.reason.is_none(),
            reason: eval.reason,
            plan: quota.plan,
            quota: QuotaSnapshot::from_quota(&quota),
            exceeded: eval.exceeded,
            cost_delta: round_to(eval.cost_delta, 6),
            currency,
            budget,
        })
    }

    /// Price `usage` against the current quota without recording it.
    pub async fn estimate(
        &self,
        workspace: &Workspace,
        usage: &BTreeMap<String, f64>,
    ) -> Result<CostEstimate> {
        self.catalog.validate(usage)?;
        let quota = self.current_quota(workspace).await?;
        let policy = self.catalog.plan_terms(workspace.plan).policy;

        let mut breakdown = BTreeMap::new();
        let mut would_exceed = Vec::new();
        let mut total = 0.0;
        for (name, amount) in usage {
            let prior = quota.usage.get(name).copied().unwrap_or(0.0);
            let limit = limit_of(&quota.limits, name);
            let cost = self.catalog.price(name, policy, limit, prior, *amount);
            if policy == OveragePolicy::Block && limit.is_some_and(|l| prior + amount > l) {
                would_exceed.push(name.clone());
            }
            total += cost;
            breakdown.insert(name.clone(), round_to(cost, 6));
        }

        Ok(CostEstimate {
            plan: workspace.plan,
            currency: self.catalog.currency().to_string(),
            total: round_to(total, 2),
            breakdown,
            would_exceed,
        })
    }

    async fn current_quota(&self, workspace: &Workspace) -> Result<Quota> {
        let now = crate::time::now();
        let initial = self.initial_quota(workspace, now);
        Ok(self
            .store
            .get_quota(workspace.id, initial.period_start)
            .await?
            .unwrap_or(initial))
    }

    /// Current-period quota.
    pub async fn quota_snapshot(&self, workspace: &Workspace) -> Result<QuotaSnapshot> {
        Ok(QuotaSnapshot::from_quota(&self.current_quota(workspace).await?))
    }

    /// Current-period spend against the budget.
    pub async fn budget_summary(&self, workspace: &Workspace) -> Result<BudgetSummary> {
        let quota = self.current_quota(workspace).await?;
        let budget = self.store.get_budget(workspace.id).await?;
        Ok(BudgetSummary::new(
            &quota,
            budget.as_ref(),
            self.catalog.currency(),
        ))
    }

    /// Replace the workspace's budget settings.
    pub async fn put_budget(
        &self,
        ctx: &RequestContext,
        workspace: &Workspace,
        input: BudgetInput,
    ) -> Result<BudgetSettings> {
        if !input.monthly_budget.is_finite() || input.monthly_budget < 0.0 {
            return Err(Error::InvalidRequest(
                "monthly_budget must be a non-negative number".to_string(),
            ));
        }
        if input.spend_limit.is_some_and(|l| !l.is_finite() || l < 0.0) {
            return Err(Error::InvalidRequest(
                "spend_limit must be a non-negative number".to_string(),
            ));
        }
        if input.spend_limit_enabled && input.spend_limit.is_none() {
            return Err(Error::InvalidRequest(
                "spend_limit is required when spend_limit_enabled is set".to_string(),
            ));
        }
        let mut thresholds = input.thresholds;
        if thresholds.iter().any(|t| !(*t > 0.0 && *t <= 1.0)) {
            return Err(Error::InvalidRequest(
                "thresholds must be fractions in (0, 1]".to_string(),
            ));
        }
        thresholds.sort_by(f64::total_cmp);
        thresholds.dedup();

        let settings = BudgetSettings {
            workspace_id: workspace.id,
            monthly_budget: input.monthly_budget,
            currency: input
                .currency
                .filter(|c| !c.trim().is_empty())
                .map(|c| c.trim().to_ascii_uppercase())
                .unwrap_or_else(|| self.catalog.currency().to_string()),
            thresholds,
            spend_limit: input.spend_limit,
            spend_limit_enabled: input.spend_limit_enabled,
            updated_at: crate::time::now(),
        };
        self.store.put_budget(&settings).await?;
        self.audit
            .record(
                ctx,
                AuditRecord::new(workspace.id, "budget_updated", "budget").metadata(json!({
                    "monthly_budget": settings.monthly_budget,
                    "spend_limit": settings.spend_limit,
                    "spend_limit_enabled": settings.spend_limit_enabled,
                })),
            )
            .await;
        Ok(settings)
    }
}

fn remaining(quota: &Quota) -> BTreeMap<String, f64> {
    quota
        .limits
        .iter()
        .filter(|(_, limit)| **limit >= 0.0)
        .map(|(name, limit)| {
            let used = quota.usage.get(name).copied().unwrap_or(0.0);
            (name.clone(), (limit - used).max(0.0))
        })
        .collect()
}

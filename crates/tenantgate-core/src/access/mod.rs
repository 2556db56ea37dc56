// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Access controller for runtime requests.
//!
//! Decides, per request, whether a caller may use a workspace's runtime and
//! under which conditions. The gates run in order:
//!
//! 1. access mode and data classification against the principal
//! 2. `Origin` against the workspace's allow list
//! 3. session resolution (reuse, lift an expired block, or issue)
//! 4. IP and session bans
//! 5. the rate window (allow / require CAPTCHA / refuse with a strike)
//! 6. access event and session refresh
//!
//! A refused request writes no access event, so the window count only
//! grows with accepted hits and the refusal decision stays monotonic.

pub mod origin;
pub mod rate;
pub mod strikes;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use self::origin::origin_allowed;
pub use self::rate::{RateDecision, Thresholds, decide, ip_listed};
pub use self::strikes::{StrikeCount, StrikeTracker};

use crate::config::{AccessSettings, OriginCheck};
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::store::{
    AccessEventType, AccessMode, Ban, BanKind, DataClassification, MemberRole, NewAccessEvent,
    Session, SessionState, Store, Workspace, WorkspaceMember, permissions,
};
use crate::time::chrono_duration;

/// Per-request input to [`AccessController::authorize`].
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub event_type: AccessEventType,
    pub path: String,
    pub session_id: Option<Uuid>,
    pub origin: Option<String>,
    pub captcha_provided: bool,
    /// Cacheable reads run without a session and record no event.
    pub skip_session: bool,
}

/// Conditions attached to an allowed request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub require_captcha: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub risk_signals: Vec<String>,
}

/// Outcome of an allowed request.
#[derive(Debug, Clone)]
pub struct AccessResult {
    pub session: Option<Session>,
    pub decision: AccessDecision,
    /// Caller's role in the workspace, when a member.
    pub role: Option<MemberRole>,
}

/// How the caller relates to the workspace.
#[derive(Debug, Clone)]
pub enum Standing {
    Anonymous,
    Authenticated,
    Member(WorkspaceMember),
    Owner,
}

impl Standing {
    fn role(&self) -> Option<MemberRole> {
        match self {
            Self::Owner => Some(MemberRole::Owner),
            Self::Member(m) => Some(m.role),
            _ => None,
        }
    }

    fn is_member(&self) -> bool {
        matches!(self, Self::Owner | Self::Member(_))
    }

    fn is_admin_member(&self) -> bool {
        match self {
            Self::Owner => true,
            Self::Member(m) => m.has(permissions::ADMIN),
            _ => false,
        }
    }
}

/// Resolve how the request's principal relates to `workspace`.
pub async fn standing(
    store: &dyn Store,
    ctx: &RequestContext,
    workspace: &Workspace,
) -> Result<Standing> {
    let Some(user_id) = ctx.user_id() else {
        return Ok(Standing::Anonymous);
    };
    if user_id == workspace.owner_user_id {
        return Ok(Standing::Owner);
    }
    Ok(match store.get_member(workspace.id, user_id).await? {
        Some(member) => Standing::Member(member),
        None => Standing::Authenticated,
    })
}

/// Apply the access-mode and classification gates.
pub fn check_standing(ctx: &RequestContext, workspace: &Workspace, standing: &Standing) -> Result<()> {
    let anonymous = matches!(standing, Standing::Anonymous);
    let denied = || {
        if anonymous {
            Error::AuthRequired
        } else {
            Error::Unauthorized
        }
    };
    // Platform admins pass the mode gate but not the classification gate.
    let admin = ctx.is_admin();

    let mode_ok = match workspace.access_mode {
        AccessMode::PublicAnonymous => true,
        AccessMode::Authenticated => !anonymous,
        AccessMode::WorkspaceMembers => standing.is_member() || admin,
        AccessMode::Private => matches!(standing, Standing::Owner) || admin,
    };
    if !mode_ok {
        return Err(denied());
    }

    let class_ok = match workspace.data_classification {
        DataClassification::Public => true,
        DataClassification::Internal => !anonymous,
        DataClassification::Confidential => standing.is_member(),
        DataClassification::Restricted => standing.is_admin_member(),
    };
    if !class_ok {
        return Err(denied());
    }
    Ok(())
}

/// Runtime access controller.
pub struct AccessController {
    store: Arc<dyn Store>,
    settings: AccessSettings,
    origin_check: OriginCheck,
    strikes: StrikeTracker,
}

impl AccessController {
    pub fn new(store: Arc<dyn Store>, settings: AccessSettings, origin_check: OriginCheck) -> Self {
        let strikes = StrikeTracker::new(settings.strike_window);
        Self {
            store,
            settings,
            origin_check,
            strikes,
        }
    }

    pub fn strikes(&self) -> &StrikeTracker {
        &self.strikes
    }

    pub fn settings(&self) -> &AccessSettings {
        &self.settings
    }

    fn session_ttl(&self, user_id: Option<Uuid>) -> chrono::Duration {
        chrono_duration(if user_id.is_some() {
            self.settings.authenticated_session_ttl
        } else {
            self.settings.anonymous_session_ttl
        })
    }

    /// Run every gate for one runtime request.
    pub async fn authorize(
        &self,
        ctx: &RequestContext,
        workspace: &Workspace,
        request: &AccessRequest,
    ) -> Result<AccessResult> {
        let now = ctx.received_at;

        let standing = standing(self.store.as_ref(), ctx, workspace).await?;
        check_standing(ctx, workspace, &standing)?;

        let origin_applies = match self.origin_check {
            OriginCheck::All => true,
            OriginCheck::ExecuteOnly => request.event_type == AccessEventType::Execute,
        };
        if origin_applies
            && let Some(origin) = request.origin.as_deref()
            && !origin_allowed(&workspace.allowed_origins, origin)
        {
            debug!(workspace_id = %workspace.id, origin = %origin, "Origin rejected");
            return Err(Error::OriginMismatch {
                origin: origin.to_string(),
            });
        }

        let existing = match request.session_id {
            Some(id) => self.resolve_session(ctx, workspace, id, now).await?,
            None => None,
        };

        if ip_listed(&workspace.rate_limit.blocked_ips, &ctx.ip) {
            return Err(Error::IpBlocked);
        }
        if !ctx.ip.is_empty()
            && self
                .store
                .active_ban(workspace.id, BanKind::Ip, &ctx.ip, now)
                .await?
                .is_some()
        {
            return Err(Error::IpBlocked);
        }
        if let Some(session) = &existing
            && let Some(ban) = self
                .store
                .active_ban(workspace.id, BanKind::Session, &session.id.to_string(), now)
                .await?
        {
            return Err(Error::SessionBlocked {
                until: ban.expires_at,
            });
        }

        let mut decision = AccessDecision::default();
        let mut thresholds = Thresholds::resolve(&workspace.rate_limit, &self.settings);
        if ip_listed(&workspace.rate_limit.graylist, &ctx.ip) {
            thresholds = thresholds.graylisted();
            decision.require_captcha = true;
            decision.risk_signals.push("graylist".to_string());
        }

        let since = now - chrono_duration(thresholds.window);
        let existing_id = existing.as_ref().map(|s| s.id);
        let counts = self
            .store
            .count_access_events(workspace.id, &ctx.ip, existing_id, since)
            .await?;
        let prior = counts.by_ip.max(counts.by_session);

        match decide(prior, &thresholds) {
            RateDecision::Allow => {
                self.strikes.reset(workspace.id, &ctx.ip, existing_id);
            }
            RateDecision::RequireCaptcha => {
                self.strikes.reset(workspace.id, &ctx.ip, existing_id);
                decision.require_captcha = true;
                if !decision.risk_signals.iter().any(|s| s == "rate_soft_limit") {
                    decision.risk_signals.push("rate_soft_limit".to_string());
                }
            }
            RateDecision::RateLimited => {
                let count = self.strikes.strike(workspace.id, &ctx.ip, existing_id);
                self.apply_strikes(workspace, &ctx.ip, existing.as_ref(), count, now)
                    .await?;
                return Err(Error::RateLimited {
                    retry_after_secs: thresholds.window.as_secs().max(1),
                });
            }
        }

        let session = match existing {
            Some(session) => {
                let expires_at = now + self.session_ttl(session.user_id);
                self.store
                    .touch_session(session.id, &ctx.ip, now, expires_at)
                    .await?;
                Some(Session {
                    last_seen_ip: ctx.ip.clone(),
                    last_active_at: now,
                    expires_at,
                    ..session
                })
            }
            None if request.skip_session => None,
            None => Some(self.issue_session(ctx, workspace, now).await?),
        };

        if !(request.skip_session && request.event_type != AccessEventType::Execute) {
            self.store
                .insert_access_event(&NewAccessEvent {
                    workspace_id: workspace.id,
                    session_id: session.as_ref().map(|s| s.id),
                    ip: ctx.ip.clone(),
                    event_type: request.event_type,
                    path: request.path.clone(),
                    captcha_provided: request.captcha_provided,
                    occurred_at: now,
                })
                .await?;
        }

        Ok(AccessResult {
            session,
            decision,
            role: standing.role(),
        })
    }

    /// Load a presented session. Returns `None` when it cannot be reused.
    async fn resolve_session(
        &self,
        ctx: &RequestContext,
        workspace: &Workspace,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let Some(session) = self.store.get_session(id).await? else {
            return Ok(None);
        };
        if session.workspace_id != workspace.id || session.user_id != ctx.user_id() {
            return Ok(None);
        }
        if session.state == SessionState::Blocked {
            match session.blocked_until {
                Some(until) if until <= now => {
                    self.store.unblock_session(session.id).await?;
                    info!(workspace_id = %workspace.id, session_id = %session.id, "Session block lifted");
                    return Ok(Some(Session {
                        state: SessionState::Active,
                        blocked_reason: None,
                        blocked_until: None,
                        ..session
                    }));
                }
                until => return Err(Error::SessionBlocked { until }),
            }
        }
        if session.expires_at <= now {
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn issue_session(
        &self,
        ctx: &RequestContext,
        workspace: &Workspace,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        let user_id = ctx.user_id();
        let session = Session {
            id: Uuid::new_v4(),
            workspace_id: workspace.id,
            user_id,
            first_seen_ip: ctx.ip.clone(),
            last_seen_ip: ctx.ip.clone(),
            user_agent_hash: hex::encode(Sha256::digest(ctx.user_agent.as_bytes())),
            state: SessionState::Active,
            blocked_reason: None,
            blocked_until: None,
            created_at: now,
            last_active_at: now,
            expires_at: now + self.session_ttl(user_id),
        };
        self.store.insert_session(&session).await?;
        debug!(workspace_id = %workspace.id, session_id = %session.id, "Session issued");
        Ok(session)
    }

    async fn apply_strikes(
        &self,
        workspace: &Workspace,
        ip: &str,
        session: Option<&Session>,
        count: StrikeCount,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let until = now + chrono_duration(self.settings.ban_cooldown);

        if let Some(session) = session
            && count.session >= self.settings.session_ban_strikes
        {
            self.store
                .block_session(session.id, "rate_limit", Some(until))
                .await?;
            self.store
                .upsert_ban(&Ban {
                    workspace_id: workspace.id,
                    kind: BanKind::Session,
                    value: session.id.to_string(),
                    reason: "rate_limit".to_string(),
                    created_at: now,
                    expires_at: Some(until),
                })
                .await?;
            self.strikes.clear_session(workspace.id, session.id);
            warn!(
                workspace_id = %workspace.id,
                session_id = %session.id,
                strikes = count.session,
                until = %until,
                "Session blocked after repeated rate-limit strikes"
            );
        }

        if !ip.is_empty() && count.ip >= self.settings.ip_ban_strikes {
            self.store
                .upsert_ban(&Ban {
                    workspace_id: workspace.id,
                    kind: BanKind::Ip,
                    value: ip.to_string(),
                    reason: "rate_limit".to_string(),
                    created_at: now,
                    expires_at: Some(until),
                })
                .await?;
            self.strikes.clear_ip(workspace.id, ip);
            warn!(
                workspace_id = %workspace.id,
                ip = %ip,
                strikes = count.ip,
                until = %until,
                "IP banned after repeated rate-limit strikes"
            );
        }
        Ok(())
    }
}

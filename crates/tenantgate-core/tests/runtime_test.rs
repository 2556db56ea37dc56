// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end runtime flows through the dispatcher.

mod common;

use std::collections::BTreeMap;

use serde_json::json;

use common::*;
use tenantgate_core::Error;
use tenantgate_core::billing::catalog::REQUESTS;
use tenantgate_core::dispatcher::ExecuteBody;
use tenantgate_core::store::{
    AccessEventType, EventQuery, Plan, Quota, QuotaWrite, RateLimitConfig, Store, Workspace,
};

async fn seed_requests(gw: &TestGateway, ws: &Workspace, limit: f64, used: f64) {
    let now = tenantgate_core::time::now();
    let (period_start, period_end) = tenantgate_core::time::month_period(now);
    let initial = Quota {
        workspace_id: ws.id,
        period_start,
        period_end,
        plan: ws.plan,
        limits: gw.billing.catalog().plan_terms(ws.plan).limits,
        usage: BTreeMap::new(),
        cost_to_date: 0.0,
        alerted_thresholds: Vec::new(),
        spend_blocked: false,
        updated_at: now,
    };
    gw.store
        .update_quota(
            &initial,
            Box::new(move |q, _| {
                let mut next = q.clone();
                next.limits.insert(REQUESTS.into(), limit);
                next.usage.insert(REQUESTS.into(), used);
                Ok(Some(QuotaWrite {
                    quota: next,
                    event: None,
                }))
            }),
        )
        .await
        .unwrap();
}

async fn requests_used(gw: &TestGateway, ws: &Workspace) -> f64 {
    let (period_start, _) = tenantgate_core::time::month_period(tenantgate_core::time::now());
    gw.store
        .get_quota(ws.id, period_start)
        .await
        .unwrap()
        .and_then(|q| q.usage.get(REQUESTS).copied())
        .unwrap_or(0.0)
}

fn execute_body() -> ExecuteBody {
    ExecuteBody {
        inputs: inputs(),
        ..ExecuteBody::default()
    }
}

#[tokio::test]
async fn test_execute_consumes_one_request_then_quota_exceeded() {
    let gw = TestGateway::new().await;
    let ws = gw.published("demo", |ws| ws.plan = Plan::Free).await;
    seed_requests(&gw, &ws, 10.0, 9.0).await;

    let ok = gw
        .dispatcher
        .execute(&anonymous("10.0.0.1"), &call("demo"), execute_body())
        .await
        .unwrap();
    assert_eq!(ok.message, "Execution started");
    assert_eq!(requests_used(&gw, &ws).await, 10.0);

    let err = gw
        .dispatcher
        .execute(&anonymous("10.0.0.1"), &call("demo"), execute_body())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "quota_exceeded");
    let details = err.details().unwrap();
    assert_eq!(details["exceeded"], json!(["requests"]));
    assert_eq!(requests_used(&gw, &ws).await, 10.0);
    assert_eq!(gw.handoff.requests().await.len(), 1);
}

#[tokio::test]
async fn test_adaptive_captcha_then_block() {
    let gw = TestGateway::new().await;
    gw.published("demo", |ws| {
        ws.rate_limit = RateLimitConfig {
            soft_limit: Some(5),
            hard_limit: Some(10),
            ..Default::default()
        };
    })
    .await;

    let ctx = anonymous("192.0.2.10");
    let first = gw.dispatcher.entry(&ctx, &call("demo")).await.unwrap();
    assert!(!first.access_policy.require_captcha);
    let session_id = first.session_id.unwrap();

    for hit in 2..=10 {
        let entry = gw
            .dispatcher
            .entry(&anonymous("192.0.2.10"), &call_with_session("demo", session_id))
            .await
            .unwrap();
        assert_eq!(entry.session_id, Some(session_id));
        assert_eq!(entry.access_policy.require_captcha, hit > 5, "hit {hit}");
    }

    for _ in 11..=13 {
        let err = gw
            .dispatcher
            .entry(&anonymous("192.0.2.10"), &call_with_session("demo", session_id))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "rate_limited");
    }

    let err = gw
        .dispatcher
        .entry(&anonymous("192.0.2.10"), &call_with_session("demo", session_id))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionBlocked { .. }));
}

#[tokio::test]
async fn test_captcha_enforced_on_execute_once_soft_limit_passed() {
    let gw = TestGateway::new().await;
    gw.published("demo", |ws| {
        ws.rate_limit = RateLimitConfig {
            soft_limit: Some(1),
            hard_limit: Some(10),
            ..Default::default()
        };
    })
    .await;

    let first = gw
        .dispatcher
        .entry(&anonymous("192.0.2.20"), &call("demo"))
        .await
        .unwrap();
    let session_id = first.session_id.unwrap();

    let err = gw
        .dispatcher
        .execute(
            &anonymous("192.0.2.20"),
            &call_with_session("demo", session_id),
            execute_body(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CaptchaRequired));

    let err = gw
        .dispatcher
        .execute(
            &anonymous("192.0.2.20"),
            &call_with_session("demo", session_id),
            ExecuteBody {
                captcha_token: Some("forged".into()),
                ..execute_body()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CaptchaInvalid));

    let ok = gw
        .dispatcher
        .execute(
            &anonymous("192.0.2.20"),
            &call_with_session("demo", session_id),
            ExecuteBody {
                captcha_token: Some(CAPTCHA_TOKEN.into()),
                ..execute_body()
            },
        )
        .await
        .unwrap();
    assert_eq!(ok.session_id, Some(session_id));
}

#[tokio::test]
async fn test_invalid_inputs_are_aggregated_without_charge() {
    let gw = TestGateway::new().await;
    let ws = gw.published("demo", |_| {}).await;

    let err = gw
        .dispatcher
        .execute(
            &anonymous("10.0.0.2"),
            &call("demo"),
            ExecuteBody {
                inputs: json!({"title": "t".repeat(150), "count": 0}),
                ..ExecuteBody::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_inputs");
    let details = err.details().unwrap();
    assert_eq!(details[0]["field"], "title");
    assert_eq!(details[0]["code"], "max_length");
    assert_eq!(details[1]["field"], "count");
    assert_eq!(details[1]["code"], "min_value");

    assert_eq!(requests_used(&gw, &ws).await, 0.0);
    assert!(gw.handoff.requests().await.is_empty());
}

#[tokio::test]
async fn test_execute_outcomes_are_recorded_as_access_events() {
    let gw = TestGateway::new().await;
    let ws = gw.published("demo", |_| {}).await;

    gw.dispatcher
        .execute(&anonymous("10.0.0.3"), &call("demo"), execute_body())
        .await
        .unwrap();

    let query = |types: Vec<AccessEventType>| EventQuery {
        workspace_id: ws.id,
        from: None,
        to: None,
        event_types: types,
        offset: 0,
        limit: 50,
    };
    let executes = gw
        .store
        .list_access_events(&query(vec![AccessEventType::Execute]))
        .await
        .unwrap();
    let successes = gw
        .store
        .list_access_events(&query(vec![AccessEventType::ExecuteSuccess]))
        .await
        .unwrap();
    assert_eq!(executes.len(), 1);
    assert_eq!(successes.len(), 1);
    assert_eq!(executes[0].session_id, successes[0].session_id);
}

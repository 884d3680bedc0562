use std::fs;
use std::sync::Arc;

use agentguard::api::{build_router, AppState};
use agentguard::config::Settings;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const ADMIN_KEY: &str = "test-admin-key";

fn test_settings(tmp: &TempDir) -> Settings {
    let wal = tmp.path().join("audit.wal");
    let wal = wal.to_str().expect("utf8 path").to_string();
    Settings::from_lookup(|key| match key {
        "AUDIT_WAL_PATH" => Some(wal.clone()),
        "ADMIN_API_KEY" => Some(ADMIN_KEY.to_string()),
        _ => None,
    })
    .expect("test settings")
}

fn build_test_app(tmp: &TempDir) -> (axum::Router, Arc<AppState>) {
    let settings = test_settings(tmp);
    let state =
        AppState::build(settings, SigningKey::generate(&mut OsRng)).expect("app state");
    (build_router(state.clone()), state)
}

async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    payload: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match payload {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request build");

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

async fn create_agent(app: &axum::Router, team: &str) -> (String, String) {
    let (status, body) = send(
        app,
        "POST",
        "/agents",
        &[("x-admin-key", ADMIN_KEY)],
        Some(json!({
            "display_name": "research-crawler",
            "owner_team": team,
            "environment": "prod",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let agent_id = body["agent_id"].as_str().expect("agent_id").to_string();
    let api_key = body["api_key"].as_str().expect("api_key").to_string();
    assert!(agent_id.starts_with("agt_"));
    assert!(api_key.starts_with("agk_"));
    (agent_id, api_key)
}

async fn put_policy(app: &axum::Router, agent_id: &str, policy: Value) {
    let (status, _) = send(
        app,
        "PUT",
        &format!("/agents/{agent_id}/policy"),
        &[("x-admin-key", ADMIN_KEY)],
        Some(policy),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn allowed_action_is_audited_on_the_chain() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);
    let (agent_id, agent_key) = create_agent(&app, "t1").await;

    put_policy(
        &app,
        &agent_id,
        json!({ "allow": [{ "action": "read:file", "resource": "*" }], "deny": [] }),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/enforce",
        &[("x-agent-key", &agent_key)],
        Some(json!({ "action": "read file", "resource": "a.txt" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], json!(true));
    assert_eq!(body["reason"], json!("matched allow rule read:file on *"));

    let (status, logs) = send(
        &app,
        "GET",
        &format!("/logs?agent_id={agent_id}"),
        &[("x-admin-key", ADMIN_KEY)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(logs.as_array().expect("array").len(), 1);
    assert_eq!(logs[0]["action"], json!("read:file"));
    assert_eq!(logs[0]["result"], json!("success"));

    let (status, verification) = send(
        &app,
        "GET",
        &format!("/logs/verify?agent_id={agent_id}"),
        &[("x-admin-key", ADMIN_KEY)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verification["valid"], json!(true));
    assert_eq!(verification["total_entries"], json!(1));
}

#[tokio::test]
async fn team_deny_overrides_agent_allow() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);
    let (agent_id, agent_key) = create_agent(&app, "t1").await;

    put_policy(
        &app,
        &agent_id,
        json!({ "allow": [{ "action": "read:file", "resource": "*" }] }),
    )
    .await;
    let (status, _) = send(
        &app,
        "PUT",
        "/teams/t1/policy",
        &[("x-admin-key", ADMIN_KEY)],
        Some(json!({ "deny": [{ "action": "read:*", "resource": "secret/*" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        "POST",
        "/enforce",
        &[("x-agent-key", &agent_key)],
        Some(json!({ "action": "read file", "resource": "secret/keys" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], json!(false));
    assert_eq!(body["reason"], json!("matched deny rule read:* on secret/*"));

    // outside the denied subtree the agent allow still wins
    let (_, body) = send(
        &app,
        "POST",
        "/enforce",
        &[("x-agent-key", &agent_key)],
        Some(json!({ "action": "read file", "resource": "public/readme" })),
    )
    .await;
    assert_eq!(body["allowed"], json!(true));
}

#[tokio::test]
async fn approval_flow_suspends_then_resolves() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);
    let (agent_id, agent_key) = create_agent(&app, "t1").await;

    put_policy(
        &app,
        &agent_id,
        json!({
            "require_approval": [
                { "action": "delete:database", "resource": "research_findings" }
            ]
        }),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/enforce",
        &[("x-agent-key", &agent_key)],
        Some(json!({ "action": "delete:database", "resource": "research_findings" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], json!(false));
    assert_eq!(body["status"], json!("pending"));
    let approval_id = body["approval_id"].as_str().expect("approval_id").to_string();
    assert!(approval_id.starts_with("ap_"));

    // the agent polls its own request
    let (status, poll) = send(
        &app,
        "GET",
        &format!("/approvals/{approval_id}"),
        &[("x-agent-key", &agent_key)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(poll["status"], json!("pending"));

    // the admin listing shows it pending
    let (_, listing) = send(
        &app,
        "GET",
        "/approvals?status=pending",
        &[("x-admin-key", ADMIN_KEY)],
        None,
    )
    .await;
    assert_eq!(listing["pending_count"], json!(1));
    assert_eq!(listing["items"][0]["approval_id"], json!(approval_id.as_str()));

    let (status, decided) = send(
        &app,
        "POST",
        &format!("/approvals/{approval_id}/approve"),
        &[("x-admin-key", ADMIN_KEY)],
        Some(json!({ "reason": "cleared with the data owner" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decided["status"], json!("approved"));
    assert_eq!(decided["decided_by"], json!("admin"));

    // effective on the next poll
    let (_, poll) = send(
        &app,
        "GET",
        &format!("/approvals/{approval_id}"),
        &[("x-agent-key", &agent_key)],
        None,
    )
    .await;
    assert_eq!(poll["status"], json!("approved"));
    assert_eq!(poll["decision_reason"], json!("cleared with the data owner"));

    // terminal: a second decision conflicts
    let (status, conflict) = send(
        &app,
        "POST",
        &format!("/approvals/{approval_id}/deny"),
        &[("x-admin-key", ADMIN_KEY)],
        Some(json!({ "reason": "changed my mind" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(conflict["detail"], json!("Approval is already approved"));
}

#[tokio::test]
async fn revoked_admin_token_is_uniformly_rejected() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);

    let (status, body) = send(
        &app,
        "POST",
        "/token",
        &[],
        Some(json!({ "admin_key": ADMIN_KEY })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], json!("bearer"));
    let token = body["access_token"].as_str().expect("token").to_string();
    let bearer = format!("Bearer {token}");

    // the token works for admin writes
    let (status, _) = send(
        &app,
        "POST",
        "/agents",
        &[("authorization", &bearer)],
        Some(json!({
            "display_name": "a",
            "owner_team": "t1",
            "environment": "dev",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, "POST", "/token/revoke", &[("authorization", &bearer)], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked"], json!(true));

    let (status, body) = send(
        &app,
        "POST",
        "/agents",
        &[("authorization", &bearer)],
        Some(json!({
            "display_name": "b",
            "owner_team": "t1",
            "environment": "dev",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["detail"], json!("Invalid or expired token"));
}

#[tokio::test]
async fn agent_token_exchange_works_for_enforce() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);
    let (agent_id, agent_key) = create_agent(&app, "t1").await;
    put_policy(
        &app,
        &agent_id,
        json!({ "allow": [{ "action": "read:file" }] }),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/token",
        &[],
        Some(json!({ "agent_key": agent_key })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["expires_in"], json!(3600));
    let bearer = format!("Bearer {}", body["access_token"].as_str().expect("token"));

    let (status, body) = send(
        &app,
        "POST",
        "/enforce",
        &[("authorization", &bearer)],
        Some(json!({ "action": "readFile", "resource": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], json!(true));
}

#[tokio::test]
async fn tampered_wal_fails_verification_at_the_tampered_entry() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);
    let (agent_id, agent_key) = create_agent(&app, "t1").await;

    let mut log_ids = Vec::new();
    for action in ["read:file", "write:file", "delete:file"] {
        let (status, body) = send(
            &app,
            "POST",
            "/logs",
            &[("x-agent-key", &agent_key)],
            Some(json!({
                "action": action,
                "resource": "a.txt",
                "allowed": true,
                "result": "success",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        log_ids.push(body["log_id"].as_str().expect("log_id").to_string());
    }

    // overwrite the second entry's action directly in the WAL
    let wal = tmp.path().join("audit.wal");
    let content = fs::read_to_string(&wal).expect("read wal");
    let tampered: Vec<String> = content
        .lines()
        .map(|line| {
            let mut value: Value = serde_json::from_str(line).expect("parse line");
            if value["log_id"] == json!(log_ids[1].as_str()) {
                value["action"] = json!("exfiltrate:file");
            }
            value.to_string()
        })
        .collect();
    fs::write(&wal, tampered.join("\n") + "\n").expect("write wal");

    let (status, verification) = send(
        &app,
        "GET",
        &format!("/logs/verify?agent_id={agent_id}"),
        &[("x-admin-key", ADMIN_KEY)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verification["valid"], json!(false));
    assert_eq!(verification["total_entries"], json!(3));
    assert_eq!(verification["broken_at"], json!(log_ids[1].as_str()));
}

#[tokio::test]
async fn default_deny_without_matching_rules() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);
    let (agent_id, agent_key) = create_agent(&app, "t1").await;

    // no policy at all
    let (status, body) = send(
        &app,
        "POST",
        "/enforce",
        &[("x-agent-key", &agent_key)],
        Some(json!({ "action": "read:file" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], json!(false));
    assert_eq!(body["reason"], json!("no policy defined for agent"));

    // a policy exists but nothing matches
    put_policy(
        &app,
        &agent_id,
        json!({ "allow": [{ "action": "read:file" }] }),
    )
    .await;
    let (_, body) = send(
        &app,
        "POST",
        "/enforce",
        &[("x-agent-key", &agent_key)],
        Some(json!({ "action": "drop table" })),
    )
    .await;
    assert_eq!(body["allowed"], json!(false));
    assert_eq!(body["reason"], json!("no matching rule"));
}

#[tokio::test]
async fn auth_failures_are_uniform() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);

    // no credentials
    let (status, body) = send(
        &app,
        "POST",
        "/enforce",
        &[],
        Some(json!({ "action": "read:file" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["detail"], json!("Authentication required"));

    // bad agent key
    let (status, _) = send(
        &app,
        "POST",
        "/enforce",
        &[("x-agent-key", "agk_bogus")],
        Some(json!({ "action": "read:file" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // an admin credential is the wrong class for enforce
    let (status, body) = send(
        &app,
        "POST",
        "/enforce",
        &[("x-admin-key", ADMIN_KEY)],
        Some(json!({ "action": "read:file" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["detail"], json!("agent token required"));

    // garbage bearer
    let (status, body) = send(
        &app,
        "GET",
        "/agents",
        &[("authorization", "Bearer not.a.token")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["detail"], json!("Invalid or expired token"));
}

#[tokio::test]
async fn validation_errors_list_fields() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);

    let (status, body) = send(
        &app,
        "POST",
        "/agents",
        &[("x-admin-key", ADMIN_KEY)],
        Some(json!({ "display_name": "", "owner_team": " ", "environment": "dev" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let errors = body["detail"].as_array().expect("field errors");
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0]["field"], json!("display_name"));
}

#[tokio::test]
async fn public_bucket_rate_limits_token_requests() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);

    let mut last = (StatusCode::OK, Value::Null);
    for _ in 0..101 {
        last = send(
            &app,
            "POST",
            "/token",
            &[("x-forwarded-for", "10.0.0.9")],
            Some(json!({ "admin_key": "wrong" })),
        )
        .await;
    }
    assert_eq!(last.0, StatusCode::TOO_MANY_REQUESTS);
    let retry_after = last.1["retry_after"].as_u64().expect("retry_after");
    assert!(retry_after >= 1 && retry_after <= 60);
}

#[tokio::test]
async fn deactivated_agent_is_rejected_at_auth_but_approval_stays_decidable() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);
    let (agent_id, agent_key) = create_agent(&app, "t1").await;
    put_policy(
        &app,
        &agent_id,
        json!({ "require_approval": [{ "action": "deploy:service" }] }),
    )
    .await;

    let (_, body) = send(
        &app,
        "POST",
        "/enforce",
        &[("x-agent-key", &agent_key)],
        Some(json!({ "action": "deploy:service" })),
    )
    .await;
    let approval_id = body["approval_id"].as_str().expect("approval_id").to_string();

    let (status, _) = send(
        &app,
        "DELETE",
        &format!("/agents/{agent_id}"),
        &[("x-admin-key", ADMIN_KEY)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // the deactivated agent can no longer authenticate
    let (status, _) = send(
        &app,
        "POST",
        "/enforce",
        &[("x-agent-key", &agent_key)],
        Some(json!({ "action": "deploy:service" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // but the pending approval can still be resolved
    let (status, decided) = send(
        &app,
        "POST",
        &format!("/approvals/{approval_id}/deny"),
        &[("x-admin-key", ADMIN_KEY)],
        Some(json!({ "reason": "agent was retired" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decided["status"], json!("denied"));
}

#[tokio::test]
async fn named_admin_roles_gate_decisions() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);
    let (agent_id, agent_key) = create_agent(&app, "t1").await;
    put_policy(
        &app,
        &agent_id,
        json!({ "require_approval": [{ "action": "deploy:service" }] }),
    )
    .await;
    let (_, body) = send(
        &app,
        "POST",
        "/enforce",
        &[("x-agent-key", &agent_key)],
        Some(json!({ "action": "deploy:service" })),
    )
    .await;
    let approval_id = body["approval_id"].as_str().expect("approval_id").to_string();

    // an auditor can look but not decide
    let (status, auditor) = send(
        &app,
        "POST",
        "/admin/users",
        &[("x-admin-key", ADMIN_KEY)],
        Some(json!({ "display_name": "watcher", "role": "auditor" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let auditor_key = auditor["api_key"].as_str().expect("key").to_string();

    let (status, body) = send(
        &app,
        "POST",
        "/token",
        &[],
        Some(json!({ "admin_key": auditor_key })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let auditor_bearer = format!("Bearer {}", body["access_token"].as_str().expect("token"));

    let (status, _) = send(
        &app,
        "GET",
        "/approvals",
        &[("authorization", &auditor_bearer)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/approvals/{approval_id}/approve"),
        &[("authorization", &auditor_bearer)],
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["detail"], json!("approver role or higher required"));

    // an approver can decide
    let (_, approver) = send(
        &app,
        "POST",
        "/admin/users",
        &[("x-admin-key", ADMIN_KEY)],
        Some(json!({ "display_name": "gatekeeper", "role": "approver" })),
    )
    .await;
    let approver_key = approver["api_key"].as_str().expect("key").to_string();
    let (_, body) = send(
        &app,
        "POST",
        "/token",
        &[],
        Some(json!({ "admin_key": approver_key })),
    )
    .await;
    let approver_bearer = format!("Bearer {}", body["access_token"].as_str().expect("token"));

    let (status, decided) = send(
        &app,
        "POST",
        &format!("/approvals/{approval_id}/approve"),
        &[("authorization", &approver_bearer)],
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decided["status"], json!("approved"));
    assert_eq!(decided["decision_reason"], json!("Approved by admin"));
}

#[tokio::test]
async fn policy_round_trips_through_the_api() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);
    let (agent_id, _) = create_agent(&app, "t1").await;

    let document = json!({
        "allow": [{
            "action": "write:database",
            "resource": "*",
            "conditions": {
                "env": ["prod"],
                "time_range": { "start": "09:00", "end": "18:00" },
                "day_of_week": ["Mon", "Tue", "Wed", "Thu", "Fri"]
            }
        }],
        "deny": [{ "action": "delete:*" }],
        "require_approval": [{ "action": "deploy:service", "resource": "prod/*" }]
    });
    put_policy(&app, &agent_id, document.clone()).await;

    let (status, body) = send(
        &app,
        "GET",
        &format!("/agents/{agent_id}/policy"),
        &[("x-admin-key", ADMIN_KEY)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allow"], document["allow"]);
    assert_eq!(body["deny"], document["deny"]);
    assert_eq!(body["require_approval"], document["require_approval"]);
    assert_eq!(body["agent_id"], json!(agent_id.as_str()));
}

#[tokio::test]
async fn summary_report_aggregates_activity() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);
    let (agent_id, agent_key) = create_agent(&app, "t1").await;

    put_policy(
        &app,
        &agent_id,
        json!({
            "allow": [{ "action": "read:file", "resource": "*" }],
            "require_approval": [{ "action": "deploy:service" }]
        }),
    )
    .await;

    for (action, expect_allowed) in [
        ("read file", true),
        ("read file", true),
        ("drop table", false),
        ("deploy:service", false),
    ] {
        let (status, body) = send(
            &app,
            "POST",
            "/enforce",
            &[("x-agent-key", &agent_key)],
            Some(json!({ "action": action })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allowed"], json!(expect_allowed));
    }

    let (status, report) = send(
        &app,
        "GET",
        "/reports/summary",
        &[("x-admin-key", ADMIN_KEY)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["period_days"], json!(30));
    assert_eq!(report["overview"]["total_actions"], json!(4));
    assert_eq!(report["overview"]["allowed"], json!(2));
    assert_eq!(report["overview"]["denied"], json!(2));
    assert_eq!(report["overview"]["allow_rate"], json!(50.0));

    assert_eq!(report["approvals"]["total"], json!(1));
    assert_eq!(report["approvals"]["pending"], json!(1));

    let top_agents = report["top_agents"].as_array().expect("top agents");
    assert_eq!(top_agents.len(), 1);
    assert_eq!(top_agents[0]["agent_id"], json!(agent_id.as_str()));
    assert_eq!(top_agents[0]["agent_name"], json!("research-crawler"));
    assert_eq!(top_agents[0]["total_actions"], json!(4));

    let top_denied = report["top_denied_actions"].as_array().expect("top denied");
    assert_eq!(top_denied.len(), 2);
    assert_eq!(top_denied[0]["count"], json!(1));

    let daily = report["daily_breakdown"].as_array().expect("daily");
    assert_eq!(daily.len(), 14);
    assert_eq!(daily.last().expect("today")["total"], json!(4));

    // the look-back window is validated
    let (status, body) = send(
        &app,
        "GET",
        "/reports/summary?days=400",
        &[("x-admin-key", ADMIN_KEY)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["detail"][0]["field"], json!("days"));

    // reports are not public
    let (status, _) = send(&app, "GET", "/reports/summary", &[], None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_jwks_and_metrics_are_public() {
    let tmp = TempDir::new().expect("tempdir");
    let (app, _state) = build_test_app(&tmp);

    let (status, body) = send(&app, "GET", "/health", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));

    let (status, body) = send(&app, "GET", "/health/ready", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["store"], json!(true));
    assert_eq!(body["checks"]["audit_log"], json!(true));

    let (status, body) = send(&app, "GET", "/health/live", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("alive"));

    let (status, body) = send(&app, "GET", "/.well-known/jwks.json", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["keys"][0]["kty"], json!("OKP"));

    // metrics render as Prometheus text, so fetch raw
    let request = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("bytes");
    let text = String::from_utf8(bytes.to_vec()).expect("utf8");
    assert!(text.contains("agentguard_http_requests_total"));
}

//! Outbound webhook notifications for approval lifecycle events.
//!
//! Dispatch is fire-and-forget: the HTTP post runs on a spawned task after
//! the state change has committed, and a failed delivery is logged and
//! otherwise dropped. Slack incoming-webhook URLs get Slack's attachment
//! format; every other destination receives the raw event payload, signed
//! with HMAC-SHA256 when a shared secret is configured.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use crate::crypto::webhook_signature;
use crate::proto::{ApprovalRequest, ApprovalStatus};

pub const SIGNATURE_HEADER: &str = "x-agentguard-signature";

pub struct Notifier {
    url: Option<String>,
    secret: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(url: Option<String>, secret: Option<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.clamp(1, 5)))
            .build()
            .unwrap_or_default();
        Self { url, secret, client }
    }

    pub fn disabled() -> Self {
        Self::new(None, None, 5)
    }

    /// A new approval request needs a human decision.
    pub fn approval_created(&self, approval: &ApprovalRequest, agent_name: Option<&str>) {
        self.dispatch(
            "approval.created",
            approval,
            agent_name,
            json!({ "context": approval.context }),
        );
    }

    /// A human approved or denied the request.
    pub fn approval_decided(&self, approval: &ApprovalRequest, agent_name: Option<&str>) {
        let event = match approval.status {
            ApprovalStatus::Approved => "approval.approved",
            ApprovalStatus::Denied => "approval.denied",
            ApprovalStatus::Pending => return,
        };
        self.dispatch(
            event,
            approval,
            agent_name,
            json!({
                "decision_reason": approval.decision_reason,
                "decided_by": approval.decided_by,
            }),
        );
    }

    fn dispatch(
        &self,
        event: &str,
        approval: &ApprovalRequest,
        agent_name: Option<&str>,
        extra: Value,
    ) {
        let Some(url) = self.url.clone() else {
            return;
        };

        let is_slack = url.contains("hooks.slack.com");
        let body = if is_slack {
            slack_body(event, approval, agent_name)
        } else {
            let mut payload = json!({
                "event": event,
                "timestamp": Utc::now(),
                "approval_id": approval.approval_id,
                "agent_id": approval.agent_id,
                "agent_name": agent_name,
                "action": approval.action,
                "resource": approval.resource,
            });
            if let (Value::Object(payload_map), Value::Object(extra_map)) = (&mut payload, extra) {
                payload_map.extend(extra_map);
            }
            payload
        };

        let body_bytes = body.to_string().into_bytes();
        let mut request = self
            .client
            .post(&url)
            .header("content-type", "application/json");
        if !is_slack {
            if let Some(secret) = &self.secret {
                let signature = webhook_signature(secret, &body_bytes);
                request = request.header(SIGNATURE_HEADER, format!("sha256={signature}"));
            }
        }

        let event = event.to_string();
        tokio::spawn(async move {
            match request.body(body_bytes).send().await {
                Ok(response) => tracing::debug!(
                    event = %event,
                    status = %response.status(),
                    "webhook delivered"
                ),
                Err(error) => tracing::warn!(
                    event = %event,
                    %error,
                    "webhook delivery failed"
                ),
            }
        });
    }
}

fn slack_body(event: &str, approval: &ApprovalRequest, agent_name: Option<&str>) -> Value {
    let agent = agent_name.unwrap_or(&approval.agent_id);
    let resource_part = approval
        .resource
        .as_deref()
        .map(|r| format!(" on `{r}`"))
        .unwrap_or_default();
    let reason = approval
        .decision_reason
        .as_deref()
        .map(|r| format!("\n> {r}"))
        .unwrap_or_default();

    let (text, color) = match event {
        "approval.created" => (
            format!(
                "*AgentGuard — Human Approval Required*\nAgent *{agent}* wants to perform `{}`{resource_part}.",
                approval.action
            ),
            "#F59E0B",
        ),
        "approval.approved" => (
            format!(
                "*AgentGuard — Request Approved*\nAgent *{agent}* action `{}`{resource_part} was *approved*.{reason}",
                approval.action
            ),
            "#10B981",
        ),
        _ => (
            format!(
                "*AgentGuard — Request Denied*\nAgent *{agent}* action `{}`{resource_part} was *denied*.{reason}",
                approval.action
            ),
            "#EF4444",
        ),
    };

    json!({
        "attachments": [{
            "color": color,
            "text": text,
            "footer": format!("AgentGuard | {}", Utc::now().format("%Y-%m-%d %H:%M UTC")),
        }]
    })
}

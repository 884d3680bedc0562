//! Approval queue.
//!
//! A pending verdict suspends into an `ApprovalRequest`; a human resolves it
//! and the agent observes the decision on its next poll. The state machine
//! is pending → approved | denied, terminal once decided.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::proto::{
    Agent, ApprovalListResponse, ApprovalRequest, ApprovalStatus, ApprovalView,
};
use crate::store::{DecideOutcome, Store, StoreError};
use crate::webhook::Notifier;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval {0} not found")]
    NotFound(String),
    #[error("approval is already {}", .0.as_str())]
    AlreadyDecided(ApprovalStatus),
    #[error("status must be one of: pending, approved, denied")]
    InvalidStatusFilter,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ApprovalQueue {
    store: Arc<Store>,
    notifier: Arc<Notifier>,
}

impl ApprovalQueue {
    pub fn new(store: Arc<Store>, notifier: Arc<Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Open a pending record for a require-approval verdict and announce it.
    /// `approval_id` is pre-allocated by the caller so the audit entry for
    /// the decision can reference it before this record exists.
    pub fn open(
        &self,
        approval_id: String,
        agent: &Agent,
        action: &str,
        resource: Option<String>,
        context: Option<serde_json::Value>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let approval = ApprovalRequest {
            approval_id,
            agent_id: agent.agent_id.clone(),
            action: action.to_string(),
            resource,
            context,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            decided_at: None,
            decided_by: None,
            decision_reason: None,
        };
        self.store.insert_approval(approval.clone())?;
        self.notifier
            .approval_created(&approval, Some(&agent.display_name));
        Ok(approval)
    }

    pub fn new_approval_id() -> String {
        format!("ap_{}", Uuid::new_v4())
    }

    pub fn get(&self, approval_id: &str) -> Result<ApprovalRequest, ApprovalError> {
        self.store
            .get_approval(approval_id)?
            .ok_or_else(|| ApprovalError::NotFound(approval_id.to_string()))
    }

    /// Apply a terminal decision. The decided agent sees the new status on
    /// its next poll; the webhook fires after the record is updated.
    pub fn decide(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
        decided_by: &str,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let reason = reason.filter(|r| !r.trim().is_empty()).unwrap_or_else(|| {
            match status {
                ApprovalStatus::Denied => "Denied by admin".to_string(),
                _ => "Approved by admin".to_string(),
            }
        });

        let outcome =
            self.store
                .decide_approval(approval_id, status, decided_by, reason, Utc::now())?;
        let approval = match outcome {
            DecideOutcome::Decided(approval) => approval,
            DecideOutcome::NotFound => {
                return Err(ApprovalError::NotFound(approval_id.to_string()))
            }
            DecideOutcome::AlreadyDecided(current) => {
                return Err(ApprovalError::AlreadyDecided(current))
            }
        };

        let agent_name = self
            .store
            .get_agent(&approval.agent_id)?
            .map(|a| a.display_name);
        self.notifier
            .approval_decided(&approval, agent_name.as_deref());

        tracing::info!(
            approval_id = %approval.approval_id,
            agent_id = %approval.agent_id,
            status = approval.status.as_str(),
            "approval decided"
        );
        Ok(approval)
    }

    /// Filtered listing. `team` restricts visibility for team-scoped admins.
    pub fn list(
        &self,
        status_filter: Option<&str>,
        agent_id: Option<&str>,
        team: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<ApprovalListResponse, ApprovalError> {
        let status = match status_filter {
            None => None,
            Some("pending") => Some(ApprovalStatus::Pending),
            Some("approved") => Some(ApprovalStatus::Approved),
            Some("denied") => Some(ApprovalStatus::Denied),
            Some(_) => return Err(ApprovalError::InvalidStatusFilter),
        };

        let (items, total, pending_count) =
            self.store
                .list_approvals(status, agent_id, team, limit, offset)?;

        Ok(ApprovalListResponse {
            items: items
                .into_iter()
                .map(|(approval, agent_name)| ApprovalView {
                    approval,
                    agent_name,
                })
                .collect(),
            total,
            pending_count,
        })
    }
}

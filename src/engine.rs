//! Policy decision engine.
//!
//! Composes the agent's own policy with its team's base policy, evaluates
//! the effective rule lists in deny → require-approval → allow order, and
//! writes exactly one audit entry per call before the verdict is returned.
//! An unreachable policy store fails closed: the default deny is audited
//! with `result=error` and the call surfaces as a service error.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;

use crate::approvals::{ApprovalError, ApprovalQueue};
use crate::conditions;
use crate::ledger::{AuditLedger, LedgerError, NewEntry};
use crate::normalize::{action_matches, normalize, resource_matches};
use crate::proto::{Agent, AuditResult, EnforceRequest, PolicyRule};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow { reason: String },
    Deny { reason: String },
    Pending { approval_id: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The policy store could not be read. The default deny is already
    /// audited with `result=error` when this surfaces; the caller maps it
    /// to 503 so no verdict is emitted as a success.
    #[error("policy unavailable")]
    Policy(#[source] StoreError),
    /// The audit entry could not be made durable; the decision is withheld.
    #[error("audit unavailable")]
    Audit(#[from] LedgerError),
    /// The approval record could not be opened after the verdict was audited.
    #[error("approval store unavailable")]
    Approval(#[from] ApprovalError),
}

pub struct DecisionEngine {
    store: Arc<Store>,
    ledger: Arc<AuditLedger>,
    approvals: Arc<ApprovalQueue>,
}

struct RuleMatch<'a> {
    rule: &'a PolicyRule,
    list: &'static str,
    position: usize,
}

impl DecisionEngine {
    pub fn new(store: Arc<Store>, ledger: Arc<AuditLedger>, approvals: Arc<ApprovalQueue>) -> Self {
        Self {
            store,
            ledger,
            approvals,
        }
    }

    /// Decide one enforcement request and audit it. The audit write precedes
    /// the response; if it fails the verdict is not emitted at all.
    pub fn decide(
        &self,
        agent: &Agent,
        request: &EnforceRequest,
        request_id: Option<String>,
    ) -> Result<Verdict, EngineError> {
        let now = Utc::now();
        let action = normalize(&request.action);
        let resource = request.resource.as_deref().unwrap_or("");

        let policies = self.load_policies(agent);
        let (agent_policy, team_policy) = match policies {
            Ok(found) => found,
            Err(error) => {
                tracing::error!(%error, agent_id = %agent.agent_id, "policy store unreachable");
                let verdict = Verdict::Deny {
                    reason: "policy unavailable".to_string(),
                };
                self.audit(agent, &action, request, request_id, &verdict, AuditResult::Error, None)?;
                return Err(EngineError::Policy(error));
            }
        };

        if agent_policy.is_none() && team_policy.is_none() {
            let verdict = Verdict::Deny {
                reason: "no policy defined for agent".to_string(),
            };
            self.audit(agent, &action, request, request_id, &verdict, AuditResult::Denied, None)?;
            return Ok(verdict);
        }

        // team rules precede agent rules in each effective list, so a team
        // deny fires before any agent allow is even consulted
        let empty: Vec<PolicyRule> = Vec::new();
        let (team_allow, team_deny, team_approval) = match &team_policy {
            Some(tp) => (&tp.allow, &tp.deny, &tp.require_approval),
            None => (&empty, &empty, &empty),
        };
        let (agent_allow, agent_deny, agent_approval) = match &agent_policy {
            Some(ap) => (&ap.allow, &ap.deny, &ap.require_approval),
            None => (&empty, &empty, &empty),
        };

        if let Some(matched) = find_match(
            [team_deny, agent_deny],
            "deny",
            &action,
            resource,
            agent.environment,
            now,
        ) {
            let verdict = Verdict::Deny {
                reason: rule_reason("deny", matched.rule),
            };
            self.audit(
                agent,
                &action,
                request,
                request_id,
                &verdict,
                AuditResult::Denied,
                Some(match_metadata(&matched, None)),
            )?;
            return Ok(verdict);
        }

        if let Some(matched) = find_match(
            [team_approval, agent_approval],
            "require_approval",
            &action,
            resource,
            agent.environment,
            now,
        ) {
            let approval_id = ApprovalQueue::new_approval_id();
            let verdict = Verdict::Pending {
                approval_id: approval_id.clone(),
            };
            self.audit(
                agent,
                &action,
                request,
                request_id,
                &verdict,
                AuditResult::Pending,
                Some(match_metadata(&matched, Some(&approval_id))),
            )?;
            self.approvals.open(
                approval_id,
                agent,
                &action,
                request.resource.clone(),
                request.context.clone(),
            )?;
            return Ok(verdict);
        }

        if let Some(matched) = find_match(
            [team_allow, agent_allow],
            "allow",
            &action,
            resource,
            agent.environment,
            now,
        ) {
            let verdict = Verdict::Allow {
                reason: rule_reason("allow", matched.rule),
            };
            self.audit(
                agent,
                &action,
                request,
                request_id,
                &verdict,
                AuditResult::Success,
                Some(match_metadata(&matched, None)),
            )?;
            return Ok(verdict);
        }

        let verdict = Verdict::Deny {
            reason: "no matching rule".to_string(),
        };
        self.audit(agent, &action, request, request_id, &verdict, AuditResult::Denied, None)?;
        Ok(verdict)
    }

    #[allow(clippy::type_complexity)]
    fn load_policies(
        &self,
        agent: &Agent,
    ) -> Result<
        (
            Option<crate::proto::AgentPolicy>,
            Option<crate::proto::TeamPolicy>,
        ),
        StoreError,
    > {
        Ok((
            self.store.get_agent_policy(&agent.agent_id)?,
            self.store.get_team_policy(&agent.owner_team)?,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn audit(
        &self,
        agent: &Agent,
        action: &str,
        request: &EnforceRequest,
        request_id: Option<String>,
        verdict: &Verdict,
        result: AuditResult,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), EngineError> {
        self.ledger.append(NewEntry {
            agent_id: agent.agent_id.clone(),
            action: action.to_string(),
            resource: request.resource.clone(),
            context: request.context.clone(),
            allowed: matches!(verdict, Verdict::Allow { .. }),
            result,
            metadata,
            request_id,
        })?;
        Ok(())
    }
}

fn find_match<'a>(
    lists: [&'a Vec<PolicyRule>; 2],
    list: &'static str,
    action: &str,
    resource: &str,
    environment: crate::proto::Environment,
    now: chrono::DateTime<Utc>,
) -> Option<RuleMatch<'a>> {
    lists
        .into_iter()
        .flatten()
        .enumerate()
        .find(|(_, rule)| {
            action_matches(action, &rule.action)
                && resource_matches(resource, rule.resource.as_deref())
                && conditions::evaluate(rule.conditions.as_ref(), environment, now)
        })
        .map(|(position, rule)| RuleMatch { rule, list, position })
}

fn rule_reason(list: &str, rule: &PolicyRule) -> String {
    format!(
        "matched {list} rule {} on {}",
        rule.action,
        rule.resource.as_deref().unwrap_or("*")
    )
}

fn match_metadata(matched: &RuleMatch<'_>, approval_id: Option<&str>) -> serde_json::Value {
    let mut metadata = json!({
        "matched_rule": {
            "list": matched.list,
            "position": matched.position,
        }
    });
    if let Some(id) = approval_id {
        metadata["approval_id"] = json!(id);
    }
    metadata
}

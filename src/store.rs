//! In-memory entity store.
//!
//! This is the transactional key-value-with-indexes collaborator the rest of
//! the service depends on: agents, credentials, admin users, policies, team
//! policies, and approval records, with the specific lookups the decision
//! engine and auth gate need. Every operation returns `Result` so callers
//! handle an unreachable store uniformly; a networked realization slots in
//! behind the same surface.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::proto::{
    Agent, AgentCredential, AgentPolicy, AdminUser, ApprovalRequest, ApprovalStatus, Environment,
    PolicyDocument, TeamPolicy,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result of an approval decision attempt. The state machine admits exactly
/// one pending → terminal transition.
#[derive(Debug)]
pub enum DecideOutcome {
    Decided(ApprovalRequest),
    NotFound,
    AlreadyDecided(ApprovalStatus),
}

/// Approval counters for the compliance summary. `pending` spans all time;
/// the other counters honor the report's look-back cutoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovalStats {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub denied: usize,
}

#[derive(Default)]
pub struct Store {
    agents: RwLock<HashMap<String, Agent>>,
    /// keyed by secret hash
    credentials: RwLock<HashMap<String, AgentCredential>>,
    admins: RwLock<HashMap<String, AdminUser>>,
    /// keyed by agent id
    policies: RwLock<HashMap<String, AgentPolicy>>,
    team_policies: RwLock<HashMap<String, TeamPolicy>>,
    approvals: RwLock<HashMap<String, ApprovalRequest>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cheap readiness probe: confirms the store answers a read.
    pub fn ping(&self) -> Result<(), StoreError> {
        let _ = self.agents.read().expect("agents lock poisoned").len();
        Ok(())
    }

    // -- agents ------------------------------------------------------------

    pub fn insert_agent(&self, agent: Agent) -> Result<(), StoreError> {
        self.agents
            .write()
            .expect("agents lock poisoned")
            .insert(agent.agent_id.clone(), agent);
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        Ok(self
            .agents
            .read()
            .expect("agents lock poisoned")
            .get(agent_id)
            .cloned())
    }

    pub fn get_active_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        Ok(self.get_agent(agent_id)?.filter(|a| a.is_active))
    }

    pub fn list_agents(
        &self,
        environment: Option<Environment>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Agent>, StoreError> {
        let agents = self.agents.read().expect("agents lock poisoned");
        let mut items: Vec<Agent> = agents
            .values()
            .filter(|a| a.is_active)
            .filter(|a| environment.map_or(true, |env| a.environment == env))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items.into_iter().skip(offset).take(limit).collect())
    }

    /// Soft-deactivate: the agent row survives (the audit log references it)
    /// but its credentials stop working. Policy and logs are retained.
    pub fn deactivate_agent(&self, agent_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut agents = self.agents.write().expect("agents lock poisoned");
        let Some(agent) = agents.get_mut(agent_id) else {
            return Ok(false);
        };
        agent.is_active = false;
        agent.updated_at = now;

        let mut credentials = self.credentials.write().expect("credentials lock poisoned");
        for credential in credentials.values_mut() {
            if credential.agent_id == agent_id {
                credential.is_active = false;
            }
        }
        Ok(true)
    }

    /// Ids of every agent owned by `team`, active or not; deactivated agents
    /// keep their audit history in scope.
    pub fn team_agent_ids(&self, team: &str) -> Result<HashSet<String>, StoreError> {
        let agents = self.agents.read().expect("agents lock poisoned");
        Ok(agents
            .values()
            .filter(|a| a.owner_team == team)
            .map(|a| a.agent_id.clone())
            .collect())
    }

    // -- credentials -------------------------------------------------------

    pub fn insert_credential(&self, credential: AgentCredential) -> Result<(), StoreError> {
        self.credentials
            .write()
            .expect("credentials lock poisoned")
            .insert(credential.secret_hash.clone(), credential);
        Ok(())
    }

    pub fn agent_id_for_secret_hash(&self, secret_hash: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .credentials
            .read()
            .expect("credentials lock poisoned")
            .get(secret_hash)
            .filter(|c| c.is_active)
            .map(|c| c.agent_id.clone()))
    }

    // -- admin users -------------------------------------------------------

    pub fn insert_admin(&self, admin: AdminUser) -> Result<(), StoreError> {
        self.admins
            .write()
            .expect("admins lock poisoned")
            .insert(admin.admin_id.clone(), admin);
        Ok(())
    }

    pub fn list_admins(&self) -> Result<Vec<AdminUser>, StoreError> {
        let admins = self.admins.read().expect("admins lock poisoned");
        let mut items: Vec<AdminUser> = admins.values().cloned().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    pub fn deactivate_admin(&self, admin_id: &str) -> Result<bool, StoreError> {
        let mut admins = self.admins.write().expect("admins lock poisoned");
        match admins.get_mut(admin_id) {
            Some(admin) => {
                admin.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn admin_for_secret_hash(&self, secret_hash: &str) -> Result<Option<AdminUser>, StoreError> {
        let admins = self.admins.read().expect("admins lock poisoned");
        Ok(admins
            .values()
            .find(|a| a.is_active && a.credential_hash == secret_hash)
            .cloned())
    }

    // -- policies ----------------------------------------------------------

    pub fn upsert_agent_policy(
        &self,
        agent_id: &str,
        document: PolicyDocument,
        now: DateTime<Utc>,
    ) -> Result<AgentPolicy, StoreError> {
        let mut policies = self.policies.write().expect("policies lock poisoned");
        let created_at = policies.get(agent_id).map(|p| p.created_at).unwrap_or(now);
        let policy = AgentPolicy {
            agent_id: agent_id.to_string(),
            allow: document.allow,
            deny: document.deny,
            require_approval: document.require_approval,
            created_at,
            updated_at: now,
        };
        policies.insert(agent_id.to_string(), policy.clone());
        Ok(policy)
    }

    pub fn get_agent_policy(&self, agent_id: &str) -> Result<Option<AgentPolicy>, StoreError> {
        Ok(self
            .policies
            .read()
            .expect("policies lock poisoned")
            .get(agent_id)
            .cloned())
    }

    pub fn upsert_team_policy(
        &self,
        team: &str,
        document: PolicyDocument,
        now: DateTime<Utc>,
    ) -> Result<TeamPolicy, StoreError> {
        let mut team_policies = self.team_policies.write().expect("team policies lock poisoned");
        let created_at = team_policies.get(team).map(|p| p.created_at).unwrap_or(now);
        let policy = TeamPolicy {
            team: team.to_string(),
            allow: document.allow,
            deny: document.deny,
            require_approval: document.require_approval,
            created_at,
            updated_at: now,
        };
        team_policies.insert(team.to_string(), policy.clone());
        Ok(policy)
    }

    pub fn get_team_policy(&self, team: &str) -> Result<Option<TeamPolicy>, StoreError> {
        Ok(self
            .team_policies
            .read()
            .expect("team policies lock poisoned")
            .get(team)
            .cloned())
    }

    // -- approvals ---------------------------------------------------------

    pub fn insert_approval(&self, approval: ApprovalRequest) -> Result<(), StoreError> {
        self.approvals
            .write()
            .expect("approvals lock poisoned")
            .insert(approval.approval_id.clone(), approval);
        Ok(())
    }

    pub fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        Ok(self
            .approvals
            .read()
            .expect("approvals lock poisoned")
            .get(approval_id)
            .cloned())
    }

    /// Persist a terminal decision atomically with its metadata. A second
    /// decision attempt reports the already-terminal status instead.
    pub fn decide_approval(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
        decided_by: &str,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<DecideOutcome, StoreError> {
        let mut approvals = self.approvals.write().expect("approvals lock poisoned");
        let Some(approval) = approvals.get_mut(approval_id) else {
            return Ok(DecideOutcome::NotFound);
        };
        if approval.status != ApprovalStatus::Pending {
            return Ok(DecideOutcome::AlreadyDecided(approval.status));
        }

        approval.status = status;
        approval.decided_at = Some(now);
        approval.decided_by = Some(decided_by.to_string());
        approval.decision_reason = Some(reason);
        Ok(DecideOutcome::Decided(approval.clone()))
    }

    /// Approval counters for the summary report, optionally scoped to a
    /// team's agents. `cutoff` bounds everything except the pending count,
    /// which reflects the live queue.
    pub fn approval_stats(
        &self,
        team: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<ApprovalStats, StoreError> {
        let approvals = self.approvals.read().expect("approvals lock poisoned");
        let agents = self.agents.read().expect("agents lock poisoned");

        let in_team = |a: &ApprovalRequest| {
            team.map_or(true, |t| {
                agents
                    .get(&a.agent_id)
                    .map(|agent| agent.owner_team == t)
                    .unwrap_or(false)
            })
        };

        let mut stats = ApprovalStats::default();
        for approval in approvals.values().filter(|a| in_team(a)) {
            if approval.status == ApprovalStatus::Pending {
                stats.pending += 1;
            }
            if approval.created_at >= cutoff {
                stats.total += 1;
                match approval.status {
                    ApprovalStatus::Approved => stats.approved += 1,
                    ApprovalStatus::Denied => stats.denied += 1,
                    ApprovalStatus::Pending => {}
                }
            }
        }
        Ok(stats)
    }

    /// Filtered listing plus the pending counter. `team` scopes everything
    /// (including the counter) through the owning agent's team.
    #[allow(clippy::type_complexity)]
    pub fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
        agent_id: Option<&str>,
        team: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<(ApprovalRequest, Option<String>)>, usize, usize), StoreError> {
        let approvals = self.approvals.read().expect("approvals lock poisoned");
        let agents = self.agents.read().expect("agents lock poisoned");

        let in_team = |a: &ApprovalRequest| {
            team.map_or(true, |t| {
                agents
                    .get(&a.agent_id)
                    .map(|agent| agent.owner_team == t)
                    .unwrap_or(false)
            })
        };

        let mut matched: Vec<&ApprovalRequest> = approvals
            .values()
            .filter(|a| in_team(a))
            .filter(|a| status.map_or(true, |s| a.status == s))
            .filter(|a| agent_id.map_or(true, |id| a.agent_id == id))
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matched.len();
        let pending_count = approvals
            .values()
            .filter(|a| in_team(a))
            .filter(|a| a.status == ApprovalStatus::Pending)
            .count();

        let items = matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|a| {
                let name = agents.get(&a.agent_id).map(|ag| ag.display_name.clone());
                (a.clone(), name)
            })
            .collect();

        Ok((items, total, pending_count))
    }
}

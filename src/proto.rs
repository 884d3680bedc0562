use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deployment environment an agent runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub display_name: String,
    pub owner_team: String,
    pub environment: Environment,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Hashed static credential for an agent. The raw secret is returned exactly
/// once at creation; only the hash and a short diagnostic prefix are retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCredential {
    pub agent_id: String,
    pub secret_hash: String,
    pub secret_prefix: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "super-admin")]
    SuperAdmin,
    #[serde(rename = "admin")]
    Admin,
    #[serde(rename = "auditor")]
    Auditor,
    #[serde(rename = "approver")]
    Approver,
}

impl Role {
    /// Ordering used for "role >= X" checks: auditor < approver < admin < super-admin.
    pub fn rank(&self) -> u8 {
        match self {
            Role::Auditor => 0,
            Role::Approver => 1,
            Role::Admin => 2,
            Role::SuperAdmin => 3,
        }
    }

    pub fn at_least(&self, min: Role) -> bool {
        self.rank() >= min.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "super-admin",
            Role::Admin => "admin",
            Role::Auditor => "auditor",
            Role::Approver => "approver",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminUser {
    pub admin_id: String,
    pub display_name: String,
    pub role: Role,
    /// None means the admin spans all teams.
    pub team: Option<String>,
    pub credential_hash: String,
    pub credential_prefix: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Wall-clock window in "HH:MM" UTC. Wraps midnight when end < start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

/// AND-ed guards attached to a policy rule. A missing key always passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<RuleConditions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPolicy {
    pub agent_id: String,
    #[serde(default)]
    pub allow: Vec<PolicyRule>,
    #[serde(default)]
    pub deny: Vec<PolicyRule>,
    #[serde(default)]
    pub require_approval: Vec<PolicyRule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Team-level base policy merged with each agent's own policy at decision time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamPolicy {
    pub team: String,
    #[serde(default)]
    pub allow: Vec<PolicyRule>,
    #[serde(default)]
    pub deny: Vec<PolicyRule>,
    #[serde(default)]
    pub require_approval: Vec<PolicyRule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub agent_id: String,
    pub action: String,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub decision_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Denied,
    Error,
    Pending,
}

/// One link in an agent's tamper-evident audit chain. `chain_hash` covers the
/// previous entry's hash plus the canonical serialization of every other field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub log_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    pub allowed: bool,
    pub result: AuditResult,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub prev_log_id: Option<String>,
    pub chain_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokedToken {
    pub jti: String,
    pub revoked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// HTTP request / response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub agent_key: Option<String>,
    #[serde(default)]
    pub admin_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevokeResponse {
    pub revoked: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentCreateRequest {
    pub display_name: String,
    pub owner_team: String,
    pub environment: Environment,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentWithKey {
    #[serde(flatten)]
    pub agent: Agent,
    /// Raw credential, shown exactly once.
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub allow: Vec<PolicyRule>,
    #[serde(default)]
    pub deny: Vec<PolicyRule>,
    #[serde(default)]
    pub require_approval: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminUserCreateRequest {
    pub display_name: String,
    pub role: Role,
    #[serde(default)]
    pub team: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminUserWithKey {
    pub admin_id: String,
    pub display_name: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    /// Raw credential, shown exactly once.
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnforceRequest {
    pub action: String,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnforceResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditSubmitRequest {
    pub action: String,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    pub allowed: bool,
    pub result: AuditResult,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainVerifyResponse {
    pub agent_id: String,
    pub valid: bool,
    pub total_entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalView {
    #[serde(flatten)]
    pub approval: ApprovalRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalListResponse {
    pub items: Vec<ApprovalView>,
    pub total: usize,
    pub pending_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalDecisionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Compliance reporting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ReportOverview {
    pub total_actions: usize,
    pub allowed: usize,
    pub denied: usize,
    pub allow_rate: f64,
    pub deny_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportApprovals {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub denied: usize,
    pub approval_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentActivity {
    pub agent_id: String,
    pub agent_name: String,
    pub total_actions: usize,
    pub allowed: usize,
    pub denied: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeniedActionCount {
    pub action: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyActivity {
    pub date: String,
    pub total: usize,
    pub allowed: usize,
    pub denied: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    pub period_days: u32,
    pub generated_at: DateTime<Utc>,
    pub overview: ReportOverview,
    pub approvals: ReportApprovals,
    pub top_agents: Vec<AgentActivity>,
    pub top_denied_actions: Vec<DeniedActionCount>,
    pub daily_breakdown: Vec<DailyActivity>,
}

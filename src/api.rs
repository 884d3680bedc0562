//! HTTP surface: application state, routing table, and handlers.
//!
//! Handlers follow one shape: resolve the caller through the auth gate,
//! admit the request through the rate limiter, do the work, map errors to
//! `{detail}` bodies. Auth class and bucket per route are listed in the
//! routing table at the bottom of `build_router`.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::approvals::{ApprovalError, ApprovalQueue};
use crate::auth::{AuthError, AuthGate, Identity};
use crate::config::Settings;
use crate::crypto::{generate_id, generate_secret, hash_secret, secret_prefix};
use crate::engine::{DecisionEngine, EngineError, Verdict};
use crate::governor::{Bucket, Governor, RetryAfter};
use crate::ledger::{AuditLedger, LedgerError, LogQuery, NewEntry};
use crate::metrics::AppMetrics;
use crate::proto::*;
use crate::reports::Reports;
use crate::revocation::RevocationSet;
use crate::store::{Store, StoreError};
use crate::token::TokenService;
use crate::webhook::Notifier;

pub const SERVICE_NAME: &str = "AgentGuard";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct AppState {
    pub settings: Settings,
    pub store: Arc<Store>,
    pub ledger: Arc<AuditLedger>,
    pub approvals: Arc<ApprovalQueue>,
    pub tokens: Arc<TokenService>,
    pub revocations: Arc<RevocationSet>,
    pub gate: AuthGate,
    pub engine: DecisionEngine,
    pub governor: Governor,
    pub reports: Reports,
    pub metrics: Arc<AppMetrics>,
    pub started_at: Instant,
}

impl AppState {
    pub fn build(settings: Settings, signing_key: SigningKey) -> Result<Arc<Self>, LedgerError> {
        let store = Arc::new(Store::new());
        let ledger = Arc::new(AuditLedger::new(&settings.audit_wal_path)?);
        let notifier = Arc::new(Notifier::new(
            settings.webhook_url.clone(),
            settings.webhook_secret.clone(),
            settings.request_timeout,
        ));
        let approvals = Arc::new(ApprovalQueue::new(store.clone(), notifier));
        let tokens = Arc::new(TokenService::new(
            signing_key,
            settings.jwt_agent_expire_seconds,
            settings.jwt_admin_expire_seconds,
        ));
        let revocations = Arc::new(RevocationSet::new());
        let gate = AuthGate::new(
            store.clone(),
            tokens.clone(),
            revocations.clone(),
            settings.admin_api_key.clone(),
        );
        let engine = DecisionEngine::new(store.clone(), ledger.clone(), approvals.clone());
        let governor = Governor::new(settings.rate_limit_enabled);
        let reports = Reports::new(store.clone(), ledger.clone());

        Ok(Arc::new(Self {
            settings,
            store,
            ledger,
            approvals,
            tokens,
            revocations,
            gate,
            engine,
            governor,
            reports,
            metrics: Arc::new(AppMetrics::new()),
            started_at: Instant::now(),
        }))
    }

    fn admit(
        &self,
        bucket: Bucket,
        identity: &Identity,
        headers: &HeaderMap,
    ) -> Result<(), ApiError> {
        let key = identity.rate_key(&client_ip(headers));
        self.governor.admit(bucket, &key).map_err(|retry| {
            self.metrics.rate_limited.inc(&[("bucket", bucket.as_str())]);
            ApiError::from(retry)
        })
    }
}

// ---------------------------------------------------------------------------
// Error surface
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    detail: Value,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: Value::String(detail.into()),
            retry_after: None,
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    fn validation(errors: Vec<Value>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            detail: Value::Array(errors),
            retry_after: None,
        }
    }

    fn field_error(field: &str, message: &str) -> Value {
        json!({ "field": field, "message": message })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "detail": self.detail });
        if let Some(retry_after) = self.retry_after {
            body["retry_after"] = json!(retry_after);
        }
        let mut response = (self.status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::Unauthorized => Self::new(StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => {
                Self::new(StatusCode::UNAUTHORIZED, "Invalid or expired token")
            }
            AuthError::AdminRequired => Self::new(StatusCode::FORBIDDEN, "admin token required"),
            AuthError::AgentRequired => Self::new(StatusCode::FORBIDDEN, "agent token required"),
            AuthError::InsufficientRole(_) => Self::new(StatusCode::FORBIDDEN, error.to_string()),
            AuthError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        tracing::error!(%error, "entity store unavailable");
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
    }
}

impl From<LedgerError> for ApiError {
    fn from(error: LedgerError) -> Self {
        tracing::error!(%error, "audit store unavailable");
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "audit unavailable")
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            // the default deny is already audited with result=error
            EngineError::Policy(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "policy unavailable")
            }
            EngineError::Audit(e) => e.into(),
            EngineError::Approval(e) => e.into(),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(error: ApprovalError) -> Self {
        match error {
            ApprovalError::NotFound(id) => Self::not_found(format!("Approval {id} not found")),
            ApprovalError::AlreadyDecided(status) => Self::new(
                StatusCode::CONFLICT,
                format!("Approval is already {}", status.as_str()),
            ),
            ApprovalError::InvalidStatusFilter => Self::validation(vec![ApiError::field_error(
                "status",
                "must be one of: pending, approved, denied",
            )]),
            ApprovalError::Store(e) => e.into(),
        }
    }
}

impl From<RetryAfter> for ApiError {
    fn from(retry: RetryAfter) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            detail: Value::String("Rate limit exceeded. Please try again later.".to_string()),
            retry_after: Some(retry.0),
        }
    }
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

async fn issue_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    state.admit(Bucket::Public, &Identity::Public, &headers)?;

    if let Some(agent_key) = &request.agent_key {
        let secret_hash = hash_secret(agent_key);
        let agent = state
            .store
            .agent_id_for_secret_hash(&secret_hash)?
            .and_then(|id| state.store.get_active_agent(&id).transpose())
            .transpose()?
            .ok_or_else(|| {
                ApiError::new(StatusCode::UNAUTHORIZED, "Invalid or inactive agent key")
            })?;

        let token = state
            .tokens
            .issue_agent(&agent)
            .map_err(|e| internal(&e, "token signing failed"))?;
        tracing::info!(agent_id = %agent.agent_id, "issued agent token");
        return Ok(Json(TokenResponse {
            access_token: token,
            token_type: "bearer",
            expires_in: state.tokens.agent_ttl_secs(),
        }));
    }

    if let Some(admin_key) = &request.admin_key {
        let secret_hash = hash_secret(admin_key);
        if let Some(admin) = state.store.admin_for_secret_hash(&secret_hash)? {
            let token = state
                .tokens
                .issue_admin(&admin.admin_id, admin.role, admin.team.clone())
                .map_err(|e| internal(&e, "token signing failed"))?;
            tracing::info!(admin_id = %admin.admin_id, role = admin.role.as_str(), "issued admin token");
            return Ok(Json(TokenResponse {
                access_token: token,
                token_type: "bearer",
                expires_in: state.tokens.admin_ttl_secs(),
            }));
        }

        // legacy bootstrap key grants the implicit super-admin
        if *admin_key == state.settings.admin_api_key {
            let token = state
                .tokens
                .issue_admin("admin", Role::SuperAdmin, None)
                .map_err(|e| internal(&e, "token signing failed"))?;
            tracing::info!("issued super-admin token via static admin key");
            return Ok(Json(TokenResponse {
                access_token: token,
                token_type: "bearer",
                expires_in: state.tokens.admin_ttl_secs(),
            }));
        }

        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "Invalid admin key"));
    }

    Err(ApiError::validation(vec![ApiError::field_error(
        "agent_key",
        "provide either 'agent_key' or 'admin_key'",
    )]))
}

async fn revoke_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<RevokeResponse>, ApiError> {
    let claims = state.gate.bearer_claims(&headers)?;
    state.revocations.revoke(&claims.jti, claims.expires_at());
    tracing::info!(jti = %claims.jti, sub = %claims.sub, "token revoked");
    Ok(Json(RevokeResponse { revoked: true }))
}

async fn jwks(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.tokens.jwks())
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

async fn create_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<AgentCreateRequest>,
) -> Result<(StatusCode, Json<AgentWithKey>), ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    identity.admin(Role::Admin)?;
    state.admit(Bucket::AdminWrite, &identity, &headers)?;

    let mut errors = Vec::new();
    if request.display_name.trim().is_empty() {
        errors.push(ApiError::field_error("display_name", "must not be empty"));
    }
    if request.owner_team.trim().is_empty() {
        errors.push(ApiError::field_error("owner_team", "must not be empty"));
    }
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }

    let now = Utc::now();
    let agent = Agent {
        agent_id: generate_id("agt_"),
        display_name: request.display_name,
        owner_team: request.owner_team,
        environment: request.environment,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    state.store.insert_agent(agent.clone())?;

    let api_key = generate_secret("agk_");
    state.store.insert_credential(AgentCredential {
        agent_id: agent.agent_id.clone(),
        secret_hash: hash_secret(&api_key),
        secret_prefix: secret_prefix(&api_key),
        is_active: true,
        created_at: now,
    })?;

    tracing::info!(agent_id = %agent.agent_id, team = %agent.owner_team, "agent created");
    Ok((StatusCode::CREATED, Json(AgentWithKey { agent, api_key })))
}

#[derive(Debug, Deserialize)]
struct AgentListQuery {
    environment: Option<Environment>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    100
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AgentListQuery>,
) -> Result<Json<Vec<Agent>>, ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    identity.admin(Role::Auditor)?;
    state.admit(Bucket::AdminRead, &identity, &headers)?;

    let agents = state
        .store
        .list_agents(query.environment, query.limit.min(1000), query.offset)?;
    Ok(Json(agents))
}

async fn get_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    identity.admin(Role::Auditor)?;
    state.admit(Bucket::AdminRead, &identity, &headers)?;

    let agent = state
        .store
        .get_agent(&agent_id)?
        .ok_or_else(|| ApiError::not_found(format!("Agent {agent_id} not found")))?;
    Ok(Json(agent))
}

async fn deactivate_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    identity.admin(Role::Admin)?;
    state.admit(Bucket::AdminWrite, &identity, &headers)?;

    if !state.store.deactivate_agent(&agent_id, Utc::now())? {
        return Err(ApiError::not_found(format!("Agent {agent_id} not found")));
    }
    tracing::info!(%agent_id, "agent deactivated");
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

async fn set_agent_policy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
    Json(document): Json<PolicyDocument>,
) -> Result<Json<AgentPolicy>, ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    identity.admin(Role::Admin)?;
    state.admit(Bucket::AdminWrite, &identity, &headers)?;

    if state.store.get_active_agent(&agent_id)?.is_none() {
        return Err(ApiError::not_found(format!(
            "Agent {agent_id} not found or inactive"
        )));
    }

    let policy = state.store.upsert_agent_policy(&agent_id, document, Utc::now())?;
    tracing::info!(%agent_id, "agent policy set");
    Ok(Json(policy))
}

async fn get_agent_policy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentPolicy>, ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    identity.admin(Role::Auditor)?;
    state.admit(Bucket::AdminRead, &identity, &headers)?;

    if state.store.get_agent(&agent_id)?.is_none() {
        return Err(ApiError::not_found(format!("Agent {agent_id} not found")));
    }
    let policy = state
        .store
        .get_agent_policy(&agent_id)?
        .ok_or_else(|| ApiError::not_found(format!("No policy found for agent {agent_id}")))?;
    Ok(Json(policy))
}

async fn set_team_policy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(team): Path<String>,
    Json(document): Json<PolicyDocument>,
) -> Result<Json<TeamPolicy>, ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    identity.admin(Role::Admin)?;
    state.admit(Bucket::AdminWrite, &identity, &headers)?;

    let policy = state.store.upsert_team_policy(&team, document, Utc::now())?;
    tracing::info!(%team, "team policy set");
    Ok(Json(policy))
}

async fn get_team_policy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(team): Path<String>,
) -> Result<Json<TeamPolicy>, ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    identity.admin(Role::Auditor)?;
    state.admit(Bucket::AdminRead, &identity, &headers)?;

    let policy = state
        .store
        .get_team_policy(&team)?
        .ok_or_else(|| ApiError::not_found(format!("No policy set for team '{team}'")))?;
    Ok(Json(policy))
}

// ---------------------------------------------------------------------------
// Admin users
// ---------------------------------------------------------------------------

async fn create_admin_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<AdminUserCreateRequest>,
) -> Result<(StatusCode, Json<AdminUserWithKey>), ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    identity.admin(Role::Admin)?;
    state.admit(Bucket::AdminWrite, &identity, &headers)?;

    if request.display_name.trim().is_empty() {
        return Err(ApiError::validation(vec![ApiError::field_error(
            "display_name",
            "must not be empty",
        )]));
    }

    let api_key = generate_secret("adk_");
    let now = Utc::now();
    let admin = AdminUser {
        admin_id: generate_id("adm_"),
        display_name: request.display_name,
        role: request.role,
        team: request.team,
        credential_hash: hash_secret(&api_key),
        credential_prefix: secret_prefix(&api_key),
        is_active: true,
        created_at: now,
    };
    state.store.insert_admin(admin.clone())?;

    tracing::info!(admin_id = %admin.admin_id, role = admin.role.as_str(), "admin user created");
    Ok((
        StatusCode::CREATED,
        Json(AdminUserWithKey {
            admin_id: admin.admin_id,
            display_name: admin.display_name,
            role: admin.role,
            team: admin.team,
            is_active: admin.is_active,
            created_at: admin.created_at,
            api_key,
        }),
    ))
}

async fn list_admin_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>, ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    identity.admin(Role::Auditor)?;
    state.admit(Bucket::AdminRead, &identity, &headers)?;

    let admins = state.store.list_admins()?;
    // credential hashes stay server-side
    Ok(Json(
        admins
            .into_iter()
            .map(|a| {
                json!({
                    "admin_id": a.admin_id,
                    "display_name": a.display_name,
                    "role": a.role,
                    "team": a.team,
                    "credential_prefix": a.credential_prefix,
                    "is_active": a.is_active,
                    "created_at": a.created_at,
                })
            })
            .collect(),
    ))
}

async fn deactivate_admin_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(admin_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    identity.admin(Role::Admin)?;
    state.admit(Bucket::AdminWrite, &identity, &headers)?;

    if !state.store.deactivate_admin(&admin_id)? {
        return Err(ApiError::not_found(format!("Admin user {admin_id} not found")));
    }
    tracing::info!(%admin_id, "admin user deactivated");
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Enforcement
// ---------------------------------------------------------------------------

async fn enforce(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<EnforceRequest>,
) -> Result<Json<EnforceResponse>, ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    let agent = identity.agent()?.clone();
    state.admit(Bucket::Enforce, &identity, &headers)?;

    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let verdict = state.engine.decide(&agent, &request, request_id)?;

    let (label, response) = match verdict {
        Verdict::Allow { reason } => (
            "allow",
            EnforceResponse {
                allowed: true,
                reason: Some(reason),
                status: None,
                approval_id: None,
            },
        ),
        Verdict::Deny { reason } => (
            "deny",
            EnforceResponse {
                allowed: false,
                reason: Some(reason),
                status: None,
                approval_id: None,
            },
        ),
        Verdict::Pending { approval_id } => (
            "pending",
            EnforceResponse {
                allowed: false,
                reason: None,
                status: Some("pending"),
                approval_id: Some(approval_id),
            },
        ),
    };
    state.metrics.decisions.inc(&[("verdict", label)]);

    tracing::info!(
        agent_id = %agent.agent_id,
        action = %request.action,
        verdict = label,
        "enforcement decision"
    );
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// Audit logs
// ---------------------------------------------------------------------------

async fn submit_log(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<AuditSubmitRequest>,
) -> Result<(StatusCode, Json<AuditEntry>), ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    let agent = identity.agent()?.clone();
    state.admit(Bucket::Logs, &identity, &headers)?;

    let entry = state.ledger.append(NewEntry {
        agent_id: agent.agent_id,
        action: request.action,
        resource: request.resource,
        context: request.context,
        allowed: request.allowed,
        result: request.result,
        metadata: request.metadata,
        request_id: request.request_id,
    })?;
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    agent_id: Option<String>,
    action: Option<String>,
    allowed: Option<bool>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

async fn query_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let identity = state.gate.authenticate(&headers)?;

    // agents only ever see their own chain; admins pick any agent
    let agent_id = match &identity {
        Identity::Agent(agent) => {
            state.admit(Bucket::Logs, &identity, &headers)?;
            Some(agent.agent_id.clone())
        }
        Identity::Admin(_) => {
            identity.admin(Role::Auditor)?;
            state.admit(Bucket::AdminRead, &identity, &headers)?;
            query.agent_id.clone()
        }
        Identity::Public => return Err(AuthError::Unauthorized.into()),
    };

    let entries = state.ledger.query(&LogQuery {
        agent_id,
        action: query.action,
        allowed: query.allowed,
        start_time: query.start_time,
        end_time: query.end_time,
        limit: query.limit.min(1000),
        offset: query.offset,
    });
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    agent_id: Option<String>,
}

async fn verify_chain(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<VerifyQuery>,
) -> Result<Json<ChainVerifyResponse>, ApiError> {
    let identity = state.gate.authenticate(&headers)?;

    let agent_id = match &identity {
        Identity::Agent(agent) => {
            state.admit(Bucket::Logs, &identity, &headers)?;
            agent.agent_id.clone()
        }
        Identity::Admin(_) => {
            identity.admin(Role::Auditor)?;
            state.admit(Bucket::AdminRead, &identity, &headers)?;
            query.agent_id.clone().ok_or_else(|| {
                ApiError::validation(vec![ApiError::field_error(
                    "agent_id",
                    "required for admin verification",
                )])
            })?
        }
        Identity::Public => return Err(AuthError::Unauthorized.into()),
    };

    let verification = state.ledger.verify_chain(&agent_id)?;
    Ok(Json(ChainVerifyResponse {
        agent_id,
        valid: verification.valid,
        total_entries: verification.total_entries,
        broken_at: verification.broken_at,
    }))
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApprovalsQuery {
    status: Option<String>,
    agent_id: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

async fn list_approvals(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ApprovalsQuery>,
) -> Result<Json<ApprovalListResponse>, ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    let admin = identity.admin(Role::Auditor)?.clone();
    state.admit(Bucket::AdminRead, &identity, &headers)?;

    let listing = state.approvals.list(
        query.status.as_deref(),
        query.agent_id.as_deref(),
        admin.team.as_deref(),
        query.limit.clamp(1, 500),
        query.offset,
    )?;
    Ok(Json(listing))
}

async fn get_approval(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(approval_id): Path<String>,
) -> Result<Json<ApprovalView>, ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    let approval = state.approvals.get(&approval_id)?;

    // agents poll their own requests; team-scoped admins stay inside their team
    match &identity {
        Identity::Agent(agent) => {
            state.admit(Bucket::Public, &identity, &headers)?;
            if approval.agent_id != agent.agent_id {
                return Err(ApiError::not_found(format!("Approval {approval_id} not found")));
            }
        }
        Identity::Admin(admin) => {
            state.admit(Bucket::AdminRead, &identity, &headers)?;
            if let Some(team) = &admin.team {
                let owner = state.store.get_agent(&approval.agent_id)?;
                if owner.map(|a| a.owner_team != *team).unwrap_or(true) {
                    return Err(ApiError::not_found(format!("Approval {approval_id} not found")));
                }
            }
        }
        Identity::Public => return Err(AuthError::Unauthorized.into()),
    }

    let agent_name = state
        .store
        .get_agent(&approval.agent_id)?
        .map(|a| a.display_name);
    Ok(Json(ApprovalView {
        approval,
        agent_name,
    }))
}

async fn decide_approval(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((approval_id, decision)): Path<(String, String)>,
    Json(request): Json<ApprovalDecisionRequest>,
) -> Result<Json<ApprovalView>, ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    let admin = identity.admin(Role::Approver)?.clone();
    state.admit(Bucket::AdminWrite, &identity, &headers)?;

    let status = match decision.as_str() {
        "approve" => ApprovalStatus::Approved,
        "deny" => ApprovalStatus::Denied,
        _ => return Err(ApiError::not_found("not found")),
    };

    let approval = state
        .approvals
        .decide(&approval_id, status, &admin.admin_id, request.reason)?;
    state
        .metrics
        .approvals
        .inc(&[("decision", approval.status.as_str())]);

    let agent_name = state
        .store
        .get_agent(&approval.agent_id)?
        .map(|a| a.display_name);
    Ok(Json(ApprovalView {
        approval,
        agent_name,
    }))
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ReportQuery {
    #[serde(default = "default_report_days")]
    days: u32,
}

fn default_report_days() -> u32 {
    30
}

async fn report_summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ReportQuery>,
) -> Result<Json<SummaryReport>, ApiError> {
    let identity = state.gate.authenticate(&headers)?;
    let admin = identity.admin(Role::Auditor)?.clone();
    state.admit(Bucket::AdminRead, &identity, &headers)?;

    if !(1..=365).contains(&query.days) {
        return Err(ApiError::validation(vec![ApiError::field_error(
            "days",
            "must be between 1 and 365",
        )]));
    }

    let report = state
        .reports
        .summary(admin.team.as_deref(), query.days, Utc::now())?;
    Ok(Json(report))
}

// ---------------------------------------------------------------------------
// Health & metrics
// ---------------------------------------------------------------------------

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        version: VERSION,
        timestamp: Utc::now(),
    })
}

async fn health_ready(State(state): State<Arc<AppState>>) -> Response {
    let store_ok = state.store.ping().is_ok();
    let ledger_ok = state.ledger.ping().is_ok();

    let body = json!({
        "status": if store_ok && ledger_ok { "ready" } else { "unhealthy" },
        "checks": { "store": store_ok, "audit_log": ledger_ok },
        "timestamp": Utc::now(),
    });
    let status = if store_ok && ledger_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn health_live(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "alive",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

async fn track_requests(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().as_str().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    state.metrics.http_requests.inc(&[
        ("route", &route),
        ("method", &method),
        ("status", response.status().as_str()),
    ]);
    state
        .metrics
        .request_duration
        .observe(&[("route", &route)], start.elapsed());
    response
}

fn internal(error: &dyn std::fmt::Display, context: &str) -> ApiError {
    tracing::error!(%error, "{context}");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

/// Routing table. Auth class and rate bucket per route are enforced inside
/// each handler; this is the single place the surface is declared.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/token", post(issue_token))
        .route("/token/revoke", post(revoke_token))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/agents", post(create_agent).get(list_agents))
        .route("/agents/{agent_id}", get(get_agent).delete(deactivate_agent))
        .route(
            "/agents/{agent_id}/policy",
            put(set_agent_policy).get(get_agent_policy),
        )
        .route(
            "/teams/{team}/policy",
            put(set_team_policy).get(get_team_policy),
        )
        .route("/admin/users", post(create_admin_user).get(list_admin_users))
        .route("/admin/users/{admin_id}", delete(deactivate_admin_user))
        .route("/enforce", post(enforce))
        .route("/logs", post(submit_log).get(query_logs))
        .route("/logs/verify", get(verify_chain))
        .route("/reports/summary", get(report_summary))
        .route("/approvals", get(list_approvals))
        .route("/approvals/{approval_id}", get(get_approval))
        .route("/approvals/{approval_id}/{decision}", post(decide_approval))
        .route("/health", get(health))
        .route("/health/ready", get(health_ready))
        .route("/health/live", get(health_live))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

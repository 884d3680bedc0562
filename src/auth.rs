//! Inbound authentication gate.
//!
//! Every protected request resolves to an `Identity` from either a bearer
//! token or a legacy static-key header, bearer first when both are present.
//! Token failures collapse to one uniform error; the concrete reason is
//! logged, never returned.

use std::sync::Arc;

use axum::http::HeaderMap;
use thiserror::Error;

use crate::crypto::hash_secret;
use crate::proto::{Agent, Role};
use crate::revocation::RevocationSet;
use crate::store::{Store, StoreError};
use crate::token::{Claims, TokenService, TokenType};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("admin token required")]
    AdminRequired,
    #[error("agent token required")]
    AgentRequired,
    #[error("{} role or higher required", .0.as_str())]
    InsufficientRole(Role),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct AdminIdentity {
    pub admin_id: String,
    pub role: Role,
    /// None spans all teams.
    pub team: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Identity {
    Agent(Agent),
    Admin(AdminIdentity),
    Public,
}

impl Identity {
    pub fn agent(&self) -> Result<&Agent, AuthError> {
        match self {
            Identity::Agent(agent) => Ok(agent),
            Identity::Admin(_) => Err(AuthError::AgentRequired),
            Identity::Public => Err(AuthError::Unauthorized),
        }
    }

    pub fn admin(&self, min_role: Role) -> Result<&AdminIdentity, AuthError> {
        match self {
            Identity::Admin(admin) if admin.role.at_least(min_role) => Ok(admin),
            Identity::Admin(_) => Err(AuthError::InsufficientRole(min_role)),
            Identity::Agent(_) => Err(AuthError::AdminRequired),
            Identity::Public => Err(AuthError::Unauthorized),
        }
    }

    /// Identity key used by the rate limiter.
    pub fn rate_key(&self, client_ip: &str) -> String {
        match self {
            Identity::Agent(agent) => format!("agent:{}", agent.agent_id),
            Identity::Admin(admin) => format!("admin:{}", admin.admin_id),
            Identity::Public => format!("ip:{client_ip}"),
        }
    }
}

pub struct AuthGate {
    store: Arc<Store>,
    tokens: Arc<TokenService>,
    revocations: Arc<RevocationSet>,
    admin_api_key: String,
}

impl AuthGate {
    pub fn new(
        store: Arc<Store>,
        tokens: Arc<TokenService>,
        revocations: Arc<RevocationSet>,
        admin_api_key: String,
    ) -> Self {
        Self {
            store,
            tokens,
            revocations,
            admin_api_key,
        }
    }

    /// Resolve the caller. Requests carrying no credentials resolve to
    /// `Identity::Public`; handlers decide whether that is enough.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        if bearer_token(headers).is_some() {
            let claims = self.bearer_claims(headers)?;
            return self.identity_from_claims(claims);
        }

        if let Some(admin_key) = header_value(headers, "x-admin-key") {
            if admin_key == self.admin_api_key {
                return Ok(Identity::Admin(AdminIdentity {
                    admin_id: "admin".to_string(),
                    role: Role::SuperAdmin,
                    team: None,
                }));
            }
            tracing::debug!("x-admin-key does not match the configured admin key");
            return Err(AuthError::Unauthorized);
        }

        if let Some(agent_key) = header_value(headers, "x-agent-key") {
            let secret_hash = hash_secret(agent_key);
            let Some(agent_id) = self.store.agent_id_for_secret_hash(&secret_hash)? else {
                tracing::debug!("x-agent-key does not match any active credential");
                return Err(AuthError::Unauthorized);
            };
            return match self.store.get_active_agent(&agent_id)? {
                Some(agent) => Ok(Identity::Agent(agent)),
                None => {
                    tracing::debug!(%agent_id, "credential maps to an inactive agent");
                    Err(AuthError::Unauthorized)
                }
            };
        }

        Ok(Identity::Public)
    }

    /// Verify the bearer token on this request: signature, expiry, then the
    /// revocation set. Used directly by `/token/revoke`, which needs the
    /// claims themselves.
    pub fn bearer_claims(&self, headers: &HeaderMap) -> Result<Claims, AuthError> {
        let token = bearer_token(headers).ok_or(AuthError::Unauthorized)?;
        let claims = self.tokens.verify(token).map_err(|error| {
            tracing::debug!(%error, "token verification failed");
            AuthError::InvalidToken
        })?;
        if self.revocations.is_revoked(&claims.jti) {
            tracing::debug!(jti = %claims.jti, "token has been revoked");
            return Err(AuthError::InvalidToken);
        }
        Ok(claims)
    }

    fn identity_from_claims(&self, claims: Claims) -> Result<Identity, AuthError> {
        match claims.token_type {
            TokenType::Agent => match self.store.get_active_agent(&claims.sub)? {
                Some(agent) => Ok(Identity::Agent(agent)),
                None => {
                    tracing::debug!(sub = %claims.sub, "agent token for unknown or inactive agent");
                    Err(AuthError::InvalidToken)
                }
            },
            TokenType::Admin => {
                let Some(role) = claims.role else {
                    tracing::debug!(sub = %claims.sub, "admin token missing role claim");
                    return Err(AuthError::InvalidToken);
                };
                Ok(Identity::Admin(AdminIdentity {
                    admin_id: claims.sub,
                    role,
                    team: claims.team,
                }))
            }
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_value(headers, "authorization")?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

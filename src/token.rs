//! Bearer token issue and verification.
//!
//! Tokens are three unpadded base64url segments `header.payload.signature`.
//! The header pins `{"alg":"EdDSA","typ":"JWT"}`; the Ed25519 signature
//! covers the ASCII bytes of `header.payload`. Verification checks the
//! signature first, then expiry; revocation and endpoint-class checks
//! belong to the auth gate.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{b64url_decode, b64url_encode, verifying_key_to_b64url, CryptoError};
use crate::proto::{Agent, Role};

pub const ALGORITHM: &str = "EdDSA";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("signature mismatch")]
    Signature,
    #[error("token expired")]
    Expired,
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Agent,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

pub struct TokenService {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    agent_ttl_secs: u64,
    admin_ttl_secs: u64,
}

impl TokenService {
    pub fn new(signing_key: SigningKey, agent_ttl_secs: u64, admin_ttl_secs: u64) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
            agent_ttl_secs,
            admin_ttl_secs,
        }
    }

    pub fn agent_ttl_secs(&self) -> u64 {
        self.agent_ttl_secs
    }

    pub fn admin_ttl_secs(&self) -> u64 {
        self.admin_ttl_secs
    }

    pub fn issue_agent(&self, agent: &Agent) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        self.sign(Claims {
            sub: agent.agent_id.clone(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.agent_ttl_secs as i64,
            token_type: TokenType::Agent,
            env: Some(agent.environment.as_str().to_string()),
            team: Some(agent.owner_team.clone()),
            role: None,
        })
    }

    pub fn issue_admin(
        &self,
        subject: &str,
        role: Role,
        team: Option<String>,
    ) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        self.sign(Claims {
            sub: subject.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.admin_ttl_secs as i64,
            token_type: TokenType::Admin,
            env: None,
            team,
            role: Some(role),
        })
    }

    fn sign(&self, claims: Claims) -> Result<String, TokenError> {
        let header = Header {
            alg: ALGORITHM.to_string(),
            typ: "JWT".to_string(),
        };
        let signing_input = format!(
            "{}.{}",
            b64url_encode(&serde_json::to_vec(&header)?),
            b64url_encode(&serde_json::to_vec(&claims)?),
        );
        let sig = self.signing_key.sign(signing_input.as_bytes());
        Ok(format!("{signing_input}.{}", b64url_encode(&sig.to_bytes())))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        let mut segments = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(TokenError::Malformed);
        };

        let header: Header =
            serde_json::from_slice(&b64url_decode(header_b64)?).map_err(|_| TokenError::Malformed)?;
        if header.alg != ALGORITHM {
            return Err(TokenError::UnsupportedAlgorithm(header.alg));
        }

        let sig_bytes: [u8; 64] = b64url_decode(sig_b64)?
            .try_into()
            .map_err(|_| TokenError::Malformed)?;
        let signature = Signature::from_bytes(&sig_bytes);

        let signing_input = format!("{header_b64}.{payload_b64}");
        self.verifying_key
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|_| TokenError::Signature)?;

        let claims: Claims = serde_json::from_slice(&b64url_decode(payload_b64)?)
            .map_err(|_| TokenError::Malformed)?;

        if claims.exp < now.timestamp() {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    /// Public verification key set for third-party token verification.
    pub fn jwks(&self) -> serde_json::Value {
        serde_json::json!({
            "keys": [{
                "kty": "OKP",
                "crv": "Ed25519",
                "use": "sig",
                "alg": ALGORITHM,
                "x": verifying_key_to_b64url(&self.verifying_key),
            }]
        })
    }
}

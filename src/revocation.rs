//! Revoked-token set.
//!
//! Revocations live until the token's natural expiry has passed, after which
//! a background sweep may reclaim them. Revoking the same jti twice keeps
//! the original revocation instant.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::proto::RevokedToken;

#[derive(Default)]
pub struct RevocationSet {
    revoked: DashMap<String, RevokedToken>,
}

impl RevocationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: a second revoke of the same jti is a no-op.
    pub fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) {
        self.revoked
            .entry(jti.to_string())
            .or_insert_with(|| RevokedToken {
                jti: jti.to_string(),
                revoked_at: Utc::now(),
                expires_at,
            });
    }

    pub fn is_revoked(&self, jti: &str) -> bool {
        self.revoked.contains_key(jti)
    }

    pub fn len(&self) -> usize {
        self.revoked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }

    /// Drop entries whose natural expiry passed more than `grace` ago.
    /// Returns the number of entries removed.
    pub fn sweep(&self, now: DateTime<Utc>, grace: Duration) -> usize {
        let before = self.revoked.len();
        self.revoked.retain(|_, t| t.expires_at + grace >= now);
        before - self.revoked.len()
    }
}

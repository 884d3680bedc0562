//! Request admission: fixed-window rate limiting per identity and bucket.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Named rate-limit buckets with their fixed limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Enforce,
    Logs,
    AdminWrite,
    AdminRead,
    Public,
}

impl Bucket {
    pub fn limit(self) -> u32 {
        match self {
            Bucket::Enforce => 1000,
            Bucket::Logs => 1000,
            Bucket::AdminWrite => 50,
            Bucket::AdminRead => 200,
            Bucket::Public => 100,
        }
    }

    /// Window length in seconds.
    pub fn window_secs(self) -> i64 {
        match self {
            Bucket::Enforce | Bucket::Logs | Bucket::Public => 60,
            Bucket::AdminWrite | Bucket::AdminRead => 3600,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::Enforce => "enforce",
            Bucket::Logs => "logs",
            Bucket::AdminWrite => "admin-write",
            Bucket::AdminRead => "admin-read",
            Bucket::Public => "public",
        }
    }
}

/// Seconds until the current window rolls over and the caller may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAfter(pub u64);

#[derive(Debug)]
struct Window {
    started_at: i64,
    count: u32,
}

/// Fixed-window counters over a shared in-process store, keyed by
/// `(bucket, identity)`. Production deployments point the counter store at
/// a networked backend; the interface is the same.
pub struct Governor {
    enabled: bool,
    windows: DashMap<(Bucket, String), Window>,
}

impl Governor {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            windows: DashMap::new(),
        }
    }

    pub fn admit(&self, bucket: Bucket, identity: &str) -> Result<(), RetryAfter> {
        self.admit_at(bucket, identity, Utc::now())
    }

    pub fn admit_at(
        &self,
        bucket: Bucket,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RetryAfter> {
        if !self.enabled {
            return Ok(());
        }

        let now_secs = now.timestamp();
        let mut window = self
            .windows
            .entry((bucket, identity.to_string()))
            .or_insert_with(|| Window {
                started_at: now_secs,
                count: 0,
            });

        let elapsed = now_secs - window.started_at;
        if elapsed >= bucket.window_secs() {
            window.started_at = now_secs;
            window.count = 0;
        }

        if window.count >= bucket.limit() {
            let remaining = (bucket.window_secs() - (now_secs - window.started_at)).max(1);
            return Err(RetryAfter(remaining as u64));
        }

        window.count += 1;
        Ok(())
    }
}

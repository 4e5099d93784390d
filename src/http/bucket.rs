use crate::http::request::RestResponse;

/// Rate-limit headers, as the server emits them.
pub mod header {
    pub const LIMIT: &str = "X-RateLimit-Limit";
    pub const REMAINING: &str = "X-RateLimit-Remaining";
    /// Epoch seconds when the window refills.
    pub const RESET: &str = "X-RateLimit-Reset";
    /// Server-assigned bucket id coalescing routes that share a quota.
    pub const BUCKET: &str = "X-RateLimit-Bucket";
    /// On 429 only: `global` or `bucket`.
    pub const SCOPE: &str = "X-RateLimit-Scope";
    pub const RETRY_AFTER: &str = "Retry-After";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Global,
    PerResource,
}

/// Server-advertised rate-limit scope for one or more routes.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub limit: u64,
    pub remaining: u64,
    /// Epoch seconds.
    pub reset_at: i64,
    /// Requests currently held back waiting on this bucket.
    pub queue_size: usize,
    /// Inferred before any server confirmation.
    pub assumed: bool,
    /// Superseded by a different server bucket id; kept only so stale
    /// readers see why it stopped admitting traffic.
    pub deleted: bool,
}

impl Bucket {
    /// A bucket assumed to exist before the server has confirmed it:
    /// admits one request so the first response can teach us the truth.
    pub fn assumed() -> Self {
        Self {
            limit: 1,
            remaining: 1,
            reset_at: 0,
            queue_size: 0,
            assumed: true,
            deleted: false,
        }
    }

    pub fn can_accept(&self, now_epoch: i64) -> bool {
        if self.deleted {
            return false;
        }
        self.remaining > 0 || self.reset_at <= now_epoch
    }

    /// Account for a request about to be sent.
    pub fn acquire(&mut self, now_epoch: i64) {
        if self.reset_at <= now_epoch {
            // window rolled over since the last response refreshed us
            self.remaining = self.limit.saturating_sub(1);
        } else {
            self.remaining = self.remaining.saturating_sub(1);
        }
    }

    /// Overwrite from response headers. Headers are authoritative on every
    /// response for a rate-limited route, success or failure.
    pub fn apply(&mut self, update: &BucketUpdate) {
        self.limit = update.limit;
        self.remaining = update.remaining;
        self.reset_at = update.reset_at;
        self.assumed = false;
    }
}

/// Parsed rate-limit headers from one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketUpdate {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: i64,
    pub bucket_id: Option<String>,
}

/// Extract bucket state from a response. Returns `None` when the route is
/// not rate limited (no limit header).
pub fn parse_update(response: &RestResponse) -> Option<BucketUpdate> {
    let limit = response.header_value(header::LIMIT)?.parse().ok()?;
    let remaining = response
        .header_value(header::REMAINING)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let reset_at = response
        .header_value(header::RESET)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let bucket_id = response.header_value(header::BUCKET).map(str::to_string);
    Some(BucketUpdate {
        limit,
        remaining,
        reset_at,
        bucket_id,
    })
}

/// Scope of a 429 response. Absent header means per-resource.
pub fn parse_scope(response: &RestResponse) -> RateLimitScope {
    match response.header_value(header::SCOPE) {
        Some(scope) if scope.eq_ignore_ascii_case("global") => RateLimitScope::Global,
        _ => RateLimitScope::PerResource,
    }
}

/// Seconds the server asked us to wait, defaulting to one.
pub fn parse_retry_after(response: &RestResponse) -> u64 {
    response
        .header_value(header::RETRY_AFTER)
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

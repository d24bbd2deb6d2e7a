pub const PROTOCOL_CACHE_STATUS_KEY: &str = "X-Cache";

/// How a request was answered. Sent back as `X-Cache` and written to the access log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the store.
    Hit,
    /// Led a fill from the origin.
    Miss,
    /// Waited on another request's fill.
    Coalesced,
    /// Not cacheable; forwarded as-is.
    Pass,
    /// Answered with a locally generated error.
    Error,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Coalesced => "COALESCED",
            CacheStatus::Pass => "PASS",
            CacheStatus::Error => "ERROR",
        }
    }
}

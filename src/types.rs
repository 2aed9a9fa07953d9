use serde::{Deserialize, Serialize};

// Canonical rate-limit snapshot shared across the upstream, relay and HTTP
// layers. A `None` field means the upstream did not report that value on the
// response this snapshot was built from.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct RateLimitInfo {
    pub model: Option<String>,
    pub remaining_requests: Option<u64>,
    pub remaining_tokens: Option<u64>,
    pub reset_timestamp: Option<f64>,
}

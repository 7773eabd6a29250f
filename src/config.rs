use serde::Deserialize;
use std::time::Duration;

/// Tuning knobs for an [`EventLoop`](crate::EventLoop).
///
/// Every field has a default, so a partial document deserializes fine:
///
/// ```
/// use deferred::LoopConfig;
/// let config: LoopConfig = serde_json::from_str(r#"{ "microtask_budget": 64 }"#).unwrap();
/// assert_eq!(config.microtask_budget, Some(64));
/// assert_eq!(config.park_timeout_ms, None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Upper bound on the microtasks run by a single checkpoint. `None` is unlimited.
    pub microtask_budget: Option<usize>,
    /// How long `block_on` parks waiting for a wake from another thread.
    pub park_timeout_ms: Option<u64>,
}

impl LoopConfig {
    pub fn park_timeout(&self) -> Option<Duration> {
        self.park_timeout_ms.map(Duration::from_millis)
    }
}

//! Communicator configuration: an idempotent wrapper around an
//! external side effect, recorded by output only — never co-committed with
//! UDB effects.

use crate::reliability::RetryPolicy;

#[derive(Debug, Clone)]
pub struct CommunicatorOptions {
    pub name: String,
    pub retry_policy: RetryPolicy,
}

impl CommunicatorOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry_policy: RetryPolicy::exponential(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// `retriesAllowed=false`: run exactly once.
    pub fn without_retries(mut self) -> Self {
        self.retry_policy = RetryPolicy::no_retry();
        self
    }
}

//! Delivery of rendered messages with bounded retry.

use std::{fmt, thread, time::Duration};

use log::{debug, error, info, warn};

use crate::{
    address::RoutingTarget,
    telegram::{SendMessage, SendMessageRequest, TelegramApi},
};

/// Exponential backoff bounded by attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of calls, the first one included. Never less than 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the `attempt`-th failed call (1-based): `base * 2^(attempt - 1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// Wait before the next call, honouring a server-requested delay within the cap.
    pub fn wait(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.backoff(attempt);
        match retry_after {
            Some(requested) => backoff.max(requested).min(self.max_delay),
            None => backoff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Delivered,
    RejectedAddress,
    RejectedDomain,
    TransientFailure,
    PermanentFailure,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::RejectedAddress => "rejected-address",
            DeliveryStatus::RejectedDomain => "rejected-domain",
            DeliveryStatus::TransientFailure => "transient-failure",
            DeliveryStatus::PermanentFailure => "permanent-failure",
        }
    }
}

/// Result of delivering (or refusing to deliver) one recipient's copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub status: DeliveryStatus,
    pub detail: String,
}

impl DeliveryOutcome {
    pub fn new(status: DeliveryStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn delivered(detail: impl Into<String>) -> Self {
        Self::new(DeliveryStatus::Delivered, detail)
    }

    pub fn rejected_address(detail: impl Into<String>) -> Self {
        Self::new(DeliveryStatus::RejectedAddress, detail)
    }

    pub fn rejected_domain(detail: impl Into<String>) -> Self {
        Self::new(DeliveryStatus::RejectedDomain, detail)
    }

    pub fn transient_failure(detail: impl Into<String>) -> Self {
        Self::new(DeliveryStatus::TransientFailure, detail)
    }

    pub fn permanent_failure(detail: impl Into<String>) -> Self {
        Self::new(DeliveryStatus::PermanentFailure, detail)
    }

    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }

    pub fn is_transient(&self) -> bool {
        self.status == DeliveryStatus::TransientFailure
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status.as_str(), self.detail)
    }
}

/// Sends one text to one target, retrying transient failures per [`RetryPolicy`].
#[derive(Debug)]
pub struct DeliveryClient<A = TelegramApi> {
    api: A,
    policy: RetryPolicy,
}

impl<A: SendMessage> DeliveryClient<A> {
    pub fn new(api: A, policy: RetryPolicy) -> Self {
        Self { api, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn send(&self, target: &RoutingTarget, text: &str) -> DeliveryOutcome {
        let request = SendMessageRequest::new(target, text);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!("[smtp2tg] sendMessage to {target}, attempt {attempt}/{max_attempts}");

            let err = match self.api.send_message(&request) {
                Ok(()) => {
                    info!("[smtp2tg] Telegram message sent to {target}");
                    return DeliveryOutcome::delivered(format!("delivered to {target}"));
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                error!("[smtp2tg] Telegram refused message for {target}: {err}");
                return DeliveryOutcome::permanent_failure(err.to_string());
            }

            if attempt >= max_attempts {
                warn!("[smtp2tg] Giving up on {target} after {attempt} attempts: {err}");
                return DeliveryOutcome::transient_failure(format!(
                    "{err} (gave up after {attempt} attempts)"
                ));
            }

            let wait = self.policy.wait(attempt, err.retry_after());
            warn!("[smtp2tg] Telegram error for {target}: {err}; retrying in {wait:?}");
            thread::sleep(wait);
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;
    use crate::{address::Flag, telegram::ApiError};

    fn no_wait(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_wait_honours_retry_after_within_cap() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(
            policy.wait(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.wait(1, Some(Duration::from_secs(60))),
            Duration::from_secs(5)
        );
        assert_eq!(policy.wait(2, None), Duration::from_millis(200));
    }

    #[test]
    fn test_delivered_first_try() {
        let calls = Mutex::new(Vec::new());
        let api = |req: &SendMessageRequest| -> Result<(), ApiError> {
            calls.lock().unwrap().push(req.clone());
            Ok(())
        };
        let client = DeliveryClient::new(&api, no_wait(3));

        let target = RoutingTarget::new(123).with_flag(Flag::Silent);
        let outcome = client.send(&target, "text");

        assert!(outcome.is_delivered());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].disable_notification);
    }

    #[test]
    fn test_rate_limit_retries_exactly_max_attempts() {
        let count = AtomicU32::new(0);
        let api = |_: &SendMessageRequest| -> Result<(), ApiError> {
            count.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::from_code(429, "Too Many Requests", Some(1)))
        };
        let client = DeliveryClient::new(&api, no_wait(3));

        let outcome = client.send(&RoutingTarget::new(1), "text");

        assert_eq!(outcome.status, DeliveryStatus::TransientFailure);
        assert!(outcome.detail.contains("3 attempts"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_chat_not_found_is_not_retried() {
        let count = AtomicU32::new(0);
        let api = |_: &SendMessageRequest| -> Result<(), ApiError> {
            count.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::from_code(400, "Bad Request: chat not found", None))
        };
        let client = DeliveryClient::new(&api, no_wait(3));

        let outcome = client.send(&RoutingTarget::new(1), "text");

        assert_eq!(outcome.status, DeliveryStatus::PermanentFailure);
        assert!(outcome.detail.contains("chat not found"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recovers_after_transient_failure() {
        let count = AtomicU32::new(0);
        let api = |_: &SendMessageRequest| -> Result<(), ApiError> {
            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ApiError::Network("connection refused".into()))
            } else {
                Ok(())
            }
        };
        let client = DeliveryClient::new(&api, no_wait(3));

        assert!(client.send(&RoutingTarget::new(1), "text").is_delivered());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_attempts_still_calls_once() {
        let count = AtomicU32::new(0);
        let api = |_: &SendMessageRequest| -> Result<(), ApiError> {
            count.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::from_code(503, "Service Unavailable", None))
        };
        let client = DeliveryClient::new(&api, no_wait(0));

        assert!(client.send(&RoutingTarget::new(1), "text").is_transient());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

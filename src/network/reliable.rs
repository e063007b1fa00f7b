use std::sync::Arc;
use std::time::Duration;

use super::transport::{DeliveryError, Endpoint, Transport};

#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    pub attempts: u32,
    pub retry_delay: Duration,
    pub ack_timeout: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(3),
        }
    }
}

/// A successful delivery: how many attempts it took and the acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub attempts: u32,
    pub reply: String,
}

/// Send-with-acknowledgement-and-retry over any `Transport`.
pub struct ReliableDelivery {
    transport: Arc<dyn Transport>,
    policy: DeliveryPolicy,
}

impl ReliableDelivery {
    pub fn new(transport: Arc<dyn Transport>, policy: DeliveryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Retries until an `OK…`/`ACK…` reply arrives or attempts run out.
    /// A final failure is returned to the caller.
    pub async fn send_critical(
        &self,
        target: &Endpoint,
        message: &str,
    ) -> Result<Delivery, DeliveryError> {
        let attempts = self.policy.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self
                .transport
                .exchange(target, message, self.policy.ack_timeout)
                .await
            {
                Ok(reply) if is_ack(&reply) => {
                    tracing::debug!(
                        "Delivered to {} on attempt {}/{}: {}",
                        target,
                        attempt,
                        attempts,
                        reply
                    );
                    return Ok(Delivery { attempts: attempt, reply });
                }
                Ok(reply) => {
                    last_error = DeliveryError::Nack(reply).to_string();
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            tracing::debug!(
                "Attempt {}/{} to {} failed: {}",
                attempt,
                attempts,
                target,
                last_error
            );

            if attempt < attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        tracing::error!(
            "Critical message to {} failed after {} attempts: {}",
            target,
            attempts,
            last_error
        );
        Err(DeliveryError::Exhausted {
            attempts,
            last: last_error,
        })
    }

    /// Single attempt; failure is only logged.
    pub async fn send_best_effort(&self, target: &Endpoint, message: &str) -> bool {
        match self
            .transport
            .exchange(target, message, self.policy.ack_timeout)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Best-effort send to {} failed: {}", target, e);
                false
            }
        }
    }
}

pub fn is_ack(reply: &str) -> bool {
    reply.starts_with("OK") || reply.starts_with("ACK")
}

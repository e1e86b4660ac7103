//! Byte-budget flow control for streamed responses.
//!
//! A [`FlowLimiter`] hands out [`FlowCredit`] for every message before it is
//! submitted. Credit is returned when the receiver has accepted the message
//! (the credit is dropped). Once the budget is exhausted, [`FlowLimiter::reserve`]
//! suspends until enough credit comes back.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::FederationError;

/// Fixed in-flight byte budget shared by everything sent on one stream.
#[derive(Debug, Clone)]
pub struct FlowLimiter {
    budget: u32,
    credit: Arc<Semaphore>,
}

/// Bytes of in-flight credit. Dropping it returns the credit.
#[derive(Debug)]
pub struct FlowCredit {
    bytes: u32,
    _permit: OwnedSemaphorePermit,
}

impl FlowCredit {
    pub fn bytes(&self) -> u32 {
        self.bytes
    }
}

impl FlowLimiter {
    pub fn new(budget: u32) -> Self {
        let budget = budget.max(1);
        Self { budget, credit: Arc::new(Semaphore::new(budget as usize)) }
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Credit currently available.
    pub fn available(&self) -> usize {
        self.credit.available_permits()
    }

    /// Wait for `size` bytes of credit.
    ///
    /// A message larger than the whole budget takes the whole budget, so it
    /// is sent alone instead of waiting forever.
    pub async fn reserve(&self, size: u64) -> Result<FlowCredit, FederationError> {
        let bytes = size.clamp(1, u64::from(self.budget)) as u32;
        let permit = self
            .credit
            .clone()
            .acquire_many_owned(bytes)
            .await
            .map_err(|_| FederationError::StreamAborted("flow limiter closed".into()))?;
        Ok(FlowCredit { bytes, _permit: permit })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn credit_returns_on_drop() {
        let limiter = FlowLimiter::new(100);
        let credit = limiter.reserve(60).await.unwrap();
        assert_eq!(credit.bytes(), 60);
        assert_eq!(limiter.available(), 40);
        drop(credit);
        assert_eq!(limiter.available(), 100);
    }

    #[tokio::test]
    async fn exhausted_budget_suspends_until_credit_returns() {
        let limiter = FlowLimiter::new(100);
        let held = limiter.reserve(80).await.unwrap();

        let waiting = limiter.reserve(50);
        tokio::pin!(waiting);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut waiting).await.is_err(),
            "should suspend while only 20 bytes are free"
        );

        drop(held);
        let credit = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("credit came back")
            .unwrap();
        assert_eq!(credit.bytes(), 50);
    }

    #[tokio::test]
    async fn oversized_message_takes_whole_budget() {
        let limiter = FlowLimiter::new(64);
        let credit = limiter.reserve(10_000).await.unwrap();
        assert_eq!(credit.bytes(), 64);
        assert_eq!(limiter.available(), 0);
    }
}

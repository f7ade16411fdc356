//! Concurrency and rate limits for embedding API calls.
//!
//! - **ConcurrencyLimiter**: counting semaphore bounding in-flight sub-batches
//!   across every `enrich` call sharing the processor
//! - **RateGate**: optional requests-per-second ceiling applied before each attempt

use crate::error::EnrichError;
use crate::metrics;
use crate::shutdown::cancelled;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

/// Bounds the number of sub-batch calls active at any instant.
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held slot. Dropping it releases the slot.
pub struct LimiterPermit {
    permit: Option<OwnedSemaphorePermit>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        drop(self.permit.take());
        metrics::set_in_flight(
            self.capacity
                .saturating_sub(self.semaphore.available_permits()),
        );
    }
}

impl ConcurrencyLimiter {
    /// Create a limiter with `capacity` slots (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    ///
    /// Returns `Cancelled` if shutdown is requested first or the limiter
    /// has been closed.
    pub async fn acquire(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<LimiterPermit, EnrichError> {
        let semaphore = Arc::clone(&self.semaphore);
        let permit = tokio::select! {
            biased;
            _ = cancelled(shutdown) => return Err(EnrichError::Cancelled),
            permit = semaphore.acquire_owned() => permit.map_err(|_| EnrichError::Cancelled)?,
        };

        metrics::set_in_flight(self.in_flight());
        Ok(LimiterPermit {
            permit: Some(permit),
            semaphore: Arc::clone(&self.semaphore),
            capacity: self.capacity,
        })
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Tear down: pending and future acquires fail with `Cancelled`
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

/// Requests-per-second ceiling for API calls.
pub struct RateGate {
    limiter: DefaultDirectRateLimiter,
}

impl RateGate {
    pub fn per_second(rps: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::direct(Quota::per_second(rps)),
        }
    }

    /// Wait until a call may be made, or fail with `Cancelled`
    pub async fn ready(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), EnrichError> {
        tokio::select! {
            biased;
            _ = cancelled(shutdown) => Err(EnrichError::Cancelled),
            _ = self.limiter.until_ready() => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let limiter = ConcurrencyLimiter::new(2);
        let (_tx, mut rx) = watch::channel(false);

        let first = limiter.acquire(&mut rx).await.unwrap();
        let second = limiter.acquire(&mut rx).await.unwrap();
        assert_eq!(limiter.in_flight(), 2);
        assert_eq!(limiter.available(), 0);

        drop(first);
        assert_eq!(limiter.available(), 1);
        drop(second);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_raised_to_one() {
        let limiter = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.capacity(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_blocks_until_release() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        let (_tx, mut rx) = watch::channel(false);

        let held = limiter.acquire(&mut rx).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let mut rx = rx.clone();
            tokio::spawn(async move { limiter.acquire(&mut rx).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_acquire_cancelled_while_waiting() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        let (tx, mut rx) = watch::channel(false);

        let _held = limiter.acquire(&mut rx).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let mut rx = rx.clone();
            tokio::spawn(async move { limiter.acquire(&mut rx).await.map(|_| ()) })
        };

        tx.send(true).unwrap();
        let result = waiter.await.unwrap();
        assert_eq!(result, Err(EnrichError::Cancelled));
        // The cancelled waiter never held a slot.
        assert_eq!(limiter.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_closed_limiter_rejects() {
        let limiter = ConcurrencyLimiter::new(3);
        let (_tx, mut rx) = watch::channel(false);

        limiter.close();
        assert!(limiter.is_closed());
        assert!(matches!(
            limiter.acquire(&mut rx).await,
            Err(EnrichError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_rate_gate_allows_burst() {
        let gate = RateGate::per_second(NonZeroU32::new(100).unwrap());
        let (_tx, mut rx) = watch::channel(false);

        for _ in 0..5 {
            gate.ready(&mut rx).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_rate_gate_cancelled() {
        let gate = RateGate::per_second(NonZeroU32::new(1).unwrap());
        let (tx, mut rx) = watch::channel(false);

        gate.ready(&mut rx).await.unwrap();
        tx.send(true).unwrap();
        assert_eq!(gate.ready(&mut rx).await, Err(EnrichError::Cancelled));
    }
}

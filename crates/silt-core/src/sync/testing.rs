//! Instrumented fake transport shared by engine and scheduler tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::transport::{DeliveryOutcome, IngestTransport, RecordSubmission, TransportError};

pub(crate) enum FakeBehavior {
    Accept,
    Reject(u16),
    Conflict,
    /// Fail deliveries carrying this fingerprint, accept the rest
    FailHash(String),
}

pub(crate) struct FakeTransport {
    behavior: FakeBehavior,
    healthy: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delivered: Mutex<Vec<RecordSubmission>>,
    hold: Duration,
}

impl FakeTransport {
    pub(crate) fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            healthy: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
            hold: Duration::ZERO,
        }
    }

    /// Keep each delivery in flight for the given duration
    pub(crate) fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn delivered(&self) -> Vec<RecordSubmission> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl IngestTransport for FakeTransport {
    async fn deliver(
        &self,
        submission: &RecordSubmission,
    ) -> Result<DeliveryOutcome, TransportError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.delivered.lock().unwrap().push(submission.clone());

        match &self.behavior {
            FakeBehavior::Accept => Ok(DeliveryOutcome::Accepted),
            FakeBehavior::Reject(status) => Ok(DeliveryOutcome::Rejected {
                status: *status,
                body: "simulated server error".to_string(),
            }),
            FakeBehavior::Conflict => Ok(DeliveryOutcome::AlreadyExists),
            FakeBehavior::FailHash(hash) => {
                if submission.content_hash == *hash {
                    Err(TransportError::Unreachable(
                        "simulated connection reset".to_string(),
                    ))
                } else {
                    Ok(DeliveryOutcome::Accepted)
                }
            }
        }
    }

    async fn probe_health(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

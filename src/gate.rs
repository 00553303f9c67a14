//! Startup gate.
//!
//! Blocks a dependent service until every certificate it needs is published
//! and valid. The deadline is fixed when the wait starts and the last sleep
//! is clamped to it, so a timeout fires neither early nor late.

use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::trust::{CertSubject, Readiness};
use crate::{Error, Result};

/// Wait until `readiness` reports every subject in `required` ready.
///
/// # Errors
///
/// - `Error::CertificateTimeout` listing the subjects still missing once
///   `timeout` has elapsed
/// - `Error::Shutdown` if `cancel` fires first
pub async fn wait_for_certificates<R>(
    readiness: &R,
    required: &[CertSubject],
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: Readiness + ?Sized,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let missing: Vec<&CertSubject> = required
            .iter()
            .filter(|subject| !readiness.is_ready(subject))
            .collect();

        if missing.is_empty() {
            info!(
                subjects = required.len(),
                attempts,
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Trust material ready"
            );
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            let missing: Vec<String> = missing.iter().map(ToString::to_string).collect();
            warn!(
                missing = %missing.join(", "),
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Gave up waiting for trust material"
            );
            return Err(Error::CertificateTimeout { missing, timeout });
        }

        debug!(missing = missing.len(), attempts, "Waiting for trust material");
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Shutdown),
            () = sleep_until((now + poll_interval).min(deadline)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::Role;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Readiness backed by an in-memory set.
    #[derive(Default)]
    struct FakeStore(Mutex<HashSet<CertSubject>>);

    impl FakeStore {
        fn mark(&self, subject: &CertSubject) {
            self.0.lock().insert(subject.clone());
        }
    }

    impl Readiness for FakeStore {
        fn is_ready(&self, subject: &CertSubject) -> bool {
            self.0.lock().contains(subject)
        }
    }

    fn subjects() -> Vec<CertSubject> {
        vec![
            CertSubject::new("admin-router", Role::Server),
            CertSubject::new("admin-router", Role::Client),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn returns_immediately_when_everything_is_ready() {
        let store = FakeStore::default();
        for s in subjects() {
            store.mark(&s);
        }
        let start = Instant::now();
        wait_for_certificates(
            &store,
            &subjects(),
            Duration::from_secs(10),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_exactly_the_deadline() {
        // GIVEN: a store that never becomes ready and a poll interval that
        // does not divide the timeout
        let store = FakeStore::default();
        let start = Instant::now();

        // WHEN: waiting
        let err = wait_for_certificates(
            &store,
            &subjects(),
            Duration::from_millis(2500),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        // THEN: it fails after exactly the timeout, naming what is missing
        assert_eq!(start.elapsed(), Duration::from_millis(2500));
        match err {
            Error::CertificateTimeout { missing, timeout } => {
                assert_eq!(missing, vec!["admin-router:server", "admin-router:client"]);
                assert_eq!(timeout, Duration::from_millis(2500));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_returns_shutdown() {
        let store = FakeStore::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = wait_for_certificates(
            &store,
            &subjects(),
            Duration::from_secs(60),
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }
}

//! Health polling until a fingerprint match or timeout.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::probe::Probe;

/// Interval between consecutive health probes.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Probes `url` at a fixed interval until the fingerprint matches, the
/// timeout elapses, or `cancel` fires.
///
/// This is the only blocking primitive in the core and is always invoked
/// with a finite timeout. A timeout is a routine outcome, not an error:
/// the caller keeps the service registered and proceeds optimistically.
pub async fn poll_until_match<P: Probe>(
    prober: &P,
    url: &str,
    fingerprint: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        if prober.probe(url, fingerprint).await {
            info!("{} is healthy", url);
            return true;
        }

        if cancel.is_cancelled() {
            debug!("health poll for {} cancelled", url);
            return false;
        }

        let now = Instant::now();
        if now >= deadline {
            debug!("health poll for {} timed out", url);
            return false;
        }

        let wait = POLL_INTERVAL.min(deadline - now);
        tokio::select! {
            _ = sleep(wait) => {}
            _ = cancel.cancelled() => {
                debug!("health poll for {} cancelled", url);
                return false;
            }
        }
    }
}

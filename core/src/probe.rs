//! HTTP fingerprint probing.
//!
//! A port answering HTTP is not enough to identify a service: an unrelated
//! process can occupy a default port (a database on the port the backend
//! would use, for instance). A probe therefore only reports a match when
//! the response is successful *and* the body carries the expected
//! fingerprint substring.

use std::time::Duration;

use tracing::{debug, trace};

use crate::error::Result;

/// Default per-request probe timeout.
///
/// Deliberately short and distinct from the overall health-poll budget so
/// one unresponsive port cannot stall a scan of the whole range.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Trait for fingerprint probing.
///
/// The allocator, health poller, and orchestrator are generic over this
/// seam so tests can inject recording/scripted implementations.
pub trait Probe: Send + Sync {
    /// Returns true only if a healthy, correct service answers at `url`.
    ///
    /// Any network error, non-success status, or fingerprint mismatch
    /// yields false; this never fails.
    fn probe(
        &self,
        url: &str,
        fingerprint: &str,
    ) -> impl std::future::Future<Output = bool> + Send;
}

/// Prober issuing bounded-timeout HTTP GET requests.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    /// Create a prober with the default per-request timeout.
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_PROBE_TIMEOUT)
    }

    /// Create a prober with a custom per-request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl Probe for HttpProber {
    async fn probe(&self, url: &str, fingerprint: &str) -> bool {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                trace!("probe {}: {}", url, e);
                return false;
            }
        };

        if !response.status().is_success() {
            debug!("probe {}: status {}", url, response.status());
            return false;
        }

        match response.text().await {
            Ok(body) => {
                let matched = body
                    .to_lowercase()
                    .contains(&fingerprint.to_lowercase());
                if !matched {
                    debug!("probe {}: responder does not match fingerprint", url);
                }
                matched
            }
            Err(e) => {
                trace!("probe {}: failed to read body: {}", url, e);
                false
            }
        }
    }
}

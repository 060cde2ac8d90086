//! Port neighborhood scanning and free-port discovery.
//!
//! Two independent operations back the orchestrator's "discover before
//! launch" policy: scanning nearby ports for a fingerprint match (a service
//! that shifted because its default port was taken), and finding a free
//! port to launch a new instance on.

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::probe::Probe;

/// Default number of ports scanned above the base port.
pub const DEFAULT_SCAN_RANGE: u16 = 10;

/// Scans the base port's neighborhood for a fingerprint match.
///
/// Probes `base_port - 1` first, then ascending from `base_port + 1`
/// through `base_port + range`. The base port itself is skipped (the
/// caller has already checked it) and ports outside 1..=65535 are
/// clamped away. Checking one below first finds the common case of a
/// service that shifted down a single slot quickly.
pub async fn scan_for_fingerprint<P: Probe>(
    prober: &P,
    base_port: u16,
    range: u16,
    fingerprint: &str,
) -> Option<u16> {
    for port in neighborhood(base_port, range) {
        let url = format!("http://127.0.0.1:{}/", port);
        if prober.probe(&url, fingerprint).await {
            info!("found matching service on port {}", port);
            return Some(port);
        }
    }

    debug!(
        "no matching service within {} ports of {}",
        range, base_port
    );
    None
}

/// Candidate ports for [`scan_for_fingerprint`], in probe order.
fn neighborhood(base_port: u16, range: u16) -> Vec<u16> {
    let mut ports = Vec::with_capacity(range as usize + 1);
    if base_port > 1 {
        ports.push(base_port - 1);
    }
    for offset in 1..=range {
        match base_port.checked_add(offset) {
            Some(port) => ports.push(port),
            None => break,
        }
    }
    ports
}

/// Finds the first port in `base_port ..= base_port + range` with no
/// active TCP listener.
///
/// A port counts as free when a loopback listener can be bound to it; the
/// listener is released immediately. This is inherently racy against
/// concurrent allocators; the caller is expected to serialize
/// reconfiguration requests.
pub async fn find_free_port(base_port: u16, range: u16) -> Option<u16> {
    let base_port = base_port.max(1);
    for offset in 0..=range {
        let port = match base_port.checked_add(offset) {
            Some(port) => port,
            None => break,
        };
        if port_is_free(port).await {
            debug!("port {} is free", port);
            return Some(port);
        }
    }

    debug!("no free port in {}..={}", base_port, base_port as u32 + range as u32);
    None
}

async fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Prober that records every probed URL and answers from a fixed list.
    struct RecordingProber {
        healthy: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingProber {
        fn new(healthy: &[&str]) -> Self {
            Self {
                healthy: healthy.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl Probe for RecordingProber {
        async fn probe(&self, url: &str, _fingerprint: &str) -> bool {
            self.calls.lock().push(url.to_string());
            self.healthy.iter().any(|h| h == url)
        }
    }

    #[tokio::test]
    async fn test_scan_checks_one_below_first_then_ascending() {
        let prober = RecordingProber::new(&[]);
        scan_for_fingerprint(&prober, 8000, 3, "x").await;

        assert_eq!(
            prober.calls(),
            vec![
                "http://127.0.0.1:7999/",
                "http://127.0.0.1:8001/",
                "http://127.0.0.1:8002/",
                "http://127.0.0.1:8003/",
            ]
        );
    }

    #[tokio::test]
    async fn test_scan_never_probes_base_port() {
        let prober = RecordingProber::new(&[]);
        scan_for_fingerprint(&prober, 11434, 10, "x").await;

        assert!(!prober
            .calls()
            .iter()
            .any(|url| url.contains(":11434/")));
    }

    #[tokio::test]
    async fn test_scan_finds_shifted_service() {
        let prober = RecordingProber::new(&["http://127.0.0.1:8001/"]);
        let found = scan_for_fingerprint(&prober, 8000, 10, "x").await;

        assert_eq!(found, Some(8001));
        // Stops at the first match: 7999 then 8001.
        assert_eq!(prober.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_scan_clamps_to_valid_port_range() {
        let prober = RecordingProber::new(&[]);
        scan_for_fingerprint(&prober, 65534, 10, "x").await;

        // 65533 below, then only 65535 above.
        assert_eq!(
            prober.calls(),
            vec!["http://127.0.0.1:65533/", "http://127.0.0.1:65535/"]
        );

        let prober = RecordingProber::new(&[]);
        scan_for_fingerprint(&prober, 1, 2, "x").await;
        // Nothing below port 1.
        assert_eq!(
            prober.calls(),
            vec!["http://127.0.0.1:2/", "http://127.0.0.1:3/"]
        );
    }

    #[tokio::test]
    async fn test_find_free_port_skips_occupied() {
        // Occupy an OS-assigned port, then ask for a free one starting there.
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = occupied.local_addr().unwrap().port();

        let found = find_free_port(base, 20).await.unwrap();
        assert_ne!(found, base);

        // The returned port really is bindable at this instant.
        let claim = TcpListener::bind(("127.0.0.1", found)).await;
        assert!(claim.is_ok());
    }

    #[tokio::test]
    async fn test_find_free_port_returns_base_when_free() {
        // Grab a port the OS considers free, release it, and expect the
        // allocator to hand back the base itself.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = listener.local_addr().unwrap().port();
        drop(listener);

        assert_eq!(find_free_port(base, 10).await, Some(base));
    }
}

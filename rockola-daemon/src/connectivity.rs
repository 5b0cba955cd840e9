use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ConnectivityConfig;

/// Suppresses connectivity flapping.
///
/// A level is only reported once it has held for the whole window, and two
/// reported transitions are never closer together than the window.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    reported: bool,
    candidate: Option<(bool, Instant)>,
    last_transition: Option<Instant>,
}

impl Debouncer {
    pub fn new(initial: bool, window: Duration) -> Self {
        Self {
            window,
            reported: initial,
            candidate: None,
            last_transition: None,
        }
    }

    pub fn reported(&self) -> bool {
        self.reported
    }

    /// A level different from the reported one is waiting out the window.
    pub fn is_pending(&self) -> bool {
        self.candidate.is_some()
    }

    /// Feed a raw observation. Returns the new level when a transition is due.
    pub fn observe(&mut self, online: bool, now: Instant) -> Option<bool> {
        if online == self.reported {
            self.candidate = None;
            return None;
        }

        let since = match self.candidate {
            Some((level, since)) if level == online => since,
            _ => {
                self.candidate = Some((online, now));
                now
            }
        };

        let held = now.saturating_duration_since(since) >= self.window;
        let spaced = self
            .last_transition
            .map_or(true, |t| now.saturating_duration_since(t) >= self.window);

        if held && spaced {
            self.reported = online;
            self.candidate = None;
            self.last_transition = Some(now);
            Some(online)
        } else {
            None
        }
    }
}

/// Periodically probes an HTTP endpoint and reports debounced reachability.
///
/// Any HTTP response counts as online; only transport failures and timeouts
/// count as offline.
pub struct ConnectivityMonitor {
    client: reqwest::Client,
    probe_url: String,
    config: ConnectivityConfig,
}

impl ConnectivityMonitor {
    pub fn new(probe_url: impl Into<String>, config: ConnectivityConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()?;
        Ok(Self {
            client,
            probe_url: probe_url.into(),
            config,
        })
    }

    async fn probe(&self) -> bool {
        match self.client.get(&self.probe_url).send().await {
            Ok(resp) => {
                debug!("[NET] Probe {} -> {}", self.probe_url, resp.status());
                true
            }
            Err(e) => {
                debug!("[NET] Probe {} failed: {}", self.probe_url, e);
                false
            }
        }
    }

    /// Probe until cancelled, sending each debounced transition on `tx`.
    /// The controller starts out assuming it is online.
    pub async fn run(self, tx: mpsc::Sender<bool>, cancel: CancellationToken) {
        let mut debouncer = Debouncer::new(true, self.config.debounce);
        info!(
            "[NET] Monitoring {} every {:?} (debounce {:?})",
            self.probe_url, self.config.probe_interval, self.config.debounce
        );

        loop {
            let online = tokio::select! {
                _ = cancel.cancelled() => break,
                online = self.probe() => online,
            };

            if let Some(level) = debouncer.observe(online, Instant::now()) {
                info!("[NET] Connectivity {}", if level { "restored" } else { "lost" });
                if tx.send(level).await.is_err() {
                    break;
                }
            }

            // Re-probe sooner while a change is waiting to be confirmed
            let wait = if debouncer.is_pending() {
                self.config.debounce.min(self.config.probe_interval)
            } else {
                self.config.probe_interval
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("[NET] Connectivity monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const WINDOW: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn steady_level_reports_nothing() {
        let mut d = Debouncer::new(true, WINDOW);
        let t0 = Instant::now();
        for i in 0..10 {
            assert_eq!(d.observe(true, t0 + Duration::from_millis(i * 300)), None);
        }
        assert!(d.reported());
    }

    #[tokio::test(start_paused = true)]
    async fn change_is_reported_after_holding_for_window() {
        let mut d = Debouncer::new(true, WINDOW);
        let t0 = Instant::now();

        assert_eq!(d.observe(false, t0), None);
        assert!(d.is_pending());
        assert_eq!(d.observe(false, t0 + Duration::from_millis(500)), None);
        assert_eq!(d.observe(false, t0 + WINDOW), Some(false));
        assert!(!d.reported());
        assert!(!d.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn brief_blip_is_suppressed() {
        let mut d = Debouncer::new(true, WINDOW);
        let t0 = Instant::now();

        assert_eq!(d.observe(false, t0), None);
        assert_eq!(d.observe(true, t0 + Duration::from_millis(400)), None);
        assert!(!d.is_pending());
        assert_eq!(d.observe(false, t0 + Duration::from_millis(900)), None);
        // The candidate restarted at 900ms
        assert_eq!(d.observe(false, t0 + Duration::from_millis(1500)), None);
        assert_eq!(d.observe(false, t0 + Duration::from_millis(1900)), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_flapping_yields_few_transitions() {
        let mut d = Debouncer::new(true, WINDOW);
        let t0 = Instant::now();
        let mut transitions = 0;

        // Alternate every 200ms for 10s
        for i in 0..50u64 {
            if d.observe(i % 2 == 1, t0 + Duration::from_millis(i * 200)).is_some() {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 0);
        assert!(d.reported());
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_are_spaced_by_window() {
        let mut d = Debouncer::new(true, Duration::from_secs(2));
        let t0 = Instant::now();

        d.observe(false, t0);
        assert_eq!(d.observe(false, t0 + Duration::from_secs(2)), Some(false));

        // Back online, and held long enough on its own
        d.observe(true, t0 + Duration::from_secs(2));
        assert_eq!(d.observe(true, t0 + Duration::from_secs(3)), None);
        assert_eq!(d.observe(true, t0 + Duration::from_secs(4)), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_stops_on_cancel() {
        let config = ConnectivityConfig {
            probe_url: None,
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(100),
            debounce: WINDOW,
        };
        // Port 9 on localhost refuses connections
        let monitor = ConnectivityMonitor::new("http://127.0.0.1:9/", config).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        monitor.run(tx, cancel).await;
        assert!(rx.recv().await.is_none());
    }

    /// HTTP endpoint that answers while `up` is set and drops connections otherwise.
    async fn switchable_endpoint() -> (String, Arc<AtomicBool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/health", listener.local_addr().unwrap());
        let up = Arc::new(AtomicBool::new(true));
        let serving = up.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                if !serving.load(Ordering::SeqCst) {
                    continue;
                }
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !String::from_utf8_lossy(&buf).contains("\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let _ = stream
                    .write_all(b"HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });
        (url, up)
    }

    #[tokio::test]
    async fn monitor_reports_loss_and_recovery() {
        let (url, up) = switchable_endpoint().await;
        let debounce = Duration::from_millis(150);
        let config = ConnectivityConfig {
            probe_url: None,
            probe_interval: Duration::from_millis(20),
            probe_timeout: Duration::from_secs(1),
            debounce,
        };
        let monitor = ConnectivityMonitor::new(url, config).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor.run(tx, cancel.clone()));

        // Reachable from the start, nothing to report
        assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv()).await.is_err());

        up.store(false, Ordering::SeqCst);
        let lost_at = Instant::now();
        let level = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(level, Some(false));
        assert!(lost_at.elapsed() >= debounce);

        up.store(true, Ordering::SeqCst);
        let restored_at = Instant::now();
        let level = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(level, Some(true));
        assert!(restored_at.elapsed() >= debounce);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn brief_outage_is_not_reported() {
        let (url, up) = switchable_endpoint().await;
        let config = ConnectivityConfig {
            probe_url: None,
            probe_interval: Duration::from_millis(20),
            probe_timeout: Duration::from_secs(1),
            debounce: Duration::from_secs(2),
        };
        let monitor = ConnectivityMonitor::new(url, config).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor.run(tx, cancel.clone()));

        up.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        up.store(true, Ordering::SeqCst);
        assert!(tokio::time::timeout(Duration::from_millis(500), rx.recv()).await.is_err());

        cancel.cancel();
        task.await.unwrap();
    }
}

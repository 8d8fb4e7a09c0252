//! Statistics pusher: periodically pushes the metrics snapshot to one or more
//! push gateways. Push failures are counted and logged, never propagated; a
//! dead gateway must not slow ingestion down.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StatisticsConfig;
use crate::error::{Error, Result};
use crate::metrics::SinkerMetrics;

const PUSH_JOB: &str = "sinker";

const PUSH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const STOP_GRACE: Duration = Duration::from_secs(2);

pub(crate) struct Pusher {
    addrs: Vec<String>,
    interval: Duration,
    client: reqwest::Client,
    metrics: Arc<SinkerMetrics>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Pusher {
    pub(crate) fn new(
        config: &StatisticsConfig,
        metrics: Arc<SinkerMetrics>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PUSH_REQUEST_TIMEOUT)
            .build()
            .map_err(|err| Error::Metrics(format!("Building push client: {err}")))?;
        Ok(Pusher {
            addrs: config.push_gateway_addrs.clone(),
            interval: config.push_interval(),
            client,
            metrics,
            cancel,
            handle: None,
        })
    }

    /// Starts the push loop. One push per interval plus a final one at
    /// shutdown, so the gateway sees the closing counter values.
    pub(crate) fn run(&mut self) {
        let addrs = self.addrs.clone();
        let interval = self.interval;
        let client = self.client.clone();
        let metrics = Arc::clone(&self.metrics);
        let cancel = self.cancel.clone();

        info!(?addrs, ?interval, "Statistics pusher running");
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the first push
            // carries a full interval of data.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => push_once(&client, &addrs, &metrics).await,
                }
            }
            push_once(&client, &addrs, &metrics).await;
        }));
    }

    pub(crate) async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!("Statistics pusher did not stop in time");
            }
        }
    }
}

async fn push_once(client: &reqwest::Client, addrs: &[String], metrics: &SinkerMetrics) {
    let snapshot = match metrics.encode_snapshot() {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(%err, "Failed to encode the statistics snapshot");
            return;
        }
    };

    for addr in addrs {
        let url = format!("{addr}/metrics/job/{PUSH_JOB}");
        let result = client
            .put(&url)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(snapshot.clone())
            .send()
            .await;
        let failure = match result {
            Ok(response) if response.status().is_success() => None,
            Ok(response) => Some(format!("HTTP {}", response.status())),
            Err(err) => Some(err.to_string()),
        };
        if let Some(reason) = failure {
            warn!(addr, reason, "Statistics push failed");
            metrics
                .push_error_total
                .get_or_create(&push_labels(addr))
                .inc();
        }
    }
}

fn push_labels(addr: &str) -> Vec<(String, String)> {
    vec![("addr".to_string(), addr.to_string())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_gateway_is_counted_not_fatal() {
        let metrics = Arc::new(SinkerMetrics::new());
        let config = StatisticsConfig {
            enable: true,
            push_gateway_addrs: vec!["http://127.0.0.1:1".to_string()],
            push_interval_secs: 1,
        };
        let mut pusher = Pusher::new(&config, Arc::clone(&metrics), CancellationToken::new()).unwrap();
        pusher.run();
        // Stopping triggers the final push even before the first tick.
        pusher.stop().await;

        let errors = metrics
            .push_error_total
            .get_or_create(&push_labels("http://127.0.0.1:1"))
            .get();
        assert!(errors >= 1);
    }

    #[tokio::test]
    async fn snapshot_push_body_is_the_encoded_registry() {
        let metrics = SinkerMetrics::new();
        let snapshot = metrics.encode_snapshot().unwrap();
        assert!(snapshot.contains("# EOF"));
    }
}

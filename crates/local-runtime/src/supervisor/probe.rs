//! Readiness probes for launched workers.

use std::time::Duration;

use regex::Regex;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::debug;

/// Per-request cap so one hung GET cannot eat the whole readiness budget.
const HTTP_PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProbeOutcome {
    Ready,
    TimedOut,
    /// The worker died first. Carries its exit status.
    Exited(String),
}

/// Poll `url` until it answers 2xx.
///
/// `exited` is consulted between attempts and short-circuits the probe when
/// the worker has already gone away.
pub(crate) async fn http(
    client: &reqwest::Client,
    url: &str,
    interval: Duration,
    deadline: Instant,
    mut exited: impl FnMut() -> Option<String>,
) -> ProbeOutcome {
    let mut attempt = 0u32;
    loop {
        if let Some(status) = exited() {
            return ProbeOutcome::Exited(status);
        }
        attempt += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return ProbeOutcome::TimedOut;
        }
        let request = client
            .get(url)
            .timeout(remaining.min(HTTP_PROBE_REQUEST_TIMEOUT))
            .send();
        match request.await {
            Ok(resp) if resp.status().is_success() => {
                debug!("Readiness probe {} succeeded after {} attempt(s)", url, attempt);
                return ProbeOutcome::Ready;
            }
            Ok(resp) => debug!("Readiness probe {} returned {}", url, resp.status()),
            Err(e) => debug!("Readiness probe {} failed: {}", url, e),
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return ProbeOutcome::TimedOut;
        }
        sleep(interval.min(remaining)).await;
    }
}

/// Scan worker output until a line matches `pattern`.
pub(crate) async fn log_regex(
    pattern: &Regex,
    lines: &mut broadcast::Receiver<String>,
    interval: Duration,
    deadline: Instant,
    mut exited: impl FnMut() -> Option<String>,
) -> ProbeOutcome {
    let scan = async {
        loop {
            tokio::select! {
                line = lines.recv() => match line {
                    Ok(line) if pattern.is_match(&line) => return ProbeOutcome::Ready,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Readiness scan skipped {} log line(s)", skipped);
                    }
                    // Both output pipes closed: only the exit status is left to report.
                    Err(broadcast::error::RecvError::Closed) => loop {
                        if let Some(status) = exited() {
                            return ProbeOutcome::Exited(status);
                        }
                        sleep(interval).await;
                    },
                },
                _ = sleep(interval) => {
                    if let Some(status) = exited() {
                        return ProbeOutcome::Exited(status);
                    }
                }
            }
        }
    };
    timeout_at(deadline, scan)
        .await
        .unwrap_or(ProbeOutcome::TimedOut)
}

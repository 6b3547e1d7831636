//! Operations to drive through the scheduler from the CLI
//!
//! A simulated operation (a jittered sleep that fails on demand) and an HTTP
//! GET. Both are plain futures; the scheduler decides when they start.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("Simulated failure of operation {0}")]
    Simulated(usize),

    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}")]
    Status { url: String, status: u16 },
}

/// Outcome of a simulated operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Simulated {
    pub index: usize,
    pub took: Duration,
}

/// Whether operation `index` (1-based) should fail
pub fn should_fail(index: usize, fail_every: Option<usize>) -> bool {
    match fail_every {
        Some(k) if k > 0 => index % k == 0,
        _ => false,
    }
}

/// Lane for operation `index` (1-based), round-robin over `lanes`
pub fn lane_for_index(index: usize, lanes: &[String]) -> Option<String> {
    if lanes.is_empty() {
        return None;
    }
    lanes.get(index.saturating_sub(1) % lanes.len()).cloned()
}

/// Sleep for `base` plus up to 50% jitter, then succeed or fail
pub fn simulate(
    index: usize,
    base: Duration,
    fail_every: Option<usize>,
) -> impl Future<Output = Result<Simulated, WorkloadError>> + Send + 'static {
    let jitter_ms = base.as_millis() as u64 / 2;
    let took = base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
    let fail = should_fail(index, fail_every);

    async move {
        debug!(index, ?took, fail, "simulate: started");
        tokio::time::sleep(took).await;
        if fail {
            Err(WorkloadError::Simulated(index))
        } else {
            Ok(Simulated { index, took })
        }
    }
}

/// Outcome of an HTTP fetch
#[derive(Debug, Clone)]
pub struct Fetched {
    pub url: String,
    pub status: u16,
    pub bytes: usize,
    pub took: Duration,
}

/// Lane derived from the URL's host, when per-host serialization is wanted
pub fn lane_for_url(url: &str, per_host: bool) -> Option<String> {
    if !per_host {
        return None;
    }
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// GET `url`; non-success statuses are failures
pub async fn fetch(client: reqwest::Client, url: String) -> Result<Fetched, WorkloadError> {
    debug!(%url, "fetch: called");
    let started = Instant::now();

    let response = client.get(&url).send().await.map_err(|source| WorkloadError::Http {
        url: url.clone(),
        source,
    })?;
    let status = response.status();
    if !status.is_success() {
        return Err(WorkloadError::Status {
            url,
            status: status.as_u16(),
        });
    }

    let body = response.bytes().await.map_err(|source| WorkloadError::Http {
        url: url.clone(),
        source,
    })?;

    Ok(Fetched {
        url,
        status: status.as_u16(),
        bytes: body.len(),
        took: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_fail() {
        let failing: Vec<_> = (1..=9).filter(|i| should_fail(*i, Some(3))).collect();
        assert_eq!(failing, vec![3, 6, 9]);
        assert!(!should_fail(3, None));
        assert!(!should_fail(3, Some(0)));
    }

    #[test]
    fn test_lane_for_index_round_robin() {
        let lanes = vec!["a".to_string(), "b".to_string()];
        let assigned: Vec<_> = (1..=4).map(|i| lane_for_index(i, &lanes)).collect();
        assert_eq!(
            assigned,
            vec![
                Some("a".to_string()),
                Some("b".to_string()),
                Some("a".to_string()),
                Some("b".to_string())
            ]
        );
        assert_eq!(lane_for_index(1, &[]), None);
    }

    #[test]
    fn test_lane_for_url() {
        assert_eq!(
            lane_for_url("https://example.com/a?b=c", true),
            Some("example.com".to_string())
        );
        assert_eq!(lane_for_url("https://example.com/a", false), None);
        assert_eq!(lane_for_url("not a url", true), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulate_duration_and_failure() {
        let ok = simulate(1, Duration::from_millis(100), Some(2)).await.unwrap();
        assert_eq!(ok.index, 1);
        assert!(ok.took >= Duration::from_millis(100));
        assert!(ok.took <= Duration::from_millis(150));

        let err = simulate(2, Duration::from_millis(100), Some(2)).await.unwrap_err();
        assert_eq!(err.to_string(), "Simulated failure of operation 2");
    }
}

//! Remote adapter: delegates to another backtest service speaking the same HTTP contract
//!
//! Submits with `POST /backtest`, then polls `GET /backtest/{id}` at a fixed interval
//! until the remote job is terminal or the attempt budget runs out.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::ExecutionAdapter;
use crate::error::ExecutionError;
use crate::types::{BacktestRequest, JobStatus, PerformanceReport};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
// 5 minutes at the default interval
const DEFAULT_MAX_ATTEMPTS: u32 = 60;

/// Job snapshot as returned by the remote service
#[derive(Debug, Deserialize)]
struct RemoteJob {
    status: JobStatus,
    #[serde(default, alias = "results")]
    result: Option<PerformanceReport>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for a remote backtest service
#[derive(Debug, Clone)]
pub struct RemoteServiceAdapter {
    client: Client,
    base_url: Url,
    poll_interval: Duration,
    max_attempts: u32,
}

impl RemoteServiceAdapter {
    pub fn new(base_url: &str) -> Result<Self, ExecutionError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ExecutionError::Remote(format!("invalid base URL {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ExecutionError::Remote(format!(
                "base URL {base_url} cannot have a path"
            )));
        }
        Ok(Self {
            client: http_client(DEFAULT_REQUEST_TIMEOUT)?,
            base_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    pub fn with_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = interval;
        self.max_attempts = max_attempts;
        self
    }

    /// Bound each submit or poll request; a silent remote counts as a failed attempt
    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self, ExecutionError> {
        self.client = http_client(timeout)?;
        Ok(self)
    }

    /// `<base>/backtest[/<id>]`, with the id escaped as a single path segment
    fn endpoint(&self, id: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("backtest");
            if let Some(id) = id {
                segments.push(id);
            }
        }
        url
    }

    async fn poll(&self, url: &Url) -> Result<RemoteJob, ExecutionError> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(ExecutionError::Remote(format!(
                "poll returned {}",
                response.status()
            )));
        }
        Ok(response.json::<RemoteJob>().await?)
    }
}

fn http_client(timeout: Duration) -> Result<Client, ExecutionError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

#[async_trait]
impl ExecutionAdapter for RemoteServiceAdapter {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn run(&self, request: &BacktestRequest) -> Result<PerformanceReport, ExecutionError> {
        let submit_url = self.endpoint(None);
        info!(job_id = %request.id, url = %submit_url, "Submitting backtest to remote service");

        let response = self.client.post(submit_url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutionError::Remote(format!(
                "submission rejected with {status}: {body}"
            )));
        }

        let poll_url = self.endpoint(Some(&request.id));
        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.poll_interval).await;

            match self.poll(&poll_url).await {
                Ok(job) => match job.status {
                    JobStatus::Completed => {
                        return job.result.ok_or_else(|| {
                            ExecutionError::Remote("completed without a result".to_string())
                        });
                    }
                    JobStatus::Failed => {
                        return Err(ExecutionError::Remote(
                            job.error
                                .unwrap_or_else(|| "remote backtest failed".to_string()),
                        ));
                    }
                    JobStatus::Running => {
                        debug!(job_id = %request.id, attempt, "Remote backtest still running");
                    }
                },
                // Transient poll failures are retried until the budget runs out
                Err(e) => {
                    warn!(job_id = %request.id, attempt, error = %e, "Polling remote backtest failed");
                }
            }
        }

        Err(ExecutionError::PollingExhausted(self.max_attempts))
    }
}

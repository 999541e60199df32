//! Grading collaborator interface.
//!
//! The actual grader (a vision-capable model behind some provider API)
//! is out of scope; this module fixes the seam. [`GraderClient`] is the
//! trait an embedding implements, and [`drive_grading`] is the request
//! driver: bounded parallelism, staggered starts so a batch never
//! bursts against a rate-limited provider, and capped retries with
//! exponential backoff plus jitter — but only for the transient error
//! classes. A malformed request fails immediately; retrying it would
//! just burn quota.

use crate::config::PipelineConfig;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// One grading call: a finalised attack PDF against one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeRequest {
    pub model: String,
    pub pdf_path: PathBuf,
    /// Method that produced the PDF, for reporting.
    pub method: String,
}

/// Grader-side failures, split by retryability.
#[derive(Debug, Clone, Error)]
pub enum GraderError {
    #[error("rate limited")]
    RateLimited,
    #[error("request timed out")]
    Timeout,
    #[error("server error ({status})")]
    Server { status: u16 },
    #[error("grading failed: {0}")]
    Fatal(String),
}

impl GraderError {
    /// Only rate limits, timeouts, and 5xx responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            GraderError::RateLimited | GraderError::Timeout => true,
            GraderError::Server { status } => (500..600).contains(status),
            GraderError::Fatal(_) => false,
        }
    }
}

/// The seam an embedding implements to plug in its grader.
pub trait GraderClient: Send + Sync {
    fn grade<'a>(
        &'a self,
        request: GradeRequest,
    ) -> BoxFuture<'a, Result<serde_json::Value, GraderError>>;
}

/// Outcome of one request after the retry loop.
#[derive(Debug)]
pub struct GradeOutcome {
    pub request: GradeRequest,
    pub attempts: u32,
    pub result: Result<serde_json::Value, GraderError>,
}

/// Drive a batch of grading calls.
///
/// Order of results is completion order, not request order; callers key
/// off `request.model` / `request.method`.
pub async fn drive_grading(
    client: Arc<dyn GraderClient>,
    requests: Vec<GradeRequest>,
    config: &PipelineConfig,
) -> Vec<GradeOutcome> {
    let max_retries = config.grader_max_retries;
    let backoff_ms = config.grader_backoff_ms;
    let stagger_ms = config.grader_stagger_ms;

    stream::iter(requests.into_iter().enumerate())
        .map(|(i, request)| {
            let client = Arc::clone(&client);
            async move {
                if stagger_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(stagger_ms * i as u64)).await;
                }
                grade_with_retries(client.as_ref(), request, max_retries, backoff_ms).await
            }
        })
        .buffer_unordered(config.grader_concurrency.max(1))
        .collect()
        .await
}

async fn grade_with_retries(
    client: &dyn GraderClient,
    request: GradeRequest,
    max_retries: u32,
    backoff_ms: u64,
) -> GradeOutcome {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match client.grade(request.clone()).await {
            Ok(value) => {
                debug!(
                    "graded {} with {} on attempt {attempts}",
                    request.method, request.model
                );
                return GradeOutcome {
                    request,
                    attempts,
                    result: Ok(value),
                };
            }
            Err(e) if e.is_transient() && attempts <= max_retries => {
                let delay = backoff_delay(backoff_ms, attempts);
                warn!(
                    "grading {} with {} failed transiently ({e}), retry {attempts}/{max_retries} in {delay:?}",
                    request.method, request.model
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return GradeOutcome {
                    request,
                    attempts,
                    result: Err(e),
                };
            }
        }
    }
}

/// Exponential backoff with up to 25% additive jitter. The jitter seed
/// comes from the clock; grading retries need decorrelation, not
/// cryptographic randomness.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << (attempt - 1).min(16));
    let jitter_span = exp / 4;
    let jitter = if jitter_span > 0 {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        nanos % jitter_span
    } else {
        0
    };
    Duration::from_millis(exp + jitter)
}

//! Upload pipeline: request construction, status classification and retry.

use crate::batcher::UploadBatch;
use crate::config::{RetryConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::session::CancelFlag;
use crate::transport::{UploadRequest, Uploader};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use vitalsync_protocol::{
    AUTHORIZATION_HEADER, CONTENT_LENGTH_HEADER, CONTENT_TYPE_HEADER, CONTENT_TYPE_JSON,
};

/// Granularity at which backoff sleeps notice cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Outcome of delivering one batch.
#[derive(Debug)]
pub struct Delivery {
    /// Requests made, including the first.
    pub attempts: u32,
    /// Size of the encoded body.
    pub bytes: usize,
    /// `Ok` once the server accepted the batch.
    pub result: SyncResult<()>,
}

impl Delivery {
    /// Returns the number of retries spent.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Sends batches to one endpoint with one token.
pub struct UploadPipeline<U: Uploader> {
    uploader: Arc<U>,
    url: String,
    token: String,
    retry: RetryConfig,
    timeout: Duration,
}

impl<U: Uploader> UploadPipeline<U> {
    /// Creates a pipeline for `config`'s endpoint and token.
    pub fn new(uploader: Arc<U>, config: &SyncConfig) -> Self {
        Self {
            uploader,
            url: config.endpoint.trim().to_string(),
            token: config.token.clone(),
            retry: config.retry.clone(),
            timeout: config.timeout,
        }
    }

    /// Builds the request for an encoded body.
    pub fn request(&self, body: Vec<u8>) -> UploadRequest {
        UploadRequest {
            url: self.url.clone(),
            headers: vec![
                (CONTENT_TYPE_HEADER.to_string(), CONTENT_TYPE_JSON.to_string()),
                (AUTHORIZATION_HEADER.to_string(), format!("Bearer {}", self.token)),
                (CONTENT_LENGTH_HEADER.to_string(), body.len().to_string()),
            ],
            body,
            timeout: self.timeout,
        }
    }

    /// Delivers `batch`, retrying transient failures with exponential
    /// backoff.
    ///
    /// Cancellation is checked before every attempt and during backoff; a
    /// cancelled delivery ends with [`SyncError::Cancelled`].
    pub fn send(&self, batch: &UploadBatch, cancel: &CancelFlag) -> Delivery {
        let body = match batch.encode() {
            Ok(body) => body,
            Err(e) => {
                return Delivery {
                    attempts: 0,
                    bytes: 0,
                    result: Err(e),
                }
            }
        };
        let bytes = body.len();
        let request = self.request(body);
        let records = batch.record_count();

        let mut attempts = 0;
        let result = loop {
            if cancel.is_cancelled() {
                break Err(SyncError::Cancelled);
            }

            let delay = self.retry.delay_for_attempt(attempts);
            if !delay.is_zero() && !sleep_unless_cancelled(delay, cancel) {
                break Err(SyncError::Cancelled);
            }

            attempts += 1;
            let started = Instant::now();
            let outcome = self
                .uploader
                .post(&request)
                .and_then(|response| classify(response.status, records));

            match outcome {
                Ok(()) => {
                    debug!(
                        batch = batch.index,
                        records,
                        bytes,
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "batch accepted"
                    );
                    break Ok(());
                }
                Err(e) if e.is_retryable() && attempts < self.retry.max_attempts => {
                    warn!(
                        batch = batch.index,
                        attempt = attempts,
                        max_attempts = self.retry.max_attempts,
                        error = %e,
                        "transient upload failure; retrying"
                    );
                }
                Err(e) => break Err(e),
            }
        };

        Delivery {
            attempts,
            bytes,
            result,
        }
    }
}

/// Maps an HTTP status to the engine's error taxonomy.
///
/// - 2xx: accepted
/// - 401, 403: the token is bad; the session stops
/// - 413: the batch is too large for the server
/// - 408, 429, 5xx: transient, retried
/// - any other status: the batch is permanently rejected
pub fn classify(status: u16, records: usize) -> SyncResult<()> {
    match status {
        200..=299 => Ok(()),
        401 | 403 => Err(SyncError::TokenRejected { status }),
        413 => Err(SyncError::PayloadTooLarge { records }),
        408 | 429 | 500..=599 => Err(SyncError::ServerError { status }),
        _ => Err(SyncError::Rejected { status }),
    }
}

/// Sleeps for `delay`, waking early if `cancel` is set. Returns false if
/// cancelled.
fn sleep_unless_cancelled(delay: Duration, cancel: &CancelFlag) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::AnchorToken;
    use crate::batcher::Batcher;
    use crate::collector::RecordSet;
    use crate::transport::{MockReply, MockUploader};
    use chrono::{TimeZone, Utc};
    use vitalsync_protocol::Record;

    fn config(attempts: u32) -> SyncConfig {
        SyncConfig::new("https://ingest.example.com/v1/samples", "secret")
            .with_type("steps")
            .with_retry(
                RetryConfig::new(attempts)
                    .with_initial_delay(Duration::from_millis(1))
                    .with_jitter(false),
            )
    }

    fn batch(records: usize) -> UploadBatch {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let set = RecordSet {
            type_id: "steps".into(),
            records: (0..records).map(|i| Record::new(i as f64, "count", t, t)).collect(),
            anchor: AnchorToken::new("1"),
            full_export: false,
            skipped_deletions: 0,
        };
        Batcher::new(100).split(vec![set]).remove(0)
    }

    #[test]
    fn request_carries_headers() {
        let uploader = Arc::new(MockUploader::new());
        let pipeline = UploadPipeline::new(uploader.clone(), &config(1));

        let delivery = pipeline.send(&batch(2), &CancelFlag::new());
        assert!(delivery.result.is_ok());
        assert_eq!(delivery.attempts, 1);

        let request = &uploader.requests()[0];
        assert_eq!(request.url, "https://ingest.example.com/v1/samples");
        assert_eq!(request.header("Authorization"), Some("Bearer secret"));
        assert_eq!(request.header("Content-Type"), Some("application/json"));
        assert_eq!(
            request.header("Content-Length"),
            Some(request.body.len().to_string().as_str())
        );
        assert_eq!(delivery.bytes, request.body.len());
        assert_eq!(uploader.payloads()[0].record_count(), 2);
    }

    #[test]
    fn transient_failures_are_retried() {
        let uploader = Arc::new(MockUploader::new());
        uploader.push_replies([
            MockReply::Status(503),
            MockReply::ConnectionLost,
            MockReply::Status(201),
        ]);
        let pipeline = UploadPipeline::new(uploader.clone(), &config(3));

        let delivery = pipeline.send(&batch(1), &CancelFlag::new());
        assert!(delivery.result.is_ok());
        assert_eq!(delivery.attempts, 3);
        assert_eq!(delivery.retries(), 2);
    }

    #[test]
    fn retries_are_bounded() {
        let uploader = Arc::new(MockUploader::new());
        uploader.set_default_reply(MockReply::Timeout);
        let pipeline = UploadPipeline::new(uploader.clone(), &config(3));

        let delivery = pipeline.send(&batch(1), &CancelFlag::new());
        assert!(matches!(delivery.result, Err(SyncError::Timeout)));
        assert_eq!(uploader.request_count(), 3);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        for (status, expected) in [(401, "token"), (413, "too large"), (422, "rejected")] {
            let uploader = Arc::new(MockUploader::new());
            uploader.set_default_reply(MockReply::Status(status));
            let pipeline = UploadPipeline::new(uploader.clone(), &config(5));

            let delivery = pipeline.send(&batch(4), &CancelFlag::new());
            let err = delivery.result.unwrap_err();
            assert!(err.to_string().contains(expected), "{status}: {err}");
            assert_eq!(uploader.request_count(), 1);
        }
    }

    #[test]
    fn cancelled_before_sending() {
        let uploader = Arc::new(MockUploader::new());
        let pipeline = UploadPipeline::new(uploader.clone(), &config(3));
        let cancel = CancelFlag::new();
        cancel.cancel();

        let delivery = pipeline.send(&batch(1), &cancel);
        assert!(matches!(delivery.result, Err(SyncError::Cancelled)));
        assert_eq!(uploader.request_count(), 0);
    }

    #[test]
    fn cancellation_interrupts_backoff() {
        let uploader = Arc::new(MockUploader::new());
        uploader.set_default_reply(MockReply::Status(500));
        let cancel = CancelFlag::new();
        let hook_flag = cancel.clone();
        uploader.on_post(move |_| hook_flag.cancel());

        let config = config(5).with_retry(
            RetryConfig::new(5)
                .with_initial_delay(Duration::from_secs(60))
                .with_jitter(false),
        );
        let pipeline = UploadPipeline::new(uploader.clone(), &config);

        let started = Instant::now();
        let delivery = pipeline.send(&batch(1), &cancel);
        assert!(matches!(delivery.result, Err(SyncError::Cancelled)));
        assert_eq!(uploader.request_count(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn status_classification() {
        assert!(classify(200, 1).is_ok());
        assert!(classify(204, 1).is_ok());
        assert!(matches!(classify(403, 1), Err(SyncError::TokenRejected { status: 403 })));
        assert!(matches!(classify(413, 7), Err(SyncError::PayloadTooLarge { records: 7 })));
        assert!(classify(408, 1).unwrap_err().is_retryable());
        assert!(classify(429, 1).unwrap_err().is_retryable());
        assert!(classify(502, 1).unwrap_err().is_retryable());
        assert!(matches!(classify(400, 1), Err(SyncError::Rejected { status: 400 })));
        assert!(matches!(classify(302, 1), Err(SyncError::Rejected { status: 302 })));
    }
}

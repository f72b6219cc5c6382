//! Transport layer abstraction for uploads.
//!
//! The engine only needs one operation from the network: POST a body with
//! some headers and learn the status code. The HTTP client itself is
//! supplied by the embedder (the CLI uses reqwest; tests use
//! [`MockUploader`]).

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vitalsync_protocol::UploadPayload;

/// A prepared upload request.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Target URL.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Encoded body.
    pub body: Vec<u8>,
    /// Request timeout.
    pub timeout: Duration,
}

impl UploadRequest {
    /// Returns the first header named `name`, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Outcome of an upload that reached the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadResponse {
    /// HTTP status code.
    pub status: u16,
}

impl UploadResponse {
    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends upload requests to the server.
///
/// Implementations map connection failures to
/// [`SyncError::transport_retryable`] or [`SyncError::Timeout`], and report
/// every response that arrived, whatever its status, as `Ok`.
pub trait Uploader: Send + Sync {
    /// Sends `request` and waits for the response.
    fn post(&self, request: &UploadRequest) -> SyncResult<UploadResponse>;

    /// Aborts in-flight requests if the client supports it.
    fn cancel(&self) {}
}

impl<U: Uploader + ?Sized> Uploader for Arc<U> {
    fn post(&self, request: &UploadRequest) -> SyncResult<UploadResponse> {
        (**self).post(request)
    }

    fn cancel(&self) {
        (**self).cancel()
    }
}

/// A scripted reply for [`MockUploader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockReply {
    /// Respond with this status.
    Status(u16),
    /// Fail with [`SyncError::Timeout`].
    Timeout,
    /// Fail with a retryable transport error.
    ConnectionLost,
}

type PostHook = Arc<dyn Fn(&UploadRequest) + Send + Sync>;

/// An uploader for testing.
///
/// Replies are taken from a queue; once it is empty every request gets the
/// default reply (200 unless changed).
pub struct MockUploader {
    replies: Mutex<VecDeque<MockReply>>,
    default_reply: Mutex<MockReply>,
    requests: Mutex<Vec<UploadRequest>>,
    delay: Mutex<Duration>,
    on_post: Mutex<Option<PostHook>>,
    cancels: AtomicUsize,
}

impl MockUploader {
    /// Creates an uploader that accepts everything.
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            default_reply: Mutex::new(MockReply::Status(200)),
            requests: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            on_post: Mutex::new(None),
            cancels: AtomicUsize::new(0),
        }
    }

    /// Queues replies for the next requests.
    pub fn push_replies(&self, replies: impl IntoIterator<Item = MockReply>) {
        self.replies.lock().extend(replies);
    }

    /// Sets the reply used once the queue is empty.
    pub fn set_default_reply(&self, reply: MockReply) {
        *self.default_reply.lock() = reply;
    }

    /// Makes every request take at least `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Installs a hook called with every request before it is answered.
    pub fn on_post(&self, hook: impl Fn(&UploadRequest) + Send + Sync + 'static) {
        *self.on_post.lock() = Some(Arc::new(hook));
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<UploadRequest> {
        self.requests.lock().clone()
    }

    /// Returns the number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Decodes the body of every request received so far.
    pub fn payloads(&self) -> Vec<UploadPayload> {
        self.requests
            .lock()
            .iter()
            .filter_map(|r| UploadPayload::decode(&r.body).ok())
            .collect()
    }

    /// Returns how many times [`Uploader::cancel`] was called.
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl Default for MockUploader {
    fn default() -> Self {
        Self::new()
    }
}

impl Uploader for MockUploader {
    fn post(&self, request: &UploadRequest) -> SyncResult<UploadResponse> {
        self.requests.lock().push(request.clone());

        let hook = self.on_post.lock().clone();
        if let Some(hook) = hook {
            hook(request);
        }

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or(*self.default_reply.lock());

        match reply {
            MockReply::Status(status) => Ok(UploadResponse { status }),
            MockReply::Timeout => Err(SyncError::Timeout),
            MockReply::ConnectionLost => Err(SyncError::transport_retryable("connection lost")),
        }
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> UploadRequest {
        UploadRequest {
            url: "https://ingest.example.com".into(),
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: br#"{"data":{},"fullExport":false}"#.to_vec(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn mock_uploader_replays_script() {
        let uploader = MockUploader::new();
        uploader.push_replies([MockReply::Status(503), MockReply::Timeout]);

        assert_eq!(uploader.post(&request()).unwrap().status, 503);
        assert!(matches!(uploader.post(&request()), Err(SyncError::Timeout)));
        assert!(uploader.post(&request()).unwrap().is_success());
        assert_eq!(uploader.request_count(), 3);
        assert_eq!(uploader.payloads().len(), 3);
    }

    #[test]
    fn mock_uploader_default_reply() {
        let uploader = MockUploader::new();
        uploader.set_default_reply(MockReply::ConnectionLost);

        let err = uploader.post(&request()).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn header_lookup_ignores_case() {
        assert_eq!(request().header("content-type"), Some("application/json"));
        assert_eq!(request().header("Authorization"), None);
    }

    #[test]
    fn cancel_is_counted() {
        let uploader = Arc::new(MockUploader::new());
        uploader.cancel();
        Uploader::cancel(&uploader);
        assert_eq!(uploader.cancel_count(), 2);
    }
}

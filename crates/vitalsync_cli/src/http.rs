//! Uploaders used by the CLI.

use reqwest::blocking::Client;
use tracing::debug;
use vitalsync_engine::{SyncError, SyncResult, UploadRequest, UploadResponse, Uploader};
use vitalsync_protocol::{UploadPayload, CONTENT_LENGTH_HEADER};

/// Posts batches over HTTP with a blocking reqwest client.
pub struct ReqwestUploader {
    client: Client,
}

impl ReqwestUploader {
    /// Builds the HTTP client.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("vitalsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Uploader for ReqwestUploader {
    fn post(&self, request: &UploadRequest) -> SyncResult<UploadResponse> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            // reqwest derives it from the body.
            if name.eq_ignore_ascii_case(CONTENT_LENGTH_HEADER) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().map_err(transport_error)?;
        let status = response.status().as_u16();
        debug!(url = %request.url, status, bytes = request.body.len(), "batch posted");
        Ok(UploadResponse { status })
    }
}

fn transport_error(error: reqwest::Error) -> SyncError {
    if error.is_timeout() {
        SyncError::Timeout
    } else if error.is_builder() {
        SyncError::transport_fatal(error.to_string())
    } else {
        SyncError::transport_retryable(error.to_string())
    }
}

/// Prints every request and answers 200 without touching the network.
#[derive(Debug, Default)]
pub struct DryRunUploader;

impl Uploader for DryRunUploader {
    fn post(&self, request: &UploadRequest) -> SyncResult<UploadResponse> {
        let payload = UploadPayload::decode(&request.body)?;
        println!(
            "POST {} ({} records, {} bytes{})",
            request.url,
            payload.record_count(),
            request.body.len(),
            if payload.full_export { ", full export" } else { "" }
        );
        for (type_id, records) in &payload.data {
            println!("  {}: {} records", type_id, records.len());
        }
        Ok(UploadResponse { status: 200 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn dry_run_accepts_valid_payloads() {
        let body = UploadPayload {
            data: BTreeMap::new(),
            full_export: true,
        }
        .encode()
        .unwrap();
        let request = UploadRequest {
            url: "https://ingest.example.com/v1/samples".into(),
            headers: Vec::new(),
            body,
            timeout: Duration::from_secs(1),
        };
        assert!(DryRunUploader.post(&request).unwrap().is_success());
    }

    #[test]
    fn dry_run_rejects_garbage() {
        let request = UploadRequest {
            url: "https://ingest.example.com/v1/samples".into(),
            headers: Vec::new(),
            body: b"not json".to_vec(),
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            DryRunUploader.post(&request),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn unreachable_server_is_retryable() {
        let uploader = ReqwestUploader::new().unwrap();
        let request = UploadRequest {
            // Port 9 (discard) is closed on test hosts.
            url: "http://127.0.0.1:9/v1/samples".into(),
            headers: vec![("Content-Length".into(), "2".into())],
            body: b"{}".to_vec(),
            timeout: Duration::from_secs(2),
        };
        let err = uploader.post(&request).unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }
}

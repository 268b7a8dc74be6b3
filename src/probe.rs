use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

use crate::key::DownloadKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityVerdict {
    pub supports_range_requests: bool,
    pub not_found_on_server: bool,
    pub content_length: Option<u64>,
}

impl CapabilityVerdict {
    fn not_found() -> Self {
        Self {
            not_found_on_server: true,
            ..Self::default()
        }
    }
}

/// Asks the origin for the first byte of the resource to learn whether it honours
/// `Range` and how large the resource is.
#[derive(Clone)]
pub struct CapabilityProbe {
    client: Client,
    timeout: Duration,
}

impl CapabilityProbe {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Never fails: anything but a not-found answer degrades to "no range support".
    pub async fn check(&self, key: &DownloadKey) -> CapabilityVerdict {
        let request = self
            .client
            .get(key.as_str())
            .header(header::RANGE, "bytes=0-0")
            .send();

        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "capability probe failed, falling back to single stream");
                return CapabilityVerdict::default();
            }
            Err(_) => {
                warn!(key = %key, timeout_ms = self.timeout.as_millis() as u64, "capability probe timed out");
                return CapabilityVerdict::default();
            }
        };

        let status = response.status();
        let verdict = match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => CapabilityVerdict::not_found(),
            StatusCode::PARTIAL_CONTENT => CapabilityVerdict {
                supports_range_requests: true,
                not_found_on_server: false,
                content_length: content_range_total(response.headers()),
            },
            StatusCode::RANGE_NOT_SATISFIABLE => CapabilityVerdict {
                // Empty resources cannot satisfy `bytes=0-0`.
                content_length: content_range_total(response.headers()),
                ..CapabilityVerdict::default()
            },
            s if s.is_success() => CapabilityVerdict {
                content_length: response.content_length(),
                ..CapabilityVerdict::default()
            },
            _ => CapabilityVerdict::default(),
        };
        debug!(key = %key, status = status.as_u16(), ?verdict, "capability probe answered");
        verdict
    }
}

/// Total length from a `Content-Range: bytes 0-0/1234` (or `bytes */1234`) header.
fn content_range_total(headers: &header::HeaderMap) -> Option<u64> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    parse_content_range_total(value)
}

pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse().ok()
}

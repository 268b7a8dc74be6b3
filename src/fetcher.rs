use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;
use crate::key::DownloadKey;
use crate::plan::ChunkRange;

/// Opens one HTTP GET per chunk (or for the whole resource).
#[derive(Clone)]
pub struct ChunkFetcher {
    client: Client,
    read_timeout: Duration,
}

/// Response body of one fetch, read with a per-read timeout.
pub struct ChunkStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    expected_len: Option<u64>,
    read_timeout: Duration,
}

impl ChunkFetcher {
    pub fn new(client: Client, read_timeout: Duration) -> Self {
        Self {
            client,
            read_timeout,
        }
    }

    pub async fn fetch(
        &self,
        key: &DownloadKey,
        range: Option<&ChunkRange>,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, TransferError> {
        let mut request = self.client.get(key.as_str());
        if let Some(range) = range {
            request = request.header(header::RANGE, range.range_header());
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            sent = tokio::time::timeout(self.read_timeout, request.send()) => match sent {
                Ok(response) => response?,
                Err(_) => return Err(TransferError::ReadTimeout(self.read_timeout.as_millis() as u64)),
            },
        };

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(TransferError::NotFound(status.as_u16()))
            }
            StatusCode::PARTIAL_CONTENT => {}
            // Answering a ranged GET with the whole body would shift every later chunk.
            StatusCode::OK if range.is_some() => return Err(TransferError::RangeIgnored),
            s if s.is_success() => {}
            s => return Err(TransferError::HttpStatus(s.as_u16())),
        }

        let expected_len = match range {
            Some(range) => Some(range.len()),
            None => response.content_length(),
        };

        Ok(ChunkStream {
            inner: response.bytes_stream().boxed(),
            expected_len,
            read_timeout: self.read_timeout,
        })
    }
}

impl ChunkStream {
    /// Body length announced for this fetch, when known.
    pub fn expected_len(&self) -> Option<u64> {
        self.expected_len
    }

    /// Next piece of the body; `None` once the body is exhausted.
    pub async fn next_bytes(&mut self) -> Option<Result<Bytes, TransferError>> {
        match tokio::time::timeout(self.read_timeout, self.inner.next()).await {
            Ok(Some(item)) => Some(item.map_err(TransferError::from)),
            Ok(None) => None,
            Err(_) => Some(Err(TransferError::ReadTimeout(
                self.read_timeout.as_millis() as u64
            ))),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(parts: Vec<Bytes>, expected_len: Option<u64>) -> Self {
        let items: Vec<reqwest::Result<Bytes>> = parts.into_iter().map(Ok).collect();
        Self {
            inner: futures::stream::iter(items).boxed(),
            expected_len,
            read_timeout: Duration::from_secs(5),
        }
    }
}

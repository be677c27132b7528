//!
//! # HTTP 客户端模块
//! 封装 HEAD 探测和带 Range 头的 GET 请求
//!

use std::time::Duration;

use headers::HeaderMapExt;
use log::debug;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH};
use reqwest::{Client, Response};

use crate::download::chunk_range::ChunkRange;
use crate::download::error::DownloadError;

pub const USER_AGENT: &str = "tech-idm";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// HEAD 探测结果
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    pub total_size: u64,
    pub supports_range: bool,
}

/// Client 内部拥有连接池且可廉价 clone，整个进程共用一个
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new() -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self { client })
    }

    /// HEAD 探测文件大小和 Range 支持情况
    pub async fn probe(&self, url: &str) -> Result<Probe, DownloadError> {
        let response = self.client.head(url).send().await?;

        let status = response.status();
        if status.as_u16() > 299 {
            return Err(DownloadError::BadStatus(status));
        }

        let total_size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| {
                DownloadError::Planning(format!("missing or invalid Content-Length: {url}"))
            })?;

        let supports_range = response
            .headers()
            .get(ACCEPT_RANGES)
            .map(|value| value.to_str().unwrap_or("") == "bytes")
            .unwrap_or(false);

        debug!("Probed {url}: {total_size} bytes, range support: {supports_range}");

        Ok(Probe {
            total_size,
            supports_range,
        })
    }

    /// 发起 GET，range 存在时写入 Range: bytes=start-end
    pub async fn get(
        &self,
        url: &str,
        range: Option<&ChunkRange>,
    ) -> Result<Response, DownloadError> {
        let mut headers = HeaderMap::new();
        if let Some(range) = range {
            headers.typed_insert(range.to_range_header());
        }

        let response = self.client.get(url).headers(headers).send().await?;

        let status = response.status();
        if status.as_u16() > 299 {
            return Err(DownloadError::BadStatus(status));
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::test_server::{self, Origin};

    #[tokio::test]
    async fn probe_reads_length_and_range_support() {
        let url = test_server::spawn(Origin::new(test_server::pattern_bytes(512))).await;
        let client = HttpClient::new().unwrap();

        let probe = client.probe(&url).await.unwrap();
        assert_eq!(probe.total_size, 512);
        assert!(probe.supports_range);
    }

    #[tokio::test]
    async fn ranged_get_returns_partial_content() {
        let body = test_server::pattern_bytes(1024);
        let url = test_server::spawn(Origin::new(body.clone())).await;
        let client = HttpClient::new().unwrap();

        let range = ChunkRange::new(100, 199);
        let response = client.get(&url, Some(&range)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::PARTIAL_CONTENT);

        let bytes = response.bytes().await.unwrap();
        assert_eq!(&bytes[..], &body[100..=199]);
    }

    #[tokio::test]
    async fn missing_resource_is_bad_status() {
        let url = test_server::spawn(Origin::new(test_server::pattern_bytes(16))).await;
        let client = HttpClient::new().unwrap();

        let err = client
            .probe(&url.replace("/file", "/missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::BadStatus(code) if code.as_u16() == 404));
    }
}

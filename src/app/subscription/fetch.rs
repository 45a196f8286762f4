//! 订阅下载
//!
//! [`Fetcher`] 是同步器与网络之间的接缝，测试里用内存实现替换。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, USER_AGENT};
use thiserror::Error;

use crate::common::codec::{base64_decode, percent_decode};
use crate::model::SubscriptionInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub user_agent: String,
    /// 经当前运行的 core 下载，如 `http://127.0.0.1:2080`
    pub proxy: Option<String>,
    pub ignore_tls_errors: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct FetchedDocument {
    pub body: String,
    pub info: SubscriptionInfo,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid subscription url '{0}'")]
    InvalidUrl(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to read {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedDocument, FetchError>;
}

/// reqwest 实现，另外支持 `file://` 本地订阅
#[derive(Debug, Default, Clone)]
pub struct HttpFetcher;

impl HttpFetcher {
    pub fn new() -> Self {
        Self
    }

    fn client(request: &FetchRequest) -> Result<reqwest::Client, FetchError> {
        let mut builder = reqwest::Client::builder()
            .timeout(request.timeout)
            .danger_accept_invalid_certs(request.ignore_tls_errors);
        if let Some(proxy) = &request.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| FetchError::Network(format!("bad proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }
        builder.build().map_err(|e| FetchError::Network(e.to_string()))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedDocument, FetchError> {
        if let Some(path) = request.url.strip_prefix("file://") {
            let body = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| FetchError::File {
                    path: path.to_string(),
                    source,
                })?;
            return Ok(FetchedDocument {
                body,
                info: SubscriptionInfo::default(),
            });
        }
        if !request.url.starts_with("http://") && !request.url.starts_with("https://") {
            return Err(FetchError::InvalidUrl(request.url.clone()));
        }

        let client = Self::client(request)?;
        let response = client
            .get(&request.url)
            .header(USER_AGENT, &request.user_agent)
            .send()
            .await
            .map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let headers = response.headers();
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let mut info = header("subscription-userinfo")
            .map(parse_userinfo)
            .unwrap_or_default();
        info.title = parse_title(
            header("profile-title"),
            headers
                .get(CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok()),
        );

        let body = response.text().await.map_err(classify)?;
        tracing::debug!(url = %request.url, bytes = body.len(), "subscription fetched");
        Ok(FetchedDocument { body, info })
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout;
    }
    let mut chain = String::new();
    let mut source = Some(&err as &dyn std::error::Error);
    while let Some(e) = source {
        if !chain.is_empty() {
            chain.push_str(": ");
        }
        chain.push_str(&e.to_string());
        source = e.source();
    }
    let lower = chain.to_ascii_lowercase();
    if lower.contains("certificate") || lower.contains("tls") || lower.contains("handshake") {
        FetchError::Tls(chain)
    } else {
        FetchError::Network(chain)
    }
}

/// `upload=1234; download=5678; total=10000; expire=1700000000`
pub fn parse_userinfo(value: &str) -> SubscriptionInfo {
    let mut info = SubscriptionInfo::default();
    for part in value.split(';') {
        let Some((key, val)) = part.split_once('=') else {
            continue;
        };
        // 部分机场会给出小数
        let Some(n) = val
            .trim()
            .parse::<u64>()
            .ok()
            .or_else(|| val.trim().parse::<f64>().ok().map(|f| f as u64))
        else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "upload" => info.upload = Some(n),
            "download" => info.download = Some(n),
            "total" => info.total = Some(n),
            "expire" => info.expire = Some(n),
            _ => {}
        }
    }
    info
}

/// `profile-title` 优先（可带 `base64:` 前缀），否则取 content-disposition 的文件名
pub fn parse_title(profile_title: Option<&str>, disposition: Option<&str>) -> Option<String> {
    if let Some(title) = profile_title.map(str::trim).filter(|t| !t.is_empty()) {
        let decoded = match title.strip_prefix("base64:") {
            Some(encoded) => base64_decode(encoded)?,
            None => title.to_string(),
        };
        return Some(decoded);
    }
    let disposition = disposition?;
    let mut plain = None;
    for part in disposition.split(';').map(str::trim) {
        if let Some(v) = part.strip_prefix("filename*=") {
            // RFC 5987: charset''value
            let value = v.split_once("''").map_or(v, |(_, rest)| rest);
            return Some(percent_decode(value)).filter(|s| !s.is_empty());
        }
        if let Some(v) = part.strip_prefix("filename=") {
            plain = Some(v.trim_matches('"').to_string());
        }
    }
    plain.filter(|s| !s.is_empty())
}

use crate::config::Config;
use crate::error::AppError;
use crate::logging::{self, LogLevel};
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use std::time::{Duration, Instant};

/// 逐跳头：只对单个连接有意义，转发时去掉（参考 RFC 7230 §6.1）。
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// 上游响应（已完整读取响应体，用于解析用量后原样返回给调用方）。
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    log_level: LogLevel,
}

impl UpstreamClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if cfg.upstream_timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.upstream_timeout_ms));
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: cfg.gemini_api_url.clone(),
            log_level: cfg.log_level(),
        })
    }

    /// 目标地址：上游基础地址 + 原始路径 + 去掉 `key` 参数后的查询串。
    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = format!("{}{}", self.base_url, path);
        let query = query.map(strip_key_param).unwrap_or_default();
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    /// 发送一次请求，不做重试。网络层失败映射为 502。
    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, AppError> {
        if self.log_level.exchange_enabled() {
            logging::upstream_request(method.as_str(), url, &headers, &body);
        }

        let start = Instant::now();
        let resp = self
            .http
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(url = %logging::redact_url(url), error = %e, "上游请求失败");
                AppError::upstream(e.without_url().to_string())
            })?;

        let status = resp.status();
        let headers = response_headers(resp.headers());
        let body = resp
            .bytes()
            .await
            .map_err(|e| AppError::upstream(format!("读取上游响应失败: {}", e.without_url())))?;

        if self.log_level.exchange_enabled() {
            logging::upstream_response(status.as_u16(), start.elapsed(), &body);
        }

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// 转发给上游的请求头：去掉逐跳头、host、调用方自己的 key，再写入分配到的上游 key。
///
/// 同时去掉 accept-encoding，让上游返回未压缩的响应体，便于解析用量。
pub fn request_headers(inbound: &HeaderMap, credential: &str) -> Result<HeaderMap, AppError> {
    let mut out = HeaderMap::with_capacity(inbound.len() + 1);
    for (name, value) in inbound.iter() {
        let n = name.as_str();
        if HOP_BY_HOP.contains(&n)
            || matches!(
                n,
                "host" | "content-length" | "x-goog-api-key" | "accept-encoding"
            )
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    let key: HeaderValue = credential
        .parse()
        .map_err(|_| AppError::config("上游 key 含有非法字符，无法写入请求头"))?;
    out.insert("x-goog-api-key", key);
    Ok(out)
}

/// 返回给调用方的响应头：去掉逐跳头和 content-length（由响应体重新计算）。
fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream.iter() {
        let n = name.as_str();
        if HOP_BY_HOP.contains(&n) || n == "content-length" {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn strip_key_param(query: &str) -> String {
    query
        .split('&')
        .filter(|p| !p.is_empty() && *p != "key" && !p.starts_with("key="))
        .collect::<Vec<_>>()
        .join("&")
}

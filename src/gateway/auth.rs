use super::AppState;
use crate::config::Config;
use crate::error::AppError;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

/// 调用方凭据：优先 `x-goog-api-key` 请求头，其次 `key` 查询参数。
pub fn caller_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let from_header = headers
        .get("x-goog-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let Some(k) = from_header {
        return Some(k.to_string());
    }

    query?
        .split('&')
        .filter_map(|pair| pair.strip_prefix("key="))
        .map(|v| {
            urlencoding::decode(v)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| v.to_string())
        })
        .find(|s| !s.trim().is_empty())
}

/// 只做等值比较：PROXY_API_KEY（若配置），或在允许时任意一个池内上游 key。
pub fn authorize(cfg: &Config, key: Option<&str>) -> Result<(), AppError> {
    let Some(key) = key else {
        return Err(AppError::bad_request(
            "缺少 API key：请通过 x-goog-api-key 请求头或 key 查询参数提供",
        ));
    };

    if !cfg.proxy_api_key.is_empty() && key == cfg.proxy_api_key {
        return Ok(());
    }
    if cfg.allow_gemini_keys_for_auth && cfg.gemini_api_keys.iter().any(|k| k == key) {
        return Ok(());
    }
    Err(AppError::unauthorized("API key 无效"))
}

/// 代理路由的认证中间件。认证失败的请求不会进入准入队列。
pub async fn require_caller_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let key = caller_key(request.headers(), request.uri().query());
    if let Err(e) = authorize(&state.cfg, key.as_deref()) {
        tracing::debug!(path = %request.uri().path(), error = %e, "拒绝未认证请求");
        return Err(e);
    }
    Ok(next.run(request).await)
}

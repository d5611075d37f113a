use super::AppState;
use super::upstream::request_headers;
use crate::error::AppError;
use crate::logging::mask_key;
use crate::usage::extract_usage;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use std::sync::Arc;
use std::time::Instant;

/// 除 /health 外的所有请求：取得上游 key 后原样转发，成功时记录用量。
pub async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let start = Instant::now();
    let credential = state.admission.acquire().await?;
    let queued_ms = start.elapsed().as_millis();

    let url = state.upstream.target_url(uri.path(), uri.query());
    let upstream_headers = request_headers(&headers, &credential)?;
    let resp = state
        .upstream
        .forward(method.clone(), &url, upstream_headers, body)
        .await?;

    tracing::info!(
        method = %method,
        path = %uri.path(),
        status = resp.status.as_u16(),
        credential = %mask_key(&credential),
        queued_ms = queued_ms as u64,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "请求已转发"
    );

    if resp.status == StatusCode::OK {
        match extract_usage(&resp.body) {
            Some(usage) => state.usage.spawn_record(credential, usage),
            None => tracing::debug!(path = %uri.path(), "响应体无法解析，跳过用量统计"),
        }
    }

    let mut response = Response::new(Body::from(resp.body));
    *response.status_mut() = resp.status;
    *response.headers_mut() = resp.headers;
    Ok(response)
}

//! HTTP 入口：GET /health 公开；其余请求经认证后进入准入队列并转发到 Gemini。

pub mod auth;
pub mod proxy;
pub mod upstream;

use crate::admission::{AdmissionHandle, CredentialSelector, spawn_dispatcher};
use crate::clock::Clock;
use crate::config::Config;
use crate::quota_store::QuotaStore;
use crate::rate_limit::{QuotaLimits, RateLimiter};
use crate::usage::UsageRecorder;
use axum::extract::DefaultBodyLimit;
use axum::handler::Handler;
use axum::routing::get;
use axum::{Json, Router, middleware};
use std::sync::Arc;
use upstream::UpstreamClient;

/// 请求体上限。Gemini 请求可内联图片/音频（base64），默认 2MB 不够用。
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug)]
pub struct AppState {
    pub cfg: Config,
    pub admission: AdmissionHandle,
    pub usage: UsageRecorder,
    pub upstream: UpstreamClient,
}

/// 组装限流器、调度器、用量统计与上游客户端。必须在 tokio 运行时内调用（会启动调度任务）。
pub fn build_state(
    cfg: Config,
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<AppState>, anyhow::Error> {
    let limiter = RateLimiter::new(
        store.clone(),
        QuotaLimits {
            per_minute: cfg.rate_limit_per_minute,
            per_day: cfg.rate_limit_per_day,
        },
        cfg.rate_limit_window,
    );
    let pool: Arc<[String]> = cfg.gemini_api_keys.iter().cloned().collect();
    let selector = Arc::new(CredentialSelector::new(
        pool,
        cfg.selection_mode,
        store.clone(),
    ));
    let admission = spawn_dispatcher(
        selector,
        limiter,
        clock.clone(),
        cfg.admission_queue_capacity,
        cfg.admission_timeout(),
    );

    Ok(Arc::new(AppState {
        upstream: UpstreamClient::new(&cfg)?,
        usage: UsageRecorder::new(store, clock),
        admission,
        cfg,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    // 只有 GET/HEAD /health 免认证；/health 的其他方法与其余路径一样经认证后转发。
    let proxied = proxy::handle_proxy.layer(middleware::from_fn_with_state(
        state.clone(),
        auth::require_caller_key,
    ));
    Router::new()
        .route("/health", get(handle_health).fallback(proxied.clone()))
        .fallback(proxied)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::quota_store::{FailingQuotaStore, InMemoryQuotaStore, keys};
    use axum::body::{Body, Bytes};
    use axum::http::{HeaderMap, Request, StatusCode, Uri};
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    // 2024-01-01T00:00:30Z
    const T0: i64 = 1_704_067_230_000;
    const POOL_KEY: &str = "AIzaPoolKey000000001";

    #[derive(Debug, Clone)]
    struct Seen {
        path: String,
        query: Option<String>,
        api_key: Option<String>,
        custom: Option<String>,
        body: Bytes,
    }

    /// 本地假上游：记录收到的请求；路径含 "limited" 时返回 429，否则返回带用量的 200。
    async fn fake_upstream() -> (String, Arc<Mutex<Vec<Seen>>>) {
        let seen: Arc<Mutex<Vec<Seen>>> = Arc::default();
        let log = seen.clone();
        let app = Router::new().fallback(move |uri: Uri, headers: HeaderMap, body: Bytes| {
            let log = log.clone();
            async move {
                let header = |name: &str| {
                    headers
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                };
                log.lock().unwrap().push(Seen {
                    path: uri.path().to_string(),
                    query: uri.query().map(str::to_string),
                    api_key: header("x-goog-api-key"),
                    custom: header("x-custom"),
                    body,
                });
                if uri.path().contains("limited") {
                    (
                        StatusCode::TOO_MANY_REQUESTS,
                        [("content-type", "application/json")],
                        r#"{"error":{"code":429}}"#.to_string(),
                    )
                } else {
                    (
                        StatusCode::OK,
                        [("content-type", "application/json")],
                        r#"{"candidates":[],"usageMetadata":{"promptTokenCount":11,"candidatesTokenCount":7}}"#
                            .to_string(),
                    )
                }
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    fn app_with(cfg: Config, store: Arc<dyn QuotaStore>) -> Router {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new(T0));
        router(build_state(cfg, store, clock).unwrap())
    }

    fn memory_store() -> InMemoryQuotaStore {
        InMemoryQuotaStore::new(Arc::new(TokioClock::new(T0)))
    }

    async fn body_string(resp: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let app = app_with(Config::for_tests(&[POOL_KEY]), Arc::new(memory_store()));
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn non_get_health_is_authenticated_and_forwarded() {
        let (base, seen) = fake_upstream().await;
        let mut cfg = Config::for_tests(&[POOL_KEY]);
        cfg.gemini_api_url = base;
        let app = app_with(cfg, Arc::new(memory_store()));

        let resp = app
            .clone()
            .oneshot(Request::post("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(seen.lock().unwrap().is_empty());

        let resp = app
            .oneshot(
                Request::post("/health")
                    .header("x-goog-api-key", "proxy-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].path, "/health");
        assert_eq!(seen[0].api_key.as_deref(), Some(POOL_KEY));
    }

    #[tokio::test]
    async fn missing_key_is_400_and_wrong_key_is_401() {
        let app = app_with(Config::for_tests(&[POOL_KEY]), Arc::new(memory_store()));

        let resp = app
            .clone()
            .oneshot(
                Request::post("/v1beta/models/gemini-pro:generateContent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(
                Request::post("/v1beta/models/gemini-pro:generateContent?key=nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(body_string(resp).await.contains(r#""type":"unauthorized""#));
    }

    #[tokio::test]
    async fn proxies_with_pool_key_and_records_usage() {
        let (base, seen) = fake_upstream().await;
        let mut cfg = Config::for_tests(&[POOL_KEY]);
        cfg.gemini_api_url = base;
        let store = memory_store();
        let app = app_with(cfg, Arc::new(store.clone()));

        let resp = app
            .oneshot(
                Request::post("/v1beta/models/gemini-pro:generateContent?key=proxy-secret&alt=json")
                    .header("content-type", "application/json")
                    .header("x-custom", "kept")
                    .body(Body::from(r#"{"contents":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_string(resp).await.contains(r#""promptTokenCount":11"#));

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].path, "/v1beta/models/gemini-pro:generateContent");
        assert_eq!(seen[0].query.as_deref(), Some("alt=json"));
        assert_eq!(seen[0].api_key.as_deref(), Some(POOL_KEY));
        assert_eq!(seen[0].custom.as_deref(), Some("kept"));
        assert_eq!(&seen[0].body[..], br#"{"contents":[]}"#);

        // 用量在后台任务中写入。
        let daily = format!("proxy:{POOL_KEY}:stats:daily:2024-01-01");
        let mut stats = store.hash(&daily);
        for _ in 0..100 {
            if !stats.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            stats = store.hash(&daily);
        }
        assert_eq!(stats.get("total_requests"), Some(&1));
        assert_eq!(stats.get("total_prompt_tokens"), Some(&11));
        assert_eq!(stats.get("total_completion_tokens"), Some(&7));
        assert_eq!(stats.get("total_tokens"), Some(&18));

        let committed = store.events(&keys::requests(POOL_KEY, crate::rate_limit::LimitKind::Day));
        assert_eq!(committed.len(), 1);
    }

    #[tokio::test]
    async fn pool_key_authenticates_when_enabled() {
        let (base, seen) = fake_upstream().await;
        let mut cfg = Config::for_tests(&[POOL_KEY]);
        cfg.gemini_api_url = base;
        cfg.allow_gemini_keys_for_auth = true;
        let app = app_with(cfg, Arc::new(memory_store()));

        let resp = app
            .oneshot(
                Request::get("/v1beta/models")
                    .header("x-goog-api-key", POOL_KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upstream_error_status_is_passed_through_without_usage() {
        let (base, _seen) = fake_upstream().await;
        let mut cfg = Config::for_tests(&[POOL_KEY]);
        cfg.gemini_api_url = base;
        let store = memory_store();
        let app = app_with(cfg, Arc::new(store.clone()));

        let resp = app
            .oneshot(
                Request::post("/v1beta/models/limited:generateContent")
                    .header("x-goog-api-key", "proxy-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_string(resp).await, r#"{"error":{"code":429}}"#);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            store
                .hash(&format!("proxy:{POOL_KEY}:stats:daily:2024-01-01"))
                .is_empty()
        );
    }

    #[tokio::test]
    async fn store_failure_is_500() {
        let store = FailingQuotaStore::new(memory_store(), "");
        let app = app_with(Config::for_tests(&[POOL_KEY]), Arc::new(store));

        let resp = app
            .oneshot(
                Request::post("/v1beta/models/gemini-pro:generateContent")
                    .header("x-goog-api-key", "proxy-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_string(resp).await.contains(r#""type":"admission""#));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_502() {
        // 先占用一个端口再释放，得到一个大概率无人监听的地址。
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut cfg = Config::for_tests(&[POOL_KEY]);
        cfg.gemini_api_url = format!("http://{addr}");
        let app = app_with(cfg, Arc::new(memory_store()));

        let resp = app
            .oneshot(
                Request::get("/v1beta/models")
                    .header("x-goog-api-key", "proxy-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(body_string(resp).await.contains(r#""type":"upstream""#));
    }
}

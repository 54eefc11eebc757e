//! Per-caller rate limiting for the routes that cost money (uploads, model calls)

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request, Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
    Json,
};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

use crate::auth::USER_HEADER;

/// Fixed-window request counter keyed by caller
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Caller key to (request count, window start)
    requests: Arc<RwLock<HashMap<String, (u32, Instant)>>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
            max_requests,
            window,
        }
    }

    /// Count a request. When over the limit, returns how long until the window resets.
    pub async fn check(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut requests = self.requests.write().await;
        let (count, window_start) = requests.entry(key.to_string()).or_insert((0, now));

        let elapsed = now.duration_since(*window_start);
        if elapsed >= self.window {
            *count = 1;
            *window_start = now;
            return Ok(());
        }
        if *count >= self.max_requests {
            return Err(self.window - elapsed);
        }
        *count += 1;
        Ok(())
    }

    /// Forget callers whose window has long expired
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let mut requests = self.requests.write().await;
        requests.retain(|_, (_, window_start)| now.duration_since(*window_start) < self.window * 2);
    }

    /// Run `cleanup` every window for the life of the process
    pub fn spawn_cleanup(&self) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter.window.max(Duration::from_secs(1)));
            loop {
                interval.tick().await;
                limiter.cleanup().await;
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct AbuseConfig {
    /// None = rate limiting disabled
    pub rate_limiter: Option<RateLimiter>,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            rate_limiter: Some(RateLimiter::new(30, Duration::from_secs(60))),
        }
    }
}

impl AbuseConfig {
    pub fn disabled() -> Self {
        Self { rate_limiter: None }
    }

    /// `RATE_LIMIT_MAX_REQUESTS=0` turns limiting off
    pub fn from_env() -> Self {
        let max_requests: u32 = std::env::var("RATE_LIMIT_MAX_REQUESTS")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(30);
        let window_secs: u64 = std::env::var("RATE_LIMIT_WINDOW_SECS")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(60);

        tracing::info!(max_requests, window_secs, "Rate limit config loaded");

        if max_requests == 0 {
            tracing::warn!("Rate limiting DISABLED");
            return Self::disabled();
        }
        Self {
            rate_limiter: Some(RateLimiter::new(
                max_requests,
                Duration::from_secs(window_secs),
            )),
        }
    }
}

/// Caller identity if present, else the first forwarded address
fn rate_limit_key(request: &Request<Body>) -> String {
    let header_value = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    if let Some(user) = header_value(USER_HEADER) {
        return format!("user:{}", user);
    }
    if let Some(forwarded) = header_value("x-forwarded-for") {
        if let Some(ip) = forwarded.split(',').next() {
            return format!("ip:{}", ip.trim());
        }
    }
    "anonymous".to_string()
}

fn rate_limited(retry_after: Duration) -> Response<Body> {
    let body = serde_json::json!({
        "error": "rate_limit",
        "message": "Trop de requêtes, veuillez réessayer dans quelques instants.",
    });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let secs = retry_after.as_secs().max(1);
    if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

pub async fn rate_limit_middleware(
    State(config): State<Arc<AbuseConfig>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    if let Some(limiter) = &config.rate_limiter {
        let key = rate_limit_key(&request);
        if let Err(retry_after) = limiter.check(&key).await {
            tracing::warn!(key, path = %request.uri().path(), "Rate limited");
            return rate_limited(retry_after);
        }
    }
    next.run(request).await
}

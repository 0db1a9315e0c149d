use std::sync::{Arc, RwLock};

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AppState;

/// Lifecycle of one middleware snapshot, reflected by the probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Ready,
    Draining,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Starting => "starting",
            Phase::Ready => "ready",
            Phase::Draining => "draining",
        }
    }
}

/// Shared health state. Probes read it; construction and shutdown move it
/// forward.
#[derive(Debug, Clone)]
pub struct Health {
    inner: Arc<RwLock<(Phase, DateTime<Utc>)>>,
}

impl Health {
    pub fn starting() -> Self {
        Self {
            inner: Arc::new(RwLock::new((Phase::Starting, Utc::now()))),
        }
    }

    pub fn set(&self, phase: Phase) {
        let mut guard = self.inner.write().expect("health lock poisoned");
        if guard.0 != phase {
            *guard = (phase, Utc::now());
        }
    }

    pub fn snapshot(&self) -> (Phase, DateTime<Utc>) {
        *self.inner.read().expect("health lock poisoned")
    }
}

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    probe: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    live: bool,
    ready: bool,
    since: DateTime<Utc>,
    detail: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

const RETRY_AFTER_SECS: u64 = 5;

/// `GET <prefix>/health[?probe=live]`. Never requires authentication.
pub async fn health(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> Response {
    let (phase, since) = state.health.snapshot();
    let ready = phase == Phase::Ready;

    // The liveness probe answers 200 for as long as the process runs.
    if query.probe.as_deref() == Some("live") {
        return Json(HealthResponse {
            status: "live",
            live: true,
            ready,
            since,
            detail: "process is up",
            retry_after: None,
        })
        .into_response();
    }

    let (status, detail, retry_after) = match phase {
        Phase::Ready => (StatusCode::OK, "serving traffic", None),
        Phase::Starting => (
            StatusCode::SERVICE_UNAVAILABLE,
            "warming up",
            Some(RETRY_AFTER_SECS),
        ),
        Phase::Draining => (
            StatusCode::SERVICE_UNAVAILABLE,
            "draining connections",
            Some(RETRY_AFTER_SECS),
        ),
    };

    let body = Json(HealthResponse {
        status: phase.as_str(),
        live: true,
        ready,
        since,
        detail,
        retry_after,
    });
    match retry_after {
        Some(secs) => (
            status,
            [(header::RETRY_AFTER, secs.to_string())],
            body,
        )
            .into_response(),
        None => (status, body).into_response(),
    }
}

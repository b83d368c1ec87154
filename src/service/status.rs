use async_trait::async_trait;
use http::{Response, StatusCode};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::{config::Status, core::status};

#[derive(Serialize)]
struct ReadinessBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

/// Readiness probe for the sync loop.
///
/// `GET /status/ready` answers 200 once a full reconcile pass has completed and
/// 503 before that. Individual upstream failures do not affect readiness.
pub struct StatusHttpApp;

impl StatusHttpApp {
    pub fn status_http_service(cfg: &Status) -> Service<Self> {
        let mut service = Service::new("Status HTTP".to_string(), StatusHttpApp);
        service.add_tcp(&cfg.address.to_string());
        service
    }
}

#[async_trait]
impl ServeHttp for StatusHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);
        route(http_session.req_header().uri.path())
    }
}

fn route(path: &str) -> Response<Vec<u8>> {
    match path {
        "/status/ready" => readiness(status::is_ready()),
        _ => plain(StatusCode::NOT_FOUND, b"Not Found"),
    }
}

fn readiness(ready: bool) -> Response<Vec<u8>> {
    let (code, body) = if ready {
        (
            StatusCode::OK,
            ReadinessBody {
                status: "ok",
                error: None,
            },
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            ReadinessBody {
                status: "error",
                error: Some("No reconcile pass has completed yet"),
            },
        )
    };

    let json_body = serde_json::to_vec(&body).unwrap_or_else(|e| {
        log::error!("Failed to serialize readiness response: {e}");
        b"{}".to_vec()
    });
    Response::builder()
        .status(code)
        .header("Content-Type", "application/json")
        .body(json_body)
        .unwrap_or_else(|e| {
            log::error!("Failed to build readiness response: {e}");
            Response::new(Vec::new())
        })
}

fn plain(code: StatusCode, body: &[u8]) -> Response<Vec<u8>> {
    let mut response = Response::new(body.to_vec());
    *response.status_mut() = code;
    response
}

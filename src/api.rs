//! JSON API for managing apps and pushing them into the proxy
//!
//! Every endpoint except `/health` and `/version` requires the bearer token.
//! Writes to the proxy go through the shared [`Reconciler`], so API-triggered
//! syncs and raw config uploads never interleave.

use crate::db::{is_constraint_violation, AppBinding, Database};
use crate::error::{
    json_error_response, json_error_response_with_status, ApiErrorCode, TransportError,
};
use crate::reconcile::Reconciler;
use crate::transport::AdminTransport;
use anyhow::Result;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the service
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body accepted (uploaded configs included)
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_ok<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Full<Bytes>>> {
    Ok(json_response(status, serde_json::to_string(value)?))
}

/// Request to register a new app
#[derive(Debug, Deserialize)]
pub struct CreateAppRequest {
    pub name: String,
    pub domain: String,
    pub port: PortInput,
    #[serde(default, rename = "type")]
    pub app_type: Option<String>,
}

/// A port given either as a JSON number or as a string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortInput {
    Number(u64),
    Text(String),
}

impl PortInput {
    /// Normalized port text, if it names a valid TCP port
    pub fn normalize(&self) -> Option<String> {
        let port = match self {
            PortInput::Number(n) => *n,
            PortInput::Text(s) => s.trim().parse().ok()?,
        };
        (1..=u64::from(u16::MAX))
            .contains(&port)
            .then(|| port.to_string())
    }
}

#[derive(Debug, Serialize)]
struct AppList {
    apps: Vec<AppBinding>,
    count: usize,
}

/// API server for the app registry
pub struct ApiServer<T> {
    db: Arc<Database>,
    reconciler: Arc<Reconciler<T, Database>>,
    auth_token: String,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T> ApiServer<T>
where
    T: AdminTransport + 'static,
{
    pub fn new(
        db: Arc<Database>,
        reconciler: Arc<Reconciler<T, Database>>,
        auth_token: String,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            reconciler,
            auth_token,
            shutdown_rx,
        }
    }

    /// Bind `addr` and serve until shutdown
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn run_on(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    fn check_auth(&self, req: &Request<hyper::body::Incoming>) -> bool {
        req.headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|auth| auth.strip_prefix("Bearer "))
            .map(|token| token == self.auth_token)
            .unwrap_or(false)
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        // Health check - no auth required
        if path == "/health" && method == Method::GET {
            return Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#));
        }

        // Version - no auth required
        if path == "/version" && method == Method::GET {
            let version = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version.to_string()));
        }

        if !self.check_auth(&req) {
            warn!(%path, "Unauthorized API request");
            return Ok(json_error_response(ApiErrorCode::Unauthorized, "unauthorized"));
        }

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        let response = match (&method, segments.as_slice()) {
            (&Method::GET, ["fetch-config"]) => self.fetch_config().await,
            (&Method::POST, ["upload-config"]) => self.upload_config(req).await,
            (&Method::GET, ["apps"]) => self.list_apps(),
            (&Method::POST, ["apps"]) => self.create_app(req).await,
            (&Method::DELETE, ["apps", id]) => match parse_app_id(id) {
                Some(id) => self.delete_app(id),
                None => Ok(invalid_app_id(id)),
            },
            (&Method::POST, ["apps", id, "sync"]) => match parse_app_id(id) {
                Some(id) => self.sync_app(id).await,
                None => Ok(invalid_app_id(id)),
            },
            (&Method::POST, ["sync"]) => self.sync_all().await,
            _ => Ok(json_error_response(ApiErrorCode::NotFound, "Not found")),
        };

        Ok(response.unwrap_or_else(|e| {
            error!(error = %e, "API error");
            json_error_response(ApiErrorCode::InternalError, format!("Internal error: {:#}", e))
        }))
    }

    // ==================== Raw Config ====================

    async fn fetch_config(&self) -> Result<Response<Full<Bytes>>> {
        match self.reconciler.transport().fetch_full_config().await {
            Ok(config) => json_ok(StatusCode::OK, &config),
            Err(e) => {
                warn!(error = %e, "Failed to fetch proxy configuration");
                Ok(transport_error_response(&e))
            }
        }
    }

    async fn upload_config(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        let body = match read_body(req).await {
            Ok(body) => body,
            Err(response) => return Ok(response),
        };

        if let Err(e) = serde_json::from_slice::<serde_json::Value>(&body) {
            return Ok(json_error_response(
                ApiErrorCode::BadRequest,
                format!("Invalid JSON: {}", e),
            ));
        }

        match self.reconciler.load_full_config(body).await {
            Ok(()) => {
                info!("Proxy configuration uploaded");
                Ok(json_response(StatusCode::OK, r#"{"message":"Uploaded"}"#))
            }
            Err(e @ TransportError::Status { .. }) => {
                warn!(error = %e, "Proxy rejected uploaded configuration");
                Ok(json_error_response_with_status(
                    StatusCode::BAD_REQUEST,
                    ApiErrorCode::ProxyRejected,
                    e.remote_message().unwrap_or_default(),
                ))
            }
            Err(e) => {
                warn!(error = %e, "Failed to upload proxy configuration");
                Ok(transport_error_response(&e))
            }
        }
    }

    // ==================== App Management ====================

    fn list_apps(&self) -> Result<Response<Full<Bytes>>> {
        let apps = self.db.list_app_bindings()?;
        let count = apps.len();
        json_ok(StatusCode::OK, &AppList { apps, count })
    }

    async fn create_app(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        let body = match read_body(req).await {
            Ok(body) => body,
            Err(response) => return Ok(response),
        };

        let create_req: CreateAppRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return Ok(json_error_response(
                    ApiErrorCode::BadRequest,
                    format!("Invalid JSON: {}", e),
                ));
            }
        };

        let name = create_req.name.trim();
        if name.is_empty() || name.len() > 64 {
            return Ok(json_error_response(
                ApiErrorCode::BadRequest,
                "App name must be 1-64 characters",
            ));
        }

        let domain = create_req.domain.trim().to_ascii_lowercase();
        if domain.is_empty() || domain.contains(char::is_whitespace) || domain.contains('/') {
            return Ok(json_error_response(ApiErrorCode::BadRequest, "Invalid domain"));
        }

        let Some(port) = create_req.port.normalize() else {
            return Ok(json_error_response(
                ApiErrorCode::BadRequest,
                "Port must be between 1 and 65535",
            ));
        };

        let app_type = create_req
            .app_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());

        let app_id = match self.db.register_app(name, app_type, &domain, &port) {
            Ok(id) => id,
            Err(e) if is_constraint_violation(&e) => {
                return Ok(json_error_response(
                    ApiErrorCode::Conflict,
                    "App name or domain already registered",
                ));
            }
            Err(e) => return Err(e),
        };

        let binding = AppBinding {
            app_id,
            name: name.to_string(),
            app_type: app_type.map(String::from),
            domain: Some(domain),
            port: Some(port),
        };
        json_ok(StatusCode::CREATED, &binding)
    }

    fn delete_app(&self, app_id: i64) -> Result<Response<Full<Bytes>>> {
        if self.db.delete_app(app_id)? {
            info!(app_id, "App deleted");
            Ok(json_response(StatusCode::OK, r#"{"message":"Deleted"}"#))
        } else {
            Ok(json_error_response(
                ApiErrorCode::NotFound,
                format!("App {} not found", app_id),
            ))
        }
    }

    // ==================== Sync ====================

    async fn sync_app(&self, app_id: i64) -> Result<Response<Full<Bytes>>> {
        if self.db.get_app(app_id)?.is_none() {
            return Ok(json_error_response(
                ApiErrorCode::NotFound,
                format!("App {} not found", app_id),
            ));
        }

        match self.reconciler.reconcile(app_id).await {
            Ok(outcome) => json_ok(StatusCode::OK, &outcome),
            Err(e) => {
                warn!(app_id, error = %e, "App sync failed");
                Ok(json_error_response(e.api_code(), e.to_string()))
            }
        }
    }

    async fn sync_all(&self) -> Result<Response<Full<Bytes>>> {
        match self.reconciler.reconcile_all().await {
            Ok(report) => json_ok(StatusCode::OK, &report),
            Err(e) => Ok(json_error_response(e.api_code(), e.to_string())),
        }
    }
}

fn parse_app_id(raw: &str) -> Option<i64> {
    raw.parse().ok().filter(|id| *id > 0)
}

fn invalid_app_id(raw: &str) -> Response<Full<Bytes>> {
    json_error_response(ApiErrorCode::BadRequest, format!("Invalid app id '{}'", raw))
}

fn transport_error_response(err: &TransportError) -> Response<Full<Bytes>> {
    let code = match err {
        TransportError::Status { .. } => ApiErrorCode::ProxyRejected,
        _ => ApiErrorCode::ProxyUnavailable,
    };
    json_error_response(code, err.to_string())
}

/// Collect a request body, answering 413 past [`MAX_BODY_BYTES`]
async fn read_body(req: Request<hyper::body::Incoming>) -> Result<Bytes, Response<Full<Bytes>>> {
    match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(json_error_response_with_status(
                StatusCode::PAYLOAD_TOO_LARGE,
                ApiErrorCode::BadRequest,
                "Request body too large",
            ))
        }
        Err(e) => Err(json_error_response(
            ApiErrorCode::BadRequest,
            format!("Failed to read request body: {}", e),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_input_normalize() {
        let port: PortInput = serde_json::from_str("3000").unwrap();
        assert_eq!(port.normalize().as_deref(), Some("3000"));

        let port: PortInput = serde_json::from_str(r#"" 8080 ""#).unwrap();
        assert_eq!(port.normalize().as_deref(), Some("8080"));

        for bad in ["0", "70000", r#""""#, r#""http""#] {
            let port: PortInput = serde_json::from_str(bad).unwrap();
            assert_eq!(port.normalize(), None, "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_create_app_request() {
        let req: CreateAppRequest = serde_json::from_str(
            r#"{"name": "blog", "domain": "blog.test", "port": "3000", "type": "node"}"#,
        )
        .unwrap();
        assert_eq!(req.name, "blog");
        assert_eq!(req.app_type.as_deref(), Some("node"));

        let req: CreateAppRequest =
            serde_json::from_str(r#"{"name": "blog", "domain": "blog.test", "port": 3000}"#)
                .unwrap();
        assert!(req.app_type.is_none());

        assert!(serde_json::from_str::<CreateAppRequest>(r#"{"name": "blog"}"#).is_err());
    }

    #[test]
    fn test_parse_app_id() {
        assert_eq!(parse_app_id("12"), Some(12));
        assert_eq!(parse_app_id("0"), None);
        assert_eq!(parse_app_id("-3"), None);
        assert_eq!(parse_app_id("abc"), None);
    }
}

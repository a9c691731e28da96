#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use courier_util::realip::{X_FORWARDED_FOR, X_REAL_IP, real_ip};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::server::assign::{Assigner, Assignment, GeoOutcome, LookupRequest};
use crate::server::health::{HealthState, health_response};

const LOOKUP_PREFIX: &str = "/lookup/";

/// Everything a request handler needs, cheap to clone per connection.
#[derive(Clone)]
pub struct AppState {
	pub assigner: Arc<Assigner>,
	pub health: HealthState,
	/// Deadline applied to each lookup's collaborator calls.
	pub request_timeout: Option<Duration>,
}

#[derive(Debug, Serialize)]
struct LookupResp<'a> {
	utc: i64,
	location: &'a str,
	domains: &'a [String],
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
	error: &'a str,
}

/// Accept connections until the listener fails; each connection gets its own task.
pub async fn run_http_server(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
	loop {
		let (stream, peer) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle(req, peer, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				debug!(%peer, error = %err, "http connection error");
			}
		});
	}
}

async fn handle(req: Request<Incoming>, peer: SocketAddr, state: AppState) -> Result<Response<Full<Bytes>>, Infallible> {
	let ip = {
		let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());
		real_ip(header(X_FORWARDED_FOR), header(X_REAL_IP), peer)
	};
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	drop(req);

	Ok(route(&method, &path, ip, &state).await)
}

/// Dispatch one request by method and path.
pub async fn route(method: &Method, path: &str, ip: IpAddr, state: &AppState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return text(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	if let Some((status, body)) = health_response(path, &state.health) {
		return text(status, body);
	}

	let Some(token) = lookup_token(path) else {
		return text(StatusCode::NOT_FOUND, Bytes::new());
	};
	if token.trim().is_empty() {
		return error_json(StatusCode::BAD_REQUEST, "token is required");
	}

	let mut req = LookupRequest::new(token, ip);
	if let Some(timeout) = state.request_timeout {
		req = req.with_deadline(Instant::now() + timeout);
	}

	match state.assigner.assign(&req).await {
		Ok(assignment) => {
			debug!(
				%ip,
				region = %assignment.region,
				idc = %assignment.idc,
				geo_degraded = assignment.geo == GeoOutcome::Degraded,
				"lookup served"
			);
			assignment_json(&assignment)
		}
		Err(e) => {
			warn!(%ip, error = %e, "gateway lookup failed");
			error_json(e.status_code(), &e.to_string())
		}
	}
}

/// `Some("")` for `/lookup` and `/lookup/`, `None` for paths outside the endpoint.
fn lookup_token(path: &str) -> Option<&str> {
	if path == "/lookup" {
		return Some("");
	}
	let token = path.strip_prefix(LOOKUP_PREFIX)?;
	if token.contains('/') {
		return None;
	}
	Some(token)
}

fn assignment_json(assignment: &Assignment) -> Response<Full<Bytes>> {
	let body = LookupResp {
		utc: assignment.utc,
		location: assignment.location.as_str(),
		domains: &assignment.domains,
	};
	match serde_json::to_vec(&body) {
		Ok(bytes) => json(StatusCode::OK, Bytes::from(bytes)),
		Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
	}
}

fn error_json(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
	let body = serde_json::to_vec(&ErrorBody { error: message }).unwrap_or_default();
	json(status, Bytes::from(body))
}

fn json(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = text(status, body);
	resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	resp
}

fn text(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp
}

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::relay::RelayStats;

/// What the health endpoint reports about the relay.
///
/// `/readyz` answers 200 only between [`mark_ready`](Self::mark_ready) and
/// [`mark_not_ready`](Self::mark_not_ready). `/statusz` prints the relay's
/// live counters once they are attached.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	relay: Arc<OnceLock<Arc<RelayStats>>>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	/// Accepting players; counters come from the now-running relay.
	pub fn mark_ready(&self, stats: Arc<RelayStats>) {
		let _ = self.relay.set(stats);
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	fn status_line(&self) -> String {
		let Some(stats) = self.relay.get() else {
			return "relay=starting\n".to_string();
		};
		let session = if stats.session_active() { "active" } else { "idle" };
		format!(
			"relay={} session={} frame={} clients={} ticks={}\n",
			if self.is_ready() { "ready" } else { "draining" },
			session,
			stats.session_frame(),
			stats.active_clients(),
			stats.ticks()
		)
	}
}

/// Bind the health endpoint and serve it in the background.
pub async fn spawn_health_server(bind: SocketAddr, state: HealthState) -> std::io::Result<SocketAddr> {
	let listener = TcpListener::bind(bind).await?;
	let local = listener.local_addr()?;
	tokio::spawn(async move {
		if let Err(err) = serve(listener, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
	Ok(local)
}

async fn serve(listener: TcpListener, state: HealthState) -> std::io::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()));
	}

	let resp = match req.uri().path() {
		"/healthz" => respond(StatusCode::OK, "ok"),
		"/readyz" if state.is_ready() => respond(StatusCode::OK, "ready"),
		"/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "not-ready"),
		"/statusz" => respond(StatusCode::OK, state.status_line()),
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	};
	Ok(resp)
}

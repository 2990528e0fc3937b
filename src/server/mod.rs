pub mod handler;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Extension;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::service::TowerToHyperService;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::RequestBodyTimeoutLayer;

use crate::config::{PortConfig, Protocol, Settings};
use self::handler::{ClientAddr, HandlerState};

/// Read-side socket timeout for every decoy server.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// How long graceful shutdown waits before abandoning in-flight requests.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

const MAX_REQUEST_BODY: usize = 1024 * 1024;

/// Failures that prevent a decoy listener from starting.
#[derive(Debug, Error)]
pub enum StartupError {
	#[error("port {port}: binding listener failed: {source}")]
	Bind {
		port: u16,
		#[source]
		source: std::io::Error,
	},

	#[error("port {port}: tls protocol requires a tls profile")]
	MissingTlsProfile { port: u16 },

	#[error("port {port}: tls profile {profile:?} is not defined")]
	UnknownTlsProfile { port: u16, profile: String },

	#[error("port {port}: tls profile {profile:?} is incomplete")]
	IncompleteTlsProfile { port: u16, profile: String },

	#[error("port {port}: loading tls material failed: {cause}")]
	TlsMaterial { port: u16, cause: anyhow::Error },
}

struct ServerHandle {
	addr: SocketAddr,
	shutdown: watch::Sender<bool>,
}

/// Live decoy servers keyed by port.
///
/// The map is constructed once, before any listener task spawns, and each
/// listener is published under its port right after its socket binds. The
/// shutdown hook therefore always iterates a consistent snapshot instead
/// of racing listener startup.
#[derive(Default)]
pub struct ServerRegistry {
	servers: Mutex<HashMap<u16, ServerHandle>>,
}

impl ServerRegistry {
	fn publish(&self, port: u16, handle: ServerHandle) {
		if let Ok(mut servers) = self.servers.lock() {
			servers.insert(port, handle);
		}
	}

	/// Signal every published server to stop accepting and drain.
	fn shutdown_all(&self) -> usize {
		match self.servers.lock() {
			Ok(servers) => {
				for (port, handle) in servers.iter() {
					debug!("stopping decoy on port {} ({})", port, handle.addr);
					let _ = handle.shutdown.send(true);
				}
				servers.len()
			}
			Err(_) => 0,
		}
	}
}

struct BoundListener {
	protocol: Protocol,
	listener: TcpListener,
	acceptor: Option<TlsAcceptor>,
	local_addr: SocketAddr,
}

fn scheme(protocol: Protocol) -> &'static str {
	match protocol {
		Protocol::Http => "http",
		Protocol::Tls => "https",
	}
}

/// Run one decoy server per configured port until a shutdown signal.
///
/// Every port is attempted even when an earlier one fails; the first
/// observed startup error is returned after all siblings were tried, and
/// listeners that did come up keep serving until the caller exits on it.
pub async fn start(
	settings: &Settings,
	bind_ip: IpAddr,
	shared: HandlerState,
) -> Result<(), StartupError> {
	let (bound, mut errors) = bind_all(settings, bind_ip).await;

	let registry = Arc::new(ServerRegistry::default());
	let mut listeners: JoinSet<()> = JoinSet::new();
	for b in bound {
		let (tx, rx) = watch::channel(false);
		registry.publish(
			b.local_addr.port(),
			ServerHandle {
				addr: b.local_addr,
				shutdown: tx,
			},
		);

		let mut state = shared.clone();
		state.listen_addr = b.local_addr.to_string();
		info!("{} decoy listening on {}", scheme(b.protocol), b.local_addr);
		listeners.spawn(serve(b, state, rx));
	}

	if !errors.is_empty() {
		return Err(errors.remove(0));
	}

	let mut drained = false;
	tokio::select! {
		_ = shutdown_signal() => {}
		_ = async { while listeners.join_next().await.is_some() {} } => {
			drained = true;
		}
	}

	if !drained {
		let count = registry.shutdown_all();
		info!("shutdown signal received, draining {} decoy servers", count);
		let deadline = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
			while listeners.join_next().await.is_some() {}
		});
		if deadline.await.is_err() {
			warn!("shutdown deadline passed, abandoning in-flight requests");
			listeners.shutdown().await;
		}
	}

	Ok(())
}

/// Attempt every configured port, collecting successes and failures
/// separately so one bad port cannot shadow its siblings.
async fn bind_all(
	settings: &Settings,
	bind_ip: IpAddr,
) -> (Vec<BoundListener>, Vec<StartupError>) {
	let mut bound = Vec::new();
	let mut errors = Vec::new();
	for pc in &settings.ports {
		match bind_one(settings, bind_ip, pc).await {
			Ok(b) => bound.push(b),
			Err(e) => {
				error!("{}", e);
				errors.push(e);
			}
		}
	}
	(bound, errors)
}

async fn bind_one(
	settings: &Settings,
	bind_ip: IpAddr,
	pc: &PortConfig,
) -> Result<BoundListener, StartupError> {
	let acceptor = match pc.protocol {
		Protocol::Http => None,
		Protocol::Tls => {
			let name = match pc.tls_profile.as_deref() {
				Some(n) if !n.is_empty() => n,
				_ => return Err(StartupError::MissingTlsProfile { port: pc.port }),
			};
			let profile = settings.tls.get(name).ok_or_else(|| StartupError::UnknownTlsProfile {
				port: pc.port,
				profile: name.to_string(),
			})?;
			if profile.certificate.is_empty() || profile.key.is_empty() {
				return Err(StartupError::IncompleteTlsProfile {
					port: pc.port,
					profile: name.to_string(),
				});
			}
			let acceptor = crate::tls_utils::acceptor_for_profile(profile)
				.map_err(|cause| StartupError::TlsMaterial { port: pc.port, cause })?;
			Some(acceptor)
		}
	};

	let addr = SocketAddr::new(bind_ip, pc.port);
	let listener = TcpListener::bind(addr)
		.await
		.map_err(|source| StartupError::Bind { port: pc.port, source })?;
	let local_addr = listener
		.local_addr()
		.map_err(|source| StartupError::Bind { port: pc.port, source })?;

	Ok(BoundListener {
		protocol: pc.protocol,
		listener,
		acceptor,
		local_addr,
	})
}

/// Accept loop for one decoy port. Runs until its shutdown channel fires,
/// then drains in-flight connections (the supervisor enforces the overall
/// deadline).
async fn serve(bound: BoundListener, state: HandlerState, mut shutdown: watch::Receiver<bool>) {
	let app = handler::decoy_router(state);
	let mut conns: JoinSet<()> = JoinSet::new();

	loop {
		let conn_shutdown = shutdown.clone();
		tokio::select! {
			accepted = bound.listener.accept() => {
				match accepted {
					Ok((stream, peer)) => {
						conns.spawn(serve_connection(
							stream,
							peer,
							bound.acceptor.clone(),
							app.clone(),
							conn_shutdown,
						));
					}
					Err(e) => {
						warn!("accept on {} failed: {}", bound.local_addr, e);
						tokio::time::sleep(Duration::from_millis(100)).await;
					}
				}
			}
			_ = shutdown.changed() => break,
			Some(_) = conns.join_next() => {}
		}
	}

	while conns.join_next().await.is_some() {}
	debug!("listener on {} stopped", bound.local_addr);
}

/// Serve one accepted connection, TLS handshake included, through the
/// hardened tower stack.
async fn serve_connection(
	stream: TcpStream,
	peer: SocketAddr,
	acceptor: Option<TlsAcceptor>,
	app: Router,
	mut shutdown: watch::Receiver<bool>,
) {
	let _ = stream.set_nodelay(true);

	let svc = ServiceBuilder::new()
		// Catch panics in handlers and return a safe response instead of
		// unwinding the task.
		.layer(CatchPanicLayer::new())
		.layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY))
		.layer(RequestBodyTimeoutLayer::new(READ_TIMEOUT))
		.layer(Extension(ClientAddr(peer)))
		.service(app.into_service());
	let hyper_svc = TowerToHyperService::new(svc);

	let mut builder = AutoBuilder::new(TokioExecutor::new());
	builder
		.http1()
		.timer(TokioTimer::new())
		.header_read_timeout(READ_TIMEOUT);

	match acceptor {
		Some(acceptor) => {
			let tls_stream = match acceptor.accept(stream).await {
				Ok(s) => s,
				Err(e) => {
					// Plain-HTTP probes against TLS ports are constant
					// background noise, not worth more than a debug line.
					debug!("TLS handshake with {} failed: {}", peer, e);
					return;
				}
			};
			let conn = builder.serve_connection(TokioIo::new(tls_stream), hyper_svc);
			tokio::pin!(conn);
			tokio::select! {
				res = conn.as_mut() => {
					if let Err(e) = res {
						debug!("connection from {} ended with error: {}", peer, e);
					}
				}
				_ = shutdown.changed() => {
					conn.as_mut().graceful_shutdown();
					let _ = conn.as_mut().await;
				}
			}
		}
		None => {
			let conn = builder.serve_connection(TokioIo::new(stream), hyper_svc);
			tokio::pin!(conn);
			tokio::select! {
				res = conn.as_mut() => {
					if let Err(e) = res {
						debug!("connection from {} ended with error: {}", peer, e);
					}
				}
				_ = shutdown.changed() => {
					conn.as_mut().graceful_shutdown();
					let _ = conn.as_mut().await;
				}
			}
		}
	}
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			error!("installing SIGINT handler failed: {}", e);
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		use tokio::signal::unix::{SignalKind, signal};
		match signal(SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			}
			Err(e) => {
				error!("installing SIGTERM handler failed: {}", e);
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}

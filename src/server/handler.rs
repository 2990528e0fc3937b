use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Extension;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use log::{debug, error, warn};

use crate::cache::{Lookup, ResponseCache};
use crate::enrich::Enricher;
use crate::events::{Event, EventLogger, HttpRequestRecord, HttpResponseRecord};
use crate::llm::{Synthesizer, dump_request};

/// Response headers stripped from the outbound reply. The transport owns
/// framing, and models routinely hallucinate a status line into the
/// header map; the logged event keeps everything verbatim.
pub const IGNORED_RESPONSE_HEADERS: &[&str] = &[
	"content-length",
	"content-type",
	"date",
	"expires",
	"last-modified",
	"http",
	"http/1.0",
	"http/1.1",
	"http/1.2",
	"http/2.0",
];

/// Constant body for every per-request failure; the error itself is only
/// visible server-side.
const FAILURE_BODY: &str = "Internal Server Error";

/// Request bodies past this size are dropped from the record rather than
/// buffered.
const MAX_BODY_BYTES: usize = 1024 * 1024;

fn is_ignored_header(name: &str) -> bool {
	IGNORED_RESPONSE_HEADERS
		.iter()
		.any(|h| name.eq_ignore_ascii_case(h))
}

/// Cache key for a served response.
pub fn cache_key(port: &str, uri: &str) -> String {
	format!("{}_{}", port, uri)
}

/// Port component of the listener address; empty when unparseable, in
/// which case the request is still served.
fn listener_port(listen_addr: &str) -> String {
	listen_addr
		.parse::<SocketAddr>()
		.map(|a| a.port().to_string())
		.unwrap_or_default()
}

/// Source address of the accepted connection, injected per connection by
/// the listener.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Shared context for the catch-all handler. One instance per listener;
/// everything except `listen_addr` is shared across all listeners.
#[derive(Clone)]
pub struct HandlerState {
	pub listen_addr: String,
	pub sensor_name: String,
	pub cache: ResponseCache,
	pub synthesizer: Arc<dyn Synthesizer>,
	pub enricher: Arc<Enricher>,
	pub logger: EventLogger,
}

/// Router serving every method and path through [`handle`].
pub fn decoy_router(state: HandlerState) -> Router {
	Router::new().fallback(handle).with_state(state)
}

/// Serve one probe: replay the cached response for `(port, uri)` or
/// synthesize, store, and serve a fresh one, then record the interaction.
pub async fn handle(
	State(state): State<HandlerState>,
	Extension(client): Extension<ClientAddr>,
	req: Request<Body>,
) -> Response {
	let arrival = Utc::now();
	let port = listener_port(&state.listen_addr);

	let (parts, body) = req.into_parts();
	let body = to_bytes(body, MAX_BODY_BYTES).await.unwrap_or_default();

	let key = cache_key(&port, &parts.uri.to_string());

	let blob = match state.cache.get(&key, arrival).await {
		Ok(Lookup::Hit(blob)) => {
			debug!("cache hit for {}", key);
			blob
		}
		Ok(Lookup::Miss) | Ok(Lookup::Expired) => {
			match synthesize(&state, &key, &parts, &body, arrival).await {
				Some(blob) => blob,
				None => return failure_reply(),
			}
		}
		Err(e) => {
			error!("cache lookup for {} failed: {}", key, e);
			return failure_reply();
		}
	};

	let record: HttpResponseRecord = match serde_json::from_slice(&blob) {
		Ok(r) => r,
		Err(e) => {
			error!("synthesized response for {} is not a valid response object: {}", key, e);
			return failure_reply();
		}
	};

	let reply = build_reply(&record);

	// The attacker-visible reply must not wait on enrichment or the event
	// append; those finish on a detached task.
	let request_record = HttpRequestRecord::from_parts(&parts, &body);
	tokio::spawn(record_event(state, client.0, port, request_record, record));

	reply
}

/// Cache-miss path: ask the model, then remember the answer. Returns
/// `None` when synthesis failed and the caller must serve the constant
/// failure reply (and skip the event).
async fn synthesize(
	state: &HandlerState,
	key: &str,
	parts: &Parts,
	body: &[u8],
	arrival: chrono::DateTime<Utc>,
) -> Option<Vec<u8>> {
	let dump = dump_request(parts, body);
	let started = Instant::now();
	let text = match state.synthesizer.generate(&dump).await {
		Ok(t) => t,
		Err(e) => {
			error!("response synthesis for {} failed: {}", key, e);
			return None;
		}
	};
	debug!("synthesized {} in {:?}", key, started.elapsed());

	let blob = text.into_bytes();
	// A lost write only costs one extra synthesis later; serve the
	// response we already paid for.
	if let Err(e) = state.cache.put(key, &blob, arrival).await {
		warn!("caching response for {} failed: {}", key, e);
	}
	Some(blob)
}

/// Build the outbound reply from the model's response object, filtering
/// the ignored header set. Header names or values the HTTP layer rejects
/// are dropped; model output never aborts the reply.
fn build_reply(record: &HttpResponseRecord) -> Response {
	let mut reply = Response::new(Body::from(record.body.clone()));
	for (name, value) in &record.headers {
		if is_ignored_header(name) {
			continue;
		}
		let header_name = match HeaderName::from_bytes(name.as_bytes()) {
			Ok(n) => n,
			Err(_) => {
				warn!("dropping unservable response header name {:?}", name);
				continue;
			}
		};
		let header_value = match HeaderValue::from_str(value) {
			Ok(v) => v,
			Err(_) => {
				warn!("dropping unservable value for response header {:?}", name);
				continue;
			}
		};
		reply.headers_mut().append(header_name, header_value);
	}
	reply
}

fn failure_reply() -> Response {
	(StatusCode::INTERNAL_SERVER_ERROR, FAILURE_BODY).into_response()
}

/// Enrich the source address and append the event. Runs after the reply;
/// every failure here degrades to partial data rather than an error.
async fn record_event(
	state: HandlerState,
	peer: SocketAddr,
	port: String,
	http_request: HttpRequestRecord,
	http_response: HttpResponseRecord,
) {
	let src_ip = peer.ip().to_string();
	let mut src_host = String::new();
	let mut tags = Vec::new();

	match state.enricher.process(peer.ip()).await {
		Ok(info) => {
			src_host = info.host;
			if !info.known_scanner.is_empty() {
				tags.push(info.known_scanner);
			}
		}
		Err(e) => warn!("enrichment for {} failed: {}", src_ip, e),
	}

	let event = Event {
		timestamp: Utc::now(),
		src_ip,
		src_host,
		src_port: peer.port().to_string(),
		tags,
		sensor_name: state.sensor_name.clone(),
		port,
		http_request,
		http_response,
	};

	debug!(
		"recording {} {} from {}",
		event.http_request.method, event.http_request.request_uri, event.src_ip
	);
	state.logger.write(&event).await;
}

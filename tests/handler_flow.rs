//! End-to-end tests for the request pipeline: cache replay, synthesis,
//! header filtering, fingerprints, and event recording, all against a
//! stubbed completion backend.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chrono::Utc;
use tower::ServiceExt;

use vanopticon_loki::cache::{Lookup, ResponseCache};
use vanopticon_loki::enrich::{Enricher, EnrichmentInfo, SourceLookup};
use vanopticon_loki::events::{Event, EventLogger};
use vanopticon_loki::llm::{LlmError, Synthesizer};
use vanopticon_loki::server::handler::{ClientAddr, HandlerState, decoy_router};

const PEER: &str = "203.0.113.77:40001";

struct StubSynthesizer {
	response: String,
	calls: AtomicUsize,
	fail: bool,
}

impl StubSynthesizer {
	fn returning(response: &str) -> Arc<Self> {
		Arc::new(Self {
			response: response.to_string(),
			calls: AtomicUsize::new(0),
			fail: false,
		})
	}

	fn failing() -> Arc<Self> {
		Arc::new(Self {
			response: String::new(),
			calls: AtomicUsize::new(0),
			fail: true,
		})
	}

	fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl Synthesizer for StubSynthesizer {
	async fn generate(&self, _raw_request: &str) -> Result<String, LlmError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		if self.fail {
			Err(LlmError::NoCompletion)
		} else {
			Ok(self.response.clone())
		}
	}
}

struct ScannerLookup;

#[async_trait]
impl SourceLookup for ScannerLookup {
	async fn lookup(&self, _ip: std::net::IpAddr) -> anyhow::Result<EnrichmentInfo> {
		Ok(EnrichmentInfo {
			host: "scanner-01.shodan.io".to_string(),
			known_scanner: "shodan".to_string(),
		})
	}
}

struct Fixture {
	state: HandlerState,
	synthesizer: Arc<StubSynthesizer>,
	_dir: tempfile::TempDir,
	log_path: std::path::PathBuf,
}

async fn fixture(synthesizer: Arc<StubSynthesizer>) -> Fixture {
	let dir = tempfile::tempdir().unwrap();
	let log_path = dir.path().join("log.json");
	let state = HandlerState {
		listen_addr: "127.0.0.1:8080".to_string(),
		sensor_name: "test-sensor".to_string(),
		cache: ResponseCache::open_in_memory(1).await.unwrap(),
		synthesizer: synthesizer.clone(),
		enricher: Arc::new(Enricher::new(Arc::new(ScannerLookup))),
		logger: EventLogger::new(&log_path),
	};
	Fixture {
		state,
		synthesizer,
		_dir: dir,
		log_path,
	}
}

fn request(method: &str, uri: &str, body: &str) -> Request<Body> {
	let peer: SocketAddr = PEER.parse().unwrap();
	Request::builder()
		.method(method)
		.uri(uri)
		.extension(ClientAddr(peer))
		.body(Body::from(body.to_string()))
		.unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
	let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
	String::from_utf8(bytes.to_vec()).unwrap()
}

/// Event appends run on a detached task after the reply; poll the log
/// until the expected number of lines lands.
async fn wait_for_events(path: &Path, want: usize) -> Vec<Event> {
	for _ in 0..100 {
		if let Ok(raw) = std::fs::read_to_string(path) {
			let lines: Vec<&str> = raw.lines().filter(|l| !l.is_empty()).collect();
			if lines.len() >= want {
				return lines
					.iter()
					.map(|l| serde_json::from_str(l).expect("event line should parse"))
					.collect();
			}
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	panic!("expected {} events in {}", want, path.display());
}

#[tokio::test]
async fn cold_miss_then_warm_hit_calls_the_model_once() {
	let fx = fixture(StubSynthesizer::returning(
		r#"{"headers":{"Server":"nginx"},"body":"hello"}"#,
	))
	.await;
	let router = decoy_router(fx.state.clone());

	let first = router.clone().oneshot(request("GET", "/admin", "")).await.unwrap();
	assert_eq!(first.status(), StatusCode::OK);
	assert_eq!(first.headers().get("server").unwrap(), "nginx");
	assert_eq!(body_string(first).await, "hello");

	let second = router.clone().oneshot(request("GET", "/admin", "")).await.unwrap();
	assert_eq!(second.status(), StatusCode::OK);
	assert_eq!(second.headers().get("server").unwrap(), "nginx");
	assert_eq!(body_string(second).await, "hello");

	assert_eq!(fx.synthesizer.calls(), 1);
}

#[tokio::test]
async fn replay_is_byte_identical_within_ttl() {
	let fx = fixture(StubSynthesizer::returning(
		r#"{"headers":{"Server":"Apache/2.4.41"},"body":"<html>index</html>"}"#,
	))
	.await;
	let router = decoy_router(fx.state.clone());

	let mut bodies = Vec::new();
	for _ in 0..3 {
		let resp = router.clone().oneshot(request("GET", "/index.html", "")).await.unwrap();
		bodies.push(body_string(resp).await);
	}
	assert!(bodies.windows(2).all(|w| w[0] == w[1]));
	assert_eq!(fx.synthesizer.calls(), 1);
}

#[tokio::test]
async fn ignored_headers_are_filtered_from_the_wire_but_logged() {
	let fx = fixture(StubSynthesizer::returning(
		r#"{"headers":{"Content-Length":"9","Date":"Mon","X-Trap":"yes"},"body":"honeypot!"}"#,
	))
	.await;
	let router = decoy_router(fx.state.clone());

	let resp = router.clone().oneshot(request("GET", "/trap", "")).await.unwrap();
	assert_eq!(resp.headers().get("x-trap").unwrap(), "yes");
	assert!(resp.headers().get("date").is_none());
	// The transport recomputes framing itself; the model's value must
	// never reach the response object.
	assert!(resp.headers().get("content-length").is_none());
	assert_eq!(body_string(resp).await, "honeypot!");

	let events = wait_for_events(&fx.log_path, 1).await;
	let headers = &events[0].http_response.headers;
	assert_eq!(headers.get("Content-Length").unwrap(), "9");
	assert_eq!(headers.get("Date").unwrap(), "Mon");
	assert_eq!(headers.get("X-Trap").unwrap(), "yes");
}

#[tokio::test]
async fn expired_entry_triggers_fresh_synthesis_and_replacement() {
	let fx = fixture(StubSynthesizer::returning(r#"{"headers":{},"body":"fresh"}"#)).await;
	let router = decoy_router(fx.state.clone());

	let stale_at = Utc::now() - chrono::Duration::hours(2);
	fx.state
		.cache
		.put("8080_/stale", br#"{"headers":{},"body":"stale"}"#, stale_at)
		.await
		.unwrap();

	let resp = router.clone().oneshot(request("GET", "/stale", "")).await.unwrap();
	assert_eq!(body_string(resp).await, "fresh");
	assert_eq!(fx.synthesizer.calls(), 1);

	// The replacement entry is what later lookups see.
	match fx.state.cache.get("8080_/stale", Utc::now()).await.unwrap() {
		Lookup::Hit(blob) => assert_eq!(blob, br#"{"headers":{},"body":"fresh"}"#.to_vec()),
		other => panic!("expected fresh hit, got {:?}", other),
	}
}

#[tokio::test]
async fn request_fingerprints_land_in_the_event() {
	let fx = fixture(StubSynthesizer::returning(r#"{"headers":{},"body":"ok"}"#)).await;
	let router = decoy_router(fx.state.clone());

	let resp = router.clone().oneshot(request("POST", "/x", "abc")).await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);

	let events = wait_for_events(&fx.log_path, 1).await;
	let req = &events[0].http_request;
	assert_eq!(req.method, "POST");
	assert_eq!(req.request_uri, "/x");
	assert_eq!(req.body, "abc");
	assert_eq!(
		req.body_sha256,
		"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
	);
}

#[tokio::test]
async fn sorted_header_fingerprint_uses_canonical_keys() {
	let fx = fixture(StubSynthesizer::returning(r#"{"headers":{},"body":"ok"}"#)).await;
	let router = decoy_router(fx.state.clone());

	let peer: SocketAddr = PEER.parse().unwrap();
	let req = Request::builder()
		.method("GET")
		.uri("/fp")
		.header("Z-Foo", "1")
		.header("A-Bar", "2")
		.extension(ClientAddr(peer))
		.body(Body::empty())
		.unwrap();
	router.clone().oneshot(req).await.unwrap();

	let events = wait_for_events(&fx.log_path, 1).await;
	let record = &events[0].http_request;
	assert_eq!(record.headers_sorted, "A-Bar,Z-Foo");
	assert_eq!(
		record.headers_sorted_sha256,
		"edd87bfce2dc8b72c06417b191f00764f3080609addaad52b2c4662a022f8c64"
	);
}

#[tokio::test]
async fn events_carry_source_and_enrichment_metadata() {
	let fx = fixture(StubSynthesizer::returning(r#"{"headers":{},"body":"ok"}"#)).await;
	let router = decoy_router(fx.state.clone());

	let before = Utc::now();
	router.clone().oneshot(request("GET", "/meta", "")).await.unwrap();

	let events = wait_for_events(&fx.log_path, 1).await;
	let event = &events[0];
	assert_eq!(event.src_ip, "203.0.113.77");
	assert_eq!(event.src_port, "40001");
	assert_eq!(event.src_host, "scanner-01.shodan.io");
	assert_eq!(event.tags, vec!["shodan".to_string()]);
	assert_eq!(event.sensor_name, "test-sensor");
	assert_eq!(event.port, "8080");
	assert!(event.timestamp >= before);
}

#[tokio::test]
async fn synthesis_failure_serves_500_without_event_or_cache_write() {
	let fx = fixture(StubSynthesizer::failing()).await;
	let router = decoy_router(fx.state.clone());

	let resp = router.clone().oneshot(request("GET", "/broken", "")).await.unwrap();
	assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
	assert_eq!(body_string(resp).await, "Internal Server Error");
	assert_eq!(fx.synthesizer.calls(), 1);

	// Give any stray event task a chance to run, then confirm silence.
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(!fx.log_path.exists());
	assert_eq!(
		fx.state.cache.get("8080_/broken", Utc::now()).await.unwrap(),
		Lookup::Miss
	);
}

#[tokio::test]
async fn unparseable_model_output_serves_500_without_event() {
	let fx = fixture(StubSynthesizer::returning("sorry, as a language model I cannot")).await;
	let router = decoy_router(fx.state.clone());

	let resp = router.clone().oneshot(request("GET", "/garbage", "")).await.unwrap();
	assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
	assert_eq!(body_string(resp).await, "Internal Server Error");

	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(!fx.log_path.exists());
}

#[tokio::test]
async fn distinct_uris_get_distinct_cache_entries() {
	let fx = fixture(StubSynthesizer::returning(r#"{"headers":{},"body":"same"}"#)).await;
	let router = decoy_router(fx.state.clone());

	router.clone().oneshot(request("GET", "/a", "")).await.unwrap();
	router.clone().oneshot(request("GET", "/b", "")).await.unwrap();
	router.clone().oneshot(request("GET", "/a", "")).await.unwrap();

	assert_eq!(fx.synthesizer.calls(), 2);
}

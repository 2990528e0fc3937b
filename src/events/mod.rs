use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::http::header::USER_AGENT;
use axum::http::request::Parts;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
	Sha256::digest(data)
		.iter()
		.map(|b| format!("{:02x}", b))
		.collect()
}

/// Restore a header key to canonical MIME case (`x-real-ip` becomes
/// `X-Real-Ip`). The HTTP layer lowercases names on ingest; fingerprints
/// are computed over the canonical wire form.
pub fn canonical_header_key(name: &str) -> String {
	let mut out = String::with_capacity(name.len());
	let mut upper = true;
	for c in name.chars() {
		if upper {
			out.extend(c.to_uppercase());
		} else {
			out.extend(c.to_lowercase());
		}
		upper = c == '-';
	}
	out
}

/// Everything recorded about one inbound request, fingerprints included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestRecord {
	pub method: String,
	pub protocol_version: String,
	#[serde(rename = "requestURI")]
	pub request_uri: String,
	pub user_agent: String,
	pub headers_joined: String,
	pub headers_sorted: String,
	pub headers_sorted_sha256: String,
	pub body: String,
	pub body_sha256: String,
}

impl HttpRequestRecord {
	/// Extract the record from decomposed request parts and the buffered
	/// body bytes.
	pub fn from_parts(parts: &Parts, body: &[u8]) -> Self {
		let mut keys: Vec<String> = parts
			.headers
			.keys()
			.map(|k| canonical_header_key(k.as_str()))
			.collect();
		keys.sort();

		let joined = keys
			.iter()
			.map(|key| {
				let values = parts
					.headers
					.get_all(key.to_ascii_lowercase())
					.iter()
					.map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
					.collect::<Vec<_>>()
					.join(", ");
				format!("{}: {}", key, values)
			})
			.collect::<Vec<_>>()
			.join("\n");

		let sorted = keys.join(",");
		let sorted_sha256 = sha256_hex(sorted.as_bytes());

		let user_agent = parts
			.headers
			.get(USER_AGENT)
			.map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
			.unwrap_or_default();

		Self {
			method: parts.method.to_string(),
			protocol_version: format!("{:?}", parts.version),
			request_uri: parts.uri.to_string(),
			user_agent,
			headers_joined: joined,
			headers_sorted: sorted,
			headers_sorted_sha256: sorted_sha256,
			body: String::from_utf8_lossy(body).into_owned(),
			body_sha256: sha256_hex(body),
		}
	}
}

/// The response shape the model is asked to produce. Parsed from the
/// completion text; absent fields default to empty so the handler can
/// serve whatever subset the model managed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponseRecord {
	#[serde(default)]
	pub headers: BTreeMap<String, String>,
	#[serde(default)]
	pub body: String,
}

/// One served interaction, as appended to the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
	pub timestamp: DateTime<Utc>,
	#[serde(rename = "srcIP")]
	pub src_ip: String,
	pub src_host: String,
	pub src_port: String,
	pub tags: Vec<String>,
	pub sensor_name: String,
	pub port: String,
	pub http_request: HttpRequestRecord,
	pub http_response: HttpResponseRecord,
}

/// Append-only, line-delimited JSON event sink.
///
/// Each write opens the file in append mode, writes one line, and closes
/// it again; `O_APPEND` keeps concurrent appenders line-atomic. Failures
/// are logged and dropped so telemetry can never stall request serving.
#[derive(Debug, Clone)]
pub struct EventLogger {
	path: PathBuf,
}

impl EventLogger {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub async fn write(&self, event: &Event) {
		let mut line = match serde_json::to_vec(event) {
			Ok(v) => v,
			Err(e) => {
				warn!("serializing event failed: {}", e);
				return;
			}
		};
		line.push(b'\n');

		let file = tokio::fs::OpenOptions::new()
			.append(true)
			.create(true)
			.open(&self.path)
			.await;
		match file {
			Ok(mut f) => {
				if let Err(e) = f.write_all(&line).await {
					warn!("appending event to {} failed: {}", self.path.display(), e);
				}
			}
			Err(e) => {
				warn!("opening event log {} failed: {}", self.path.display(), e);
			}
		}
	}
}

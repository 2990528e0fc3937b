use std::time::Duration;

use async_trait::async_trait;
use axum::http::request::Parts;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{PROMPT_SLOT, Settings};
use crate::events::canonical_header_key;

/// Fixed system message sent with every completion call.
pub const SYSTEM_PROMPT: &str = "Be precise and concise.";

/// Hard deadline on the completion call so a stalled endpoint can never
/// pin a handler for the life of the connection.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the completion path.
#[derive(Debug, Error)]
pub enum LlmError {
	#[error("completion transport failed: {0}")]
	Transport(#[from] reqwest::Error),

	#[error("completion endpoint returned {0}")]
	Status(StatusCode),

	#[error("completion contained no choices")]
	NoCompletion,

	#[error("malformed completion payload: {0}")]
	Decode(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct ChatMessage<'a> {
	role: &'a str,
	content: &'a str,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
	model: &'a str,
	messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct CompletionResponse {
	#[serde(default)]
	choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
	message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
	#[serde(default)]
	content: String,
}

/// Anything that can turn a raw request dump into response text. The
/// production implementation is [`LlmClient`]; tests substitute stubs.
#[async_trait]
pub trait Synthesizer: Send + Sync {
	async fn generate(&self, raw_request: &str) -> Result<String, LlmError>;
}

/// Render an inbound request back into wire form for the prompt.
pub fn dump_request(parts: &Parts, body: &[u8]) -> String {
	let mut out = format!("{} {} {:?}\r\n", parts.method, parts.uri, parts.version);
	for (name, value) in parts.headers.iter() {
		out.push_str(&format!(
			"{}: {}\r\n",
			canonical_header_key(name.as_str()),
			String::from_utf8_lossy(value.as_bytes())
		));
	}
	out.push_str("\r\n");
	out.push_str(&String::from_utf8_lossy(body));
	out
}

/// Client for a chat-completions endpoint.
///
/// Sends one system + one user message per call and returns the first
/// choice's trimmed content. The returned text is NOT validated here;
/// deciding whether it parses as a servable response is the handler's
/// concern.
pub struct LlmClient {
	http: reqwest::Client,
	api_url: String,
	api_key: String,
	model: String,
	prompt_template: String,
}

impl LlmClient {
	pub fn new(settings: &Settings) -> Result<Self, LlmError> {
		let http = reqwest::Client::builder()
			.timeout(COMPLETION_TIMEOUT)
			.build()?;
		Ok(Self {
			http,
			api_url: settings.api_url.clone(),
			api_key: settings.api_key.clone(),
			model: settings.model.clone(),
			prompt_template: settings.prompt_template.clone(),
		})
	}

	fn user_prompt(&self, raw_request: &str) -> String {
		self.prompt_template.replacen(PROMPT_SLOT, raw_request, 1)
	}
}

#[async_trait]
impl Synthesizer for LlmClient {
	async fn generate(&self, raw_request: &str) -> Result<String, LlmError> {
		let prompt = self.user_prompt(raw_request);
		let request = CompletionRequest {
			model: &self.model,
			messages: vec![
				ChatMessage {
					role: "system",
					content: SYSTEM_PROMPT,
				},
				ChatMessage {
					role: "user",
					content: &prompt,
				},
			],
		};

		let response = self
			.http
			.post(&self.api_url)
			.header(reqwest::header::ACCEPT, "application/json")
			.bearer_auth(&self.api_key)
			.json(&request)
			.send()
			.await?;

		let status = response.status();
		if !status.is_success() {
			return Err(LlmError::Status(status));
		}

		let payload = response.bytes().await?;
		let completion: CompletionResponse = serde_json::from_slice(&payload)?;
		let first = completion
			.choices
			.into_iter()
			.next()
			.ok_or(LlmError::NoCompletion)?;
		Ok(first.message.content.trim().to_string())
	}
}

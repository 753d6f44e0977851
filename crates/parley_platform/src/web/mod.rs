#![forbid(unsafe_code)]

use std::time::Duration;

use parley_domain::{ChannelId, UserId};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::{ApiError, HistoryPage, HistoryRange, RemoteChannel, RemoteUser, RtmStart, SecretString, WebApi};

pub const DEFAULT_BASE_URL: &str = "https://slack.com/api/";

const CHANNELS_LIST: &str = "channels.list";
const CHANNELS_INFO: &str = "channels.info";
const CHANNELS_HISTORY: &str = "channels.history";
const USERS_LIST: &str = "users.list";
const USERS_INFO: &str = "users.info";
const RTM_START: &str = "rtm.start";

/// Upper bound on a server-provided `Retry-After`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER));
	}
	None
}

/// Send once; retry a single time on 429 (honouring `Retry-After`) or 5xx.
async fn send_with_retry(req: reqwest::RequestBuilder, method: &'static str) -> Result<reqwest::Response, ApiError> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.map_err(|source| ApiError::Http { method, source })?;
	let status = resp.status();

	let delay = if status == StatusCode::TOO_MANY_REQUESTS {
		retry_delay_from_headers(resp.headers())
	} else if status.is_server_error() {
		Some(Duration::from_millis(250))
	} else {
		None
	};

	match (delay, retry_builder) {
		(Some(delay), Some(retry)) => {
			warn!(method, %status, ?delay, "retrying once");
			tokio::time::sleep(delay).await;
			retry.send().await.map_err(|source| ApiError::Http { method, source })
		}
		_ => Ok(resp),
	}
}

#[derive(Debug, Deserialize)]
struct Envelope {
	ok: bool,
	#[serde(default)]
	error: Option<String>,
}

/// Check the `ok` flag, then decode the method-specific payload from the same body.
pub(crate) fn decode_envelope<T: DeserializeOwned>(method: &'static str, status: u16, body: &str) -> Result<T, ApiError> {
	if !(200..300).contains(&status) {
		return Err(ApiError::Status { method, status });
	}
	let envelope: Envelope = serde_json::from_str(body).map_err(|source| ApiError::Decode { method, source })?;
	if !envelope.ok {
		return Err(ApiError::NotOk {
			method,
			error: envelope.error,
		});
	}
	serde_json::from_str(body).map_err(|source| ApiError::Decode { method, source })
}

#[derive(Debug, Deserialize)]
struct ChannelsListBody {
	#[serde(default)]
	channels: Vec<RemoteChannel>,
}

#[derive(Debug, Deserialize)]
struct ChannelInfoBody {
	channel: RemoteChannel,
}

#[derive(Debug, Deserialize)]
struct UsersListBody {
	#[serde(default)]
	members: Vec<RemoteUser>,
}

#[derive(Debug, Deserialize)]
struct UserInfoBody {
	user: RemoteUser,
}

/// Token-authenticated client for the remote web API.
#[derive(Clone, Debug)]
pub struct WebApiClient {
	http: reqwest::Client,
	base_url: Url,
	token: SecretString,
}

impl WebApiClient {
	pub fn new(base_url: &str, token: SecretString, timeout: Duration) -> Result<Self, ApiError> {
		let base_url = parse_base_url(base_url)?;
		let http = reqwest::Client::builder()
			.user_agent("parley/0.x")
			.timeout(timeout)
			.build()
			.map_err(|source| ApiError::Http { method: "client", source })?;

		Ok(Self { http, base_url, token })
	}

	pub fn base_url(&self) -> &Url {
		&self.base_url
	}

	fn method_url(&self, method: &'static str, params: &[(&str, &str)]) -> Result<Url, ApiError> {
		method_url(&self.base_url, method, &self.token, params)
	}

	async fn call<T: DeserializeOwned>(&self, method: &'static str, params: &[(&str, &str)]) -> Result<T, ApiError> {
		let url = self.method_url(method, params)?;
		debug!(method, "web api call");

		let resp = send_with_retry(self.http.get(url), method).await?;
		let status = resp.status().as_u16();
		let body = resp.text().await.map_err(|source| ApiError::Http { method, source })?;
		decode_envelope(method, status, &body)
	}
}

fn parse_base_url(raw: &str) -> Result<Url, ApiError> {
	let trimmed = raw.trim();
	let normalized = if trimmed.ends_with('/') {
		trimmed.to_string()
	} else {
		format!("{trimmed}/")
	};
	let url = Url::parse(&normalized).map_err(|e| ApiError::InvalidUrl(format!("{trimmed}: {e}")))?;
	if url.cannot_be_a_base() {
		return Err(ApiError::InvalidUrl(trimmed.to_string()));
	}
	Ok(url)
}

/// `<base><method>?token=...&<params>`
pub(crate) fn method_url(
	base: &Url,
	method: &'static str,
	token: &SecretString,
	params: &[(&str, &str)],
) -> Result<Url, ApiError> {
	let mut url = base
		.join(method)
		.map_err(|e| ApiError::InvalidUrl(format!("{method}: {e}")))?;
	{
		let mut q = url.query_pairs_mut();
		q.append_pair("token", token.expose());
		for (k, v) in params {
			q.append_pair(k, v);
		}
	}
	Ok(url)
}

#[async_trait::async_trait]
impl WebApi for WebApiClient {
	async fn list_channels(&self) -> Result<Vec<RemoteChannel>, ApiError> {
		let body: ChannelsListBody = self.call(CHANNELS_LIST, &[]).await?;
		Ok(body.channels)
	}

	async fn channel_info(&self, id: &ChannelId) -> Result<RemoteChannel, ApiError> {
		let body: ChannelInfoBody = self.call(CHANNELS_INFO, &[("channel", id.as_str())]).await?;
		Ok(body.channel)
	}

	async fn list_users(&self) -> Result<Vec<RemoteUser>, ApiError> {
		let body: UsersListBody = self.call(USERS_LIST, &[]).await?;
		Ok(body.members)
	}

	async fn user_info(&self, id: &UserId) -> Result<RemoteUser, ApiError> {
		let body: UserInfoBody = self.call(USERS_INFO, &[("user", id.as_str())]).await?;
		Ok(body.user)
	}

	async fn history_page(&self, channel: &ChannelId, range: &HistoryRange) -> Result<HistoryPage, ApiError> {
		let mut params = vec![("channel", channel.as_str())];
		if let Some(latest) = &range.latest {
			params.push(("latest", latest.as_str()));
		}
		if let Some(oldest) = &range.oldest {
			params.push(("oldest", oldest.as_str()));
		}
		self.call(CHANNELS_HISTORY, &params).await
	}

	async fn rtm_start(&self) -> Result<RtmStart, ApiError> {
		self.call(RTM_START, &[]).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn method_url_carries_token_and_params() {
		let base = parse_base_url("https://example.test/api").unwrap();
		let token = SecretString::new("xoxp-1");
		let url = method_url(&base, CHANNELS_HISTORY, &token, &[("channel", "C1"), ("latest", "12.5")]).unwrap();
		assert_eq!(url.path(), "/api/channels.history");
		let pairs: Vec<(String, String)> = url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
		assert_eq!(
			pairs,
			vec![
				("token".to_string(), "xoxp-1".to_string()),
				("channel".to_string(), "C1".to_string()),
				("latest".to_string(), "12.5".to_string()),
			]
		);
	}

	#[test]
	fn base_url_rejects_garbage() {
		assert!(matches!(parse_base_url("not a url"), Err(ApiError::InvalidUrl(_))));
	}

	#[test]
	fn envelope_not_ok_surfaces_error_code() {
		let err = decode_envelope::<ChannelsListBody>(CHANNELS_LIST, 200, r#"{"ok":false,"error":"invalid_auth"}"#)
			.expect_err("not ok");
		match err {
			ApiError::NotOk { method, error } => {
				assert_eq!(method, CHANNELS_LIST);
				assert_eq!(error.as_deref(), Some("invalid_auth"));
			}
			other => panic!("expected NotOk, got: {other:?}"),
		}
	}

	#[test]
	fn envelope_status_checked_before_body() {
		let err = decode_envelope::<ChannelsListBody>(CHANNELS_LIST, 502, "<html>").expect_err("bad status");
		assert!(matches!(err, ApiError::Status { status: 502, .. }));
	}

	#[test]
	fn decodes_channel_listing() {
		let body = r#"{"ok":true,"channels":[{"id":"C1","name":"general","is_member":true},{"id":"C2","name":"random"}]}"#;
		let parsed: ChannelsListBody = decode_envelope(CHANNELS_LIST, 200, body).unwrap();
		assert_eq!(parsed.channels.len(), 2);
		assert_eq!(parsed.channels[0].name, "general");
		assert!(parsed.channels[0].is_member);
		assert!(!parsed.channels[1].is_member);
	}

	#[test]
	fn decodes_history_page_with_bot_message() {
		let body = r#"{"ok":true,"has_more":true,"messages":[
			{"type":"message","user":"U1","text":"hi","ts":"2.000001"},
			{"type":"message","subtype":"bot_message","username":"deploybot","text":"shipped","ts":"1.000001"}
		]}"#;
		let page: HistoryPage = decode_envelope(CHANNELS_HISTORY, 200, body).unwrap();
		assert!(page.has_more);
		assert_eq!(page.messages.len(), 2);
		assert_eq!(page.messages[0].user.as_ref().map(|u| u.as_str()), Some("U1"));
		assert_eq!(page.messages[1].user, None);
		assert_eq!(page.messages[1].username.as_deref(), Some("deploybot"));
	}

	#[test]
	fn decodes_rtm_start_with_self() {
		let body = r#"{"ok":true,"url":"wss://example.test/ws","self":{"id":"U9","name":"op"},
			"users":[{"id":"U1","name":"alice"}],"channels":[{"id":"C1","name":"general"}]}"#;
		let start: RtmStart = decode_envelope(RTM_START, 200, body).unwrap();
		assert_eq!(start.url, "wss://example.test/ws");
		assert_eq!(start.self_info.map(|s| s.name), Some("op".to_string()));
		assert_eq!(start.users.len(), 1);
		assert_eq!(start.channels.len(), 1);
	}
}

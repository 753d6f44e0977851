#![forbid(unsafe_code)]

pub mod rtm;
pub mod web;

use std::fmt;

use parley_domain::{ChannelId, ChannelRecord, Timestamp, UserId, UserRecord};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Failures talking to the remote web API.
#[derive(Debug, Error)]
pub enum ApiError {
	/// The request could not be sent or its body could not be read.
	#[error("{method}: request failed: {source}")]
	Http {
		method: &'static str,
		#[source]
		source: reqwest::Error,
	},

	/// Non-success HTTP status.
	#[error("{method}: unexpected status {status}")]
	Status { method: &'static str, status: u16 },

	/// HTTP success, but the envelope carried `ok: false`.
	#[error("{method}: response not ok ({})", error.as_deref().unwrap_or("no error given"))]
	NotOk {
		method: &'static str,
		error: Option<String>,
	},

	/// The body did not match the expected shape.
	#[error("{method}: decode failed: {source}")]
	Decode {
		method: &'static str,
		#[source]
		source: serde_json::Error,
	},

	#[error("invalid url: {0}")]
	InvalidUrl(String),
}

/// Channel as returned by the listing/detail endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteChannel {
	pub id: ChannelId,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub is_member: bool,
	#[serde(default)]
	pub is_archived: bool,
}

impl RemoteChannel {
	pub fn record(&self) -> ChannelRecord {
		ChannelRecord::new(self.id.clone(), self.name.clone())
	}
}

/// Workspace member as returned by the user endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteUser {
	pub id: UserId,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub deleted: bool,
	#[serde(default)]
	pub real_name: Option<String>,
}

impl RemoteUser {
	pub fn record(&self) -> UserRecord {
		UserRecord::new(self.id.clone(), self.name.clone())
	}
}

/// Message as delivered by the history endpoint or a realtime event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteMessage {
	/// Author id; absent for bot and some system messages.
	#[serde(default)]
	pub user: Option<UserId>,

	/// Display name supplied by bots instead of a user id.
	#[serde(default)]
	pub username: Option<String>,

	#[serde(default)]
	pub text: String,

	pub ts: Timestamp,

	#[serde(default)]
	pub subtype: Option<String>,
}

impl RemoteMessage {
	pub fn new(user: Option<UserId>, text: impl Into<String>, ts: Timestamp) -> Self {
		Self {
			user,
			username: None,
			text: text.into(),
			ts,
			subtype: None,
		}
	}
}

/// Cursor window for the history endpoint. Both bounds are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryRange {
	pub oldest: Option<Timestamp>,
	pub latest: Option<Timestamp>,
}

impl HistoryRange {
	/// Entire backlog.
	pub fn all() -> Self {
		Self::default()
	}

	/// Everything up to (the remote's notion of) `latest`.
	pub fn until(latest: Timestamp) -> Self {
		Self {
			oldest: None,
			latest: Some(latest),
		}
	}
}

/// One page of the history endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryPage {
	#[serde(default)]
	pub messages: Vec<RemoteMessage>,
	#[serde(default)]
	pub has_more: bool,
}

/// Identity of the connected operator from the realtime handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct RtmSelf {
	pub id: UserId,
	#[serde(default)]
	pub name: String,
}

/// Realtime handshake result: socket URL plus an initial snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct RtmStart {
	pub url: String,

	#[serde(rename = "self", default)]
	pub self_info: Option<RtmSelf>,

	#[serde(default)]
	pub users: Vec<RemoteUser>,

	#[serde(default)]
	pub channels: Vec<RemoteChannel>,
}

/// The remote REST surface the client relies on.
#[async_trait::async_trait]
pub trait WebApi: Send + Sync + 'static {
	async fn list_channels(&self) -> Result<Vec<RemoteChannel>, ApiError>;

	async fn channel_info(&self, id: &ChannelId) -> Result<RemoteChannel, ApiError>;

	/// Full member roster in one call.
	async fn list_users(&self) -> Result<Vec<RemoteUser>, ApiError>;

	/// A single identity by id.
	async fn user_info(&self, id: &UserId) -> Result<RemoteUser, ApiError>;

	async fn history_page(&self, channel: &ChannelId, range: &HistoryRange) -> Result<HistoryPage, ApiError>;

	async fn rtm_start(&self) -> Result<RtmStart, ApiError>;
}

/// Walk the history endpoint backward until `has_more` is false or a page comes back empty.
///
/// The `latest` cursor moves to the oldest timestamp seen so far. Messages are
/// returned in the order the pages delivered them.
pub async fn fetch_history<A>(api: &A, channel: &ChannelId, range: HistoryRange) -> Result<Vec<RemoteMessage>, ApiError>
where
	A: WebApi + ?Sized,
{
	let mut messages: Vec<RemoteMessage> = Vec::new();
	let mut cursor = range;
	let mut pages: u32 = 0;

	loop {
		let page = api.history_page(channel, &cursor).await?;
		pages += 1;

		if page.messages.is_empty() {
			break;
		}

		let oldest_in_page = page.messages.iter().map(|m| &m.ts).min().cloned();
		messages.extend(page.messages);

		if !page.has_more {
			break;
		}

		let Some(oldest) = oldest_in_page else {
			break;
		};
		let next = match &cursor.latest {
			Some(prev) if prev <= &oldest => {
				warn!(channel = %channel, cursor = %prev, "history cursor did not advance; stopping");
				break;
			}
			_ => oldest,
		};
		cursor.latest = Some(next);
	}

	debug!(channel = %channel, pages, messages = messages.len(), "history fetched");
	Ok(messages)
}

#![forbid(unsafe_code)]

//! Realtime wire frames.

pub mod socket;

use parley_domain::{ChannelId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RemoteMessage;

pub use socket::{BoxFuture, RtmSocket, WsConnector, connect_websocket, default_connector};

/// Message subtypes that carry an ordinary, displayable message.
const DISPLAYABLE_SUBTYPES: &[&str] = &["bot_message", "me_message"];

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("malformed frame: {0}")]
	Malformed(#[source] serde_json::Error),

	#[error("failed to encode frame: {0}")]
	Encode(#[source] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct FramePeek {
	#[serde(rename = "type", default)]
	kind: Option<String>,
	#[serde(default)]
	reply_to: Option<serde_json::Value>,
}

/// A `type: "message"` event pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageEvent {
	pub channel: ChannelId,
	#[serde(default)]
	pub user: Option<UserId>,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub text: String,
	pub ts: Timestamp,
	#[serde(default)]
	pub subtype: Option<String>,
}

impl MessageEvent {
	pub fn into_remote(self) -> (ChannelId, RemoteMessage) {
		(
			self.channel,
			RemoteMessage {
				user: self.user,
				username: self.username,
				text: self.text,
				ts: self.ts,
				subtype: self.subtype,
			},
		)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RtmErrorBody {
	#[serde(default)]
	pub code: Option<i64>,
	#[serde(default)]
	pub msg: Option<String>,
}

/// Server acknowledgement of a locally sent frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplyAck {
	#[serde(default = "default_true")]
	pub ok: bool,
	pub reply_to: u64,
	#[serde(default)]
	pub ts: Option<Timestamp>,
	#[serde(default)]
	pub text: Option<String>,
	#[serde(default)]
	pub error: Option<RtmErrorBody>,
}

fn default_true() -> bool {
	true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
	Message(MessageEvent),
	Ack(ReplyAck),
	/// Anything the client does not act on (`hello`, presence, edits, ...).
	Other { kind: Option<String> },
}

/// Decode one text frame.
///
/// `type: "message"` events with a plain or displayable subtype become
/// [`InboundFrame::Message`]; other frames carrying `reply_to` become
/// [`InboundFrame::Ack`]. Everything else is [`InboundFrame::Other`].
pub fn decode_frame(text: &str) -> Result<InboundFrame, FrameError> {
	let peek: FramePeek = serde_json::from_str(text).map_err(FrameError::Malformed)?;

	if peek.kind.as_deref() == Some("message") {
		let event: MessageEvent = serde_json::from_str(text).map_err(FrameError::Malformed)?;
		let displayable = match event.subtype.as_deref() {
			None => true,
			Some(s) => DISPLAYABLE_SUBTYPES.contains(&s),
		};
		if displayable {
			return Ok(InboundFrame::Message(event));
		}
		return Ok(InboundFrame::Other { kind: event.subtype });
	}

	if peek.reply_to.is_some_and(|v| !v.is_null()) {
		let ack: ReplyAck = serde_json::from_str(text).map_err(FrameError::Malformed)?;
		return Ok(InboundFrame::Ack(ack));
	}

	Ok(InboundFrame::Other { kind: peek.kind })
}

/// Outbound chat message; `id` is echoed back as `reply_to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
	pub id: u64,
	#[serde(rename = "type")]
	pub kind: &'static str,
	pub channel: ChannelId,
	pub text: String,
}

impl OutboundMessage {
	pub fn new(id: u64, channel: ChannelId, text: impl Into<String>) -> Self {
		Self {
			id,
			kind: "message",
			channel,
			text: text.into(),
		}
	}

	pub fn encode(&self) -> Result<String, FrameError> {
		serde_json::to_string(self).map_err(FrameError::Encode)
	}
}

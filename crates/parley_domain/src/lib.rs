#![forbid(unsafe_code)]

use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty identifier.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}
			pub fn as_str(&self) -> &str {
				&self.0
			}
			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}
	};
}

string_id!(
	/// Remote channel identifier (e.g. `C024BE91L`).
	ChannelId
);

string_id!(
	/// Remote user identifier (e.g. `U023BECGF`).
	UserId
);

impl UserId {
	/// Id of the synthetic record representing the local operator.
	pub const SELF_ID: &'static str = "me";

	pub fn local_self() -> Self {
		Self(Self::SELF_ID.to_string())
	}
}

/// Remote-assigned ordering token (`"1355517523.000005"`).
///
/// Never generated locally. Tokens made of `digits[.digits]` compare numerically and
/// sort before every other token; the rest compare as plain strings among themselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
	pub fn new(ts: impl Into<String>) -> Result<Self, ParseIdError> {
		let ts = ts.into();
		if ts.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(ts))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	fn numeric_parts(&self) -> Option<(&str, &str)> {
		let (int, frac) = self.0.split_once('.').unwrap_or((self.0.as_str(), ""));
		let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
		if int.is_empty() || !digits(int) || !digits(frac) {
			return None;
		}
		Some((int.trim_start_matches('0'), frac))
	}
}

impl Ord for Timestamp {
	fn cmp(&self, other: &Self) -> Ordering {
		match (self.numeric_parts(), other.numeric_parts()) {
			(Some((ai, af)), Some((bi, bf))) => ai
				.len()
				.cmp(&bi.len())
				.then_with(|| ai.cmp(bi))
				.then_with(|| cmp_fraction(af, bf))
				.then_with(|| self.0.cmp(&other.0)),
			(Some(_), None) => Ordering::Less,
			(None, Some(_)) => Ordering::Greater,
			(None, None) => self.0.cmp(&other.0),
		}
	}
}

impl PartialOrd for Timestamp {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

/// Compare decimal fractions digit by digit, treating missing digits as zero.
fn cmp_fraction(a: &str, b: &str) -> Ordering {
	let len = a.len().max(b.len());
	let mut ai = a.bytes().chain(core::iter::repeat(b'0')).take(len);
	let mut bi = b.bytes().chain(core::iter::repeat(b'0')).take(len);
	loop {
		match (ai.next(), bi.next()) {
			(Some(x), Some(y)) if x != y => return x.cmp(&y),
			(Some(_), Some(_)) => continue,
			_ => return Ordering::Equal,
		}
	}
}

impl fmt::Display for Timestamp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Timestamp {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Timestamp::new(s.to_string())
	}
}

/// Cached channel identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
	pub id: ChannelId,
	pub name: String,
}

impl ChannelRecord {
	pub fn new(id: ChannelId, name: impl Into<String>) -> Self {
		Self { id, name: name.into() }
	}
}

/// Cached user identity. Immutable for the process lifetime once cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
	pub id: UserId,
	pub name: String,
}

impl UserRecord {
	pub fn new(id: UserId, name: impl Into<String>) -> Self {
		Self { id, name: name.into() }
	}

	/// The synthetic record for the local operator.
	pub fn local_self(name: impl Into<String>) -> Self {
		Self::new(UserId::local_self(), name)
	}
}

/// A displayable message with its author already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub author_name: String,
	pub text: String,
	pub timestamp: Timestamp,
}

impl Message {
	pub fn new(author_name: impl Into<String>, text: impl Into<String>, timestamp: Timestamp) -> Self {
		Self {
			author_name: author_name.into(),
			text: text.into(),
			timestamp,
		}
	}
}

/// Per-channel message list, newest first.
///
/// Grows only at the front once populated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHistory {
	messages: VecDeque<Message>,
}

impl ChannelHistory {
	pub fn new() -> Self {
		Self::default()
	}

	/// Build from messages in any order; the result is sorted newest first.
	pub fn from_unordered(mut messages: Vec<Message>) -> Self {
		messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
		Self {
			messages: messages.into(),
		}
	}

	/// Put a newer message at the front.
	pub fn prepend(&mut self, message: Message) {
		self.messages.push_front(message);
	}

	pub fn newest(&self) -> Option<&Message> {
		self.messages.front()
	}

	pub fn contains_timestamp(&self, ts: &Timestamp) -> bool {
		self.messages.iter().any(|m| &m.timestamp == ts)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Message> {
		self.messages.iter()
	}

	pub fn len(&self) -> usize {
		self.messages.len()
	}

	pub fn is_empty(&self) -> bool {
		self.messages.is_empty()
	}

	pub fn to_vec(&self) -> Vec<Message> {
		self.messages.iter().cloned().collect()
	}
}

/// Display helpers for identities that could not be resolved.
pub struct Placeholder;

impl Placeholder {
	pub fn channel(id: &ChannelId) -> String {
		format!("<unknown channel {id}>")
	}

	pub fn user(id: &UserId) -> String {
		format!("<unknown user {id}>")
	}

	/// Author shown for messages that carry no user id at all.
	pub const ANONYMOUS_AUTHOR: &'static str = "<unknown author>";
}

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parley_domain::{ChannelHistory, ChannelId, Message, Placeholder, Timestamp, UserId};
use parley_platform::{HistoryRange, RemoteMessage, WebApi, fetch_history};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::request::{self, Reply, deadline_in, expired};
use crate::user_directory::UserDirectoryHandle;
use crate::{ActorSettings, ClientCoreError};

const ACTOR: &str = "history cache";

enum HistoryCommand {
	Get {
		channel: ChannelId,
		deadline: Instant,
		resp: Reply<ChannelHistory>,
	},
	Append {
		channel: ChannelId,
		message: RemoteMessage,
		deadline: Instant,
		resp: Reply<bool>,
	},
	Reset {
		resp: Reply<usize>,
	},
	Shutdown {
		resp: oneshot::Sender<()>,
	},
}

/// Handle to the history cache actor.
#[derive(Clone)]
pub struct HistoryHandle {
	tx: mpsc::Sender<HistoryCommand>,
	request_timeout: Duration,
}

impl std::fmt::Debug for HistoryHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HistoryHandle").finish_non_exhaustive()
	}
}

impl HistoryHandle {
	pub async fn get(&self, channel: &ChannelId) -> Result<ChannelHistory, ClientCoreError> {
		self.get_until(channel, deadline_in(self.request_timeout)).await
	}

	/// Cached history, or the full backlog fetched and cached on first access.
	pub async fn get_until(&self, channel: &ChannelId, deadline: Instant) -> Result<ChannelHistory, ClientCoreError> {
		let channel = channel.clone();
		request::call(&self.tx, ACTOR, deadline, |resp| HistoryCommand::Get {
			channel,
			deadline,
			resp,
		})
		.await
	}

	pub async fn append(&self, channel: &ChannelId, message: RemoteMessage) -> Result<bool, ClientCoreError> {
		self.append_until(channel, message, deadline_in(self.request_timeout)).await
	}

	/// Add a live message. Returns whether the cached history changed.
	pub async fn append_until(
		&self,
		channel: &ChannelId,
		message: RemoteMessage,
		deadline: Instant,
	) -> Result<bool, ClientCoreError> {
		let channel = channel.clone();
		request::call(&self.tx, ACTOR, deadline, |resp| HistoryCommand::Append {
			channel,
			message,
			deadline,
			resp,
		})
		.await
	}

	/// Drop every cached channel. Returns how many were dropped.
	pub async fn reset(&self) -> Result<usize, ClientCoreError> {
		request::call(&self.tx, ACTOR, deadline_in(self.request_timeout), |resp| HistoryCommand::Reset {
			resp,
		})
		.await
	}

	pub async fn shutdown(&self) {
		request::stop(&self.tx, self.request_timeout, |resp| HistoryCommand::Shutdown { resp }).await;
	}
}

struct CachedChannel {
	history: ChannelHistory,
	seen: HashSet<Timestamp>,
}

/// Per-request author lookup with a small memo so a page of messages from
/// one author costs one directory round trip.
struct AuthorResolver<'a> {
	users: &'a UserDirectoryHandle,
	deadline: Instant,
	known: HashMap<UserId, String>,
}

impl<'a> AuthorResolver<'a> {
	fn new(users: &'a UserDirectoryHandle, deadline: Instant) -> Self {
		Self {
			users,
			deadline,
			known: HashMap::new(),
		}
	}

	async fn resolve(&mut self, message: &RemoteMessage) -> Result<String, ClientCoreError> {
		let Some(id) = &message.user else {
			return Ok(match &message.username {
				Some(name) if !name.trim().is_empty() => name.clone(),
				_ => Placeholder::ANONYMOUS_AUTHOR.to_string(),
			});
		};

		if let Some(name) = self.known.get(id) {
			return Ok(name.clone());
		}

		let name = match self.users.get_name_until(id, self.deadline).await {
			Ok(name) => name,
			Err(e @ (ClientCoreError::DeadlineExceeded | ClientCoreError::ActorClosed(_))) => return Err(e),
			Err(e) => {
				debug!(user = %id, error = %e, "author unresolved; using placeholder");
				Placeholder::user(id)
			}
		};
		self.known.insert(id.clone(), name.clone());
		Ok(name)
	}
}

/// Single-owner per-channel message cache. Depends on the user directory, never the reverse.
pub struct HistoryCache {
	api: Arc<dyn WebApi>,
	users: UserDirectoryHandle,
	channels: HashMap<ChannelId, CachedChannel>,
}

impl HistoryCache {
	pub fn spawn(api: Arc<dyn WebApi>, users: UserDirectoryHandle, settings: ActorSettings) -> HistoryHandle {
		let (tx, rx) = mpsc::channel(settings.queue_capacity);
		let actor = Self {
			api,
			users,
			channels: HashMap::new(),
		};
		tokio::spawn(actor.run(rx));
		HistoryHandle {
			tx,
			request_timeout: settings.request_timeout,
		}
	}

	async fn run(mut self, mut rx: mpsc::Receiver<HistoryCommand>) {
		while let Some(cmd) = rx.recv().await {
			match cmd {
				HistoryCommand::Get {
					channel,
					deadline,
					resp,
				} => {
					if expired(deadline) {
						let _ = resp.send(Err(ClientCoreError::DeadlineExceeded));
						continue;
					}
					let result = self.get(&channel, deadline).await;
					let _ = resp.send(result);
				}
				HistoryCommand::Append {
					channel,
					message,
					deadline,
					resp,
				} => {
					if expired(deadline) {
						let _ = resp.send(Err(ClientCoreError::DeadlineExceeded));
						continue;
					}
					let result = self.append(&channel, message, deadline).await;
					if let Err(e) = &result {
						warn!(channel = %channel, error = %e, "append failed");
					}
					let _ = resp.send(result);
				}
				HistoryCommand::Reset { resp } => {
					let dropped = self.channels.len();
					self.channels.clear();
					info!(dropped, "history cache reset");
					let _ = resp.send(Ok(dropped));
				}
				HistoryCommand::Shutdown { resp } => {
					info!("history cache shutting down");
					let _ = resp.send(());
					return;
				}
			}
		}
		debug!("history cache handles dropped; exiting");
	}

	async fn get(&mut self, channel: &ChannelId, deadline: Instant) -> Result<ChannelHistory, ClientCoreError> {
		if let Some(cached) = self.channels.get(channel) {
			return Ok(cached.history.clone());
		}

		let remote = request::remote(deadline, fetch_history(self.api.as_ref(), channel, HistoryRange::all())).await?;
		let cached = self.populate(channel, remote, deadline).await?;
		let history = cached.history.clone();
		debug!(channel = %channel, messages = history.len(), "history populated");
		self.channels.insert(channel.clone(), cached);
		Ok(history)
	}

	async fn append(
		&mut self,
		channel: &ChannelId,
		message: RemoteMessage,
		deadline: Instant,
	) -> Result<bool, ClientCoreError> {
		let mut backfilled = false;
		if !self.channels.contains_key(channel) {
			let range = HistoryRange::until(message.ts.clone());
			let remote = request::remote(deadline, fetch_history(self.api.as_ref(), channel, range)).await?;
			let cached = self.populate(channel, remote, deadline).await?;
			debug!(channel = %channel, messages = cached.history.len(), "history backfilled before live message");
			self.channels.insert(channel.clone(), cached);
			backfilled = true;
		}

		let already_seen = self
			.channels
			.get(channel)
			.is_some_and(|cached| cached.seen.contains(&message.ts));
		if already_seen {
			metrics::counter!("parley_history_duplicates_total").increment(1);
			debug!(channel = %channel, ts = %message.ts, "duplicate message ignored");
			return Ok(backfilled);
		}

		let author = AuthorResolver::new(&self.users, deadline).resolve(&message).await?;
		let Some(cached) = self.channels.get_mut(channel) else {
			return Err(ClientCoreError::NotFound(format!("history for {channel}")));
		};
		cached.seen.insert(message.ts.clone());
		cached.history.prepend(Message::new(author, message.text, message.ts));
		Ok(true)
	}

	async fn populate(
		&self,
		channel: &ChannelId,
		remote: Vec<RemoteMessage>,
		deadline: Instant,
	) -> Result<CachedChannel, ClientCoreError> {
		let mut resolver = AuthorResolver::new(&self.users, deadline);
		let mut seen = HashSet::with_capacity(remote.len());
		let mut messages = Vec::with_capacity(remote.len());

		for m in remote {
			if !seen.insert(m.ts.clone()) {
				metrics::counter!("parley_history_duplicates_total").increment(1);
				debug!(channel = %channel, ts = %m.ts, "duplicate message in fetched history");
				continue;
			}
			let author = resolver.resolve(&m).await?;
			messages.push(Message::new(author, m.text, m.ts));
		}

		Ok(CachedChannel {
			history: ChannelHistory::from_unordered(messages),
			seen,
		})
	}
}

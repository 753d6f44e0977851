#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley_domain::{ChannelId, ChannelRecord};
use parley_platform::WebApi;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::request::{self, Reply, deadline_in, expired};
use crate::{ActorSettings, ClientCoreError};

const ACTOR: &str = "channel directory";

/// Bidirectional id <-> name map. Every id maps to exactly one name and back.
#[derive(Debug, Default, Clone)]
pub struct ChannelMap {
	by_id: HashMap<ChannelId, String>,
	by_name: HashMap<String, ChannelId>,
}

impl ChannelMap {
	pub fn new() -> Self {
		Self::default()
	}

	/// Upsert; drops any prior pairing of either key so the map stays a bijection.
	pub fn put(&mut self, name: String, id: ChannelId) {
		if let Some(old_name) = self.by_id.remove(&id) {
			self.by_name.remove(&old_name);
		}
		if let Some(old_id) = self.by_name.remove(&name) {
			self.by_id.remove(&old_id);
		}
		self.by_id.insert(id.clone(), name.clone());
		self.by_name.insert(name, id);
	}

	pub fn id_of(&self, name: &str) -> Option<&ChannelId> {
		self.by_name.get(name)
	}

	pub fn name_of(&self, id: &ChannelId) -> Option<&str> {
		self.by_id.get(id).map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.by_id.len()
	}

	pub fn is_empty(&self) -> bool {
		self.by_id.is_empty()
	}

	/// All records, sorted by name.
	pub fn records(&self) -> Vec<ChannelRecord> {
		let mut out: Vec<ChannelRecord> = self
			.by_id
			.iter()
			.map(|(id, name)| ChannelRecord::new(id.clone(), name.clone()))
			.collect();
		out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
		out
	}

	/// Both directions agree with each other.
	pub fn is_consistent(&self) -> bool {
		self.by_id.len() == self.by_name.len()
			&& self
				.by_id
				.iter()
				.all(|(id, name)| self.by_name.get(name).is_some_and(|back| back == id))
	}
}

enum ChannelCommand {
	Put {
		record: ChannelRecord,
		resp: Reply<()>,
	},
	PutMany {
		records: Vec<ChannelRecord>,
		resp: Reply<usize>,
	},
	GetId {
		name: String,
		deadline: Instant,
		resp: Reply<ChannelId>,
	},
	GetName {
		id: ChannelId,
		deadline: Instant,
		resp: Reply<String>,
	},
	List {
		resp: Reply<Vec<ChannelRecord>>,
	},
	Shutdown {
		resp: oneshot::Sender<()>,
	},
}

/// Handle to the channel directory actor.
#[derive(Clone)]
pub struct ChannelDirectoryHandle {
	tx: mpsc::Sender<ChannelCommand>,
	request_timeout: Duration,
}

impl std::fmt::Debug for ChannelDirectoryHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChannelDirectoryHandle").finish_non_exhaustive()
	}
}

impl ChannelDirectoryHandle {
	pub async fn put(&self, name: impl Into<String>, id: ChannelId) -> Result<(), ClientCoreError> {
		let record = ChannelRecord::new(id, name);
		request::call(&self.tx, ACTOR, deadline_in(self.request_timeout), |resp| ChannelCommand::Put {
			record,
			resp,
		})
		.await
	}

	/// Bulk seed; returns how many records were applied.
	pub async fn put_many(&self, records: Vec<ChannelRecord>) -> Result<usize, ClientCoreError> {
		request::call(&self.tx, ACTOR, deadline_in(self.request_timeout), |resp| {
			ChannelCommand::PutMany { records, resp }
		})
		.await
	}

	pub async fn get_id(&self, name: &str) -> Result<ChannelId, ClientCoreError> {
		self.get_id_until(name, deadline_in(self.request_timeout)).await
	}

	/// Exact lookup. Never fetches.
	pub async fn get_id_until(&self, name: &str, deadline: Instant) -> Result<ChannelId, ClientCoreError> {
		let name = name.to_string();
		request::call(&self.tx, ACTOR, deadline, |resp| ChannelCommand::GetId { name, deadline, resp }).await
	}

	pub async fn get_name(&self, id: &ChannelId) -> Result<String, ClientCoreError> {
		self.get_name_until(id, deadline_in(self.request_timeout)).await
	}

	/// Cached name, or fetch `channels.info` and cache it.
	pub async fn get_name_until(&self, id: &ChannelId, deadline: Instant) -> Result<String, ClientCoreError> {
		let id = id.clone();
		request::call(&self.tx, ACTOR, deadline, |resp| ChannelCommand::GetName { id, deadline, resp }).await
	}

	pub async fn list(&self) -> Result<Vec<ChannelRecord>, ClientCoreError> {
		request::call(&self.tx, ACTOR, deadline_in(self.request_timeout), |resp| ChannelCommand::List {
			resp,
		})
		.await
	}

	pub async fn shutdown(&self) {
		request::stop(&self.tx, self.request_timeout, |resp| ChannelCommand::Shutdown { resp }).await;
	}
}

/// Single-owner channel cache.
pub struct ChannelDirectory {
	api: Arc<dyn WebApi>,
	map: ChannelMap,
}

impl ChannelDirectory {
	pub fn spawn(api: Arc<dyn WebApi>, settings: ActorSettings) -> ChannelDirectoryHandle {
		let (tx, rx) = mpsc::channel(settings.queue_capacity);
		let actor = Self {
			api,
			map: ChannelMap::new(),
		};
		tokio::spawn(actor.run(rx));
		ChannelDirectoryHandle {
			tx,
			request_timeout: settings.request_timeout,
		}
	}

	async fn run(mut self, mut rx: mpsc::Receiver<ChannelCommand>) {
		while let Some(cmd) = rx.recv().await {
			match cmd {
				ChannelCommand::Put { record, resp } => {
					self.map.put(record.name, record.id);
					let _ = resp.send(Ok(()));
				}
				ChannelCommand::PutMany { records, resp } => {
					let n = records.len();
					for record in records {
						self.map.put(record.name, record.id);
					}
					debug!(count = n, total = self.map.len(), "channels seeded");
					let _ = resp.send(Ok(n));
				}
				ChannelCommand::GetId { name, deadline, resp } => {
					if expired(deadline) {
						let _ = resp.send(Err(ClientCoreError::DeadlineExceeded));
						continue;
					}
					let result = self
						.map
						.id_of(&name)
						.cloned()
						.ok_or_else(|| ClientCoreError::NotFound(format!("channel named {name:?}")));
					let _ = resp.send(result);
				}
				ChannelCommand::GetName { id, deadline, resp } => {
					if expired(deadline) {
						let _ = resp.send(Err(ClientCoreError::DeadlineExceeded));
						continue;
					}
					let result = self.resolve_name(&id, deadline).await;
					let _ = resp.send(result);
				}
				ChannelCommand::List { resp } => {
					let _ = resp.send(Ok(self.map.records()));
				}
				ChannelCommand::Shutdown { resp } => {
					info!("channel directory shutting down");
					let _ = resp.send(());
					return;
				}
			}
		}
		debug!("channel directory handles dropped; exiting");
	}

	async fn resolve_name(&mut self, id: &ChannelId, deadline: Instant) -> Result<String, ClientCoreError> {
		if let Some(name) = self.map.name_of(id) {
			return Ok(name.to_string());
		}

		let fetched = request::remote(deadline, self.api.channel_info(id)).await;
		match fetched {
			Ok(channel) if &channel.id != id => {
				warn!(requested = %id, returned = %channel.id, "channel lookup returned a different identity");
				Err(ClientCoreError::Upstream(format!(
					"channels.info for {id} returned {}",
					channel.id
				)))
			}
			Ok(channel) if channel.name.trim().is_empty() => {
				warn!(channel = %id, "channel lookup returned no name");
				Err(ClientCoreError::NotFound(format!("name for channel {id}")))
			}
			Ok(channel) => {
				let name = channel.name.clone();
				debug!(channel = %id, name = %name, "channel resolved on miss");
				self.map.put(channel.name, channel.id);
				Ok(name)
			}
			Err(e) => {
				warn!(channel = %id, error = %e, "channel lookup failed");
				Err(e)
			}
		}
	}
}

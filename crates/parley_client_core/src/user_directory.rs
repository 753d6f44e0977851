#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley_domain::{UserId, UserRecord};
use parley_platform::WebApi;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::request::{self, Reply, deadline_in, expired};
use crate::{ActorSettings, ClientCoreError};

const ACTOR: &str = "user directory";

enum UserCommand {
	GetName {
		id: UserId,
		deadline: Instant,
		resp: Reply<String>,
	},
	InsertMissing {
		records: Vec<UserRecord>,
		resp: Reply<usize>,
	},
	Shutdown {
		resp: oneshot::Sender<()>,
	},
}

/// Handle to the user directory actor.
#[derive(Clone)]
pub struct UserDirectoryHandle {
	tx: mpsc::Sender<UserCommand>,
	request_timeout: Duration,
}

impl std::fmt::Debug for UserDirectoryHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("UserDirectoryHandle").finish_non_exhaustive()
	}
}

impl UserDirectoryHandle {
	pub async fn get_name(&self, id: &UserId) -> Result<String, ClientCoreError> {
		self.get_name_until(id, deadline_in(self.request_timeout)).await
	}

	/// Cached name, or fetch that specific user and cache it.
	pub async fn get_name_until(&self, id: &UserId, deadline: Instant) -> Result<String, ClientCoreError> {
		let id = id.clone();
		request::call(&self.tx, ACTOR, deadline, |resp| UserCommand::GetName { id, deadline, resp }).await
	}

	/// Add records whose id is not cached yet; existing records are left untouched.
	pub async fn insert_missing(&self, records: Vec<UserRecord>) -> Result<usize, ClientCoreError> {
		request::call(&self.tx, ACTOR, deadline_in(self.request_timeout), |resp| {
			UserCommand::InsertMissing { records, resp }
		})
		.await
	}

	pub async fn shutdown(&self) {
		request::stop(&self.tx, self.request_timeout, |resp| UserCommand::Shutdown { resp }).await;
	}
}

/// Single-owner user cache. Records never change once cached.
pub struct UserDirectory {
	api: Arc<dyn WebApi>,
	users: HashMap<UserId, String>,
}

impl UserDirectory {
	/// Preload the full roster, add the local operator record, then spawn.
	///
	/// A failed preload is fatal: the directory is not started.
	pub async fn start(
		api: Arc<dyn WebApi>,
		self_name: impl Into<String>,
		settings: ActorSettings,
	) -> Result<UserDirectoryHandle, ClientCoreError> {
		let roster = request::remote(deadline_in(settings.request_timeout), api.list_users())
			.await
			.inspect_err(|e| warn!(error = %e, "user preload failed"))?;

		let mut users: HashMap<UserId, String> = roster.into_iter().map(|u| (u.id, u.name)).collect();
		let me = UserRecord::local_self(self_name);
		users.insert(me.id, me.name);
		info!(count = users.len(), "user directory preloaded");

		let (tx, rx) = mpsc::channel(settings.queue_capacity);
		tokio::spawn(Self { api, users }.run(rx));

		Ok(UserDirectoryHandle {
			tx,
			request_timeout: settings.request_timeout,
		})
	}

	async fn run(mut self, mut rx: mpsc::Receiver<UserCommand>) {
		while let Some(cmd) = rx.recv().await {
			match cmd {
				UserCommand::GetName { id, deadline, resp } => {
					if expired(deadline) {
						let _ = resp.send(Err(ClientCoreError::DeadlineExceeded));
						continue;
					}
					let result = self.resolve(&id, deadline).await;
					let _ = resp.send(result);
				}
				UserCommand::InsertMissing { records, resp } => {
					let mut added = 0usize;
					for record in records {
						if !self.users.contains_key(&record.id) {
							self.users.insert(record.id, record.name);
							added += 1;
						}
					}
					debug!(added, total = self.users.len(), "users pre-warmed");
					let _ = resp.send(Ok(added));
				}
				UserCommand::Shutdown { resp } => {
					info!("user directory shutting down");
					let _ = resp.send(());
					return;
				}
			}
		}
		debug!("user directory handles dropped; exiting");
	}

	async fn resolve(&mut self, id: &UserId, deadline: Instant) -> Result<String, ClientCoreError> {
		if let Some(name) = self.users.get(id) {
			return Ok(name.clone());
		}

		match request::remote(deadline, self.api.user_info(id)).await {
			Ok(user) if &user.id == id => {
				debug!(user = %id, name = %user.name, "user resolved on miss");
				self.users.insert(user.id, user.name.clone());
				Ok(user.name)
			}
			Ok(user) => {
				warn!(requested = %id, returned = %user.id, "user lookup returned a different identity");
				Err(ClientCoreError::Upstream(format!(
					"users.info for {id} returned {}",
					user.id
				)))
			}
			Err(e) => {
				warn!(user = %id, error = %e, "user lookup failed");
				Err(e)
			}
		}
	}
}

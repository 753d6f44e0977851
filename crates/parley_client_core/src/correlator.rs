#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use parley_domain::{ChannelId, Timestamp, UserId};
use parley_platform::RemoteMessage;
use parley_platform::rtm::ReplyAck;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::fanout::UpdateFanout;
use crate::history::HistoryHandle;
use crate::request::{self, Reply, deadline_in, expired};
use crate::{ActorSettings, ClientCoreError};

const ACTOR: &str = "correlator";

/// A local send waiting for the server's acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
	pub id: u64,
	pub channel: ChannelId,
	pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
	/// Materialized into history under the local operator.
	Confirmed { channel: ChannelId, ts: Timestamp },
	/// The server refused the send; nothing was recorded.
	Rejected { channel: ChannelId, error: Option<String> },
}

enum CorrelatorCommand {
	Register {
		pending: PendingSend,
		resp: Reply<()>,
	},
	Cancel {
		id: u64,
		resp: Reply<bool>,
	},
	Ack {
		ack: ReplyAck,
		deadline: Instant,
		resp: Reply<AckOutcome>,
	},
	PendingCount {
		resp: Reply<usize>,
	},
	Shutdown {
		resp: oneshot::Sender<()>,
	},
}

/// Handle to a connection's correlator.
#[derive(Clone)]
pub struct CorrelatorHandle {
	tx: mpsc::Sender<CorrelatorCommand>,
	request_timeout: Duration,
}

impl std::fmt::Debug for CorrelatorHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CorrelatorHandle").finish_non_exhaustive()
	}
}

impl CorrelatorHandle {
	/// Track `pending` until its ack arrives. A duplicate id is rejected and never overwrites.
	pub async fn register(&self, pending: PendingSend) -> Result<(), ClientCoreError> {
		self.register_until(pending, deadline_in(self.request_timeout)).await
	}

	pub async fn register_until(&self, pending: PendingSend, deadline: Instant) -> Result<(), ClientCoreError> {
		request::call(&self.tx, ACTOR, deadline, |resp| CorrelatorCommand::Register { pending, resp }).await
	}

	/// Forget a pending send whose frame never left.
	pub async fn cancel(&self, id: u64) -> Result<bool, ClientCoreError> {
		request::call(&self.tx, ACTOR, deadline_in(self.request_timeout), |resp| {
			CorrelatorCommand::Cancel { id, resp }
		})
		.await
	}

	pub async fn ack(&self, ack: ReplyAck) -> Result<AckOutcome, ClientCoreError> {
		self.ack_until(ack, deadline_in(self.request_timeout)).await
	}

	pub async fn ack_until(&self, ack: ReplyAck, deadline: Instant) -> Result<AckOutcome, ClientCoreError> {
		request::call(&self.tx, ACTOR, deadline, |resp| CorrelatorCommand::Ack { ack, deadline, resp }).await
	}

	pub async fn pending_count(&self) -> Result<usize, ClientCoreError> {
		request::call(&self.tx, ACTOR, deadline_in(self.request_timeout), |resp| {
			CorrelatorCommand::PendingCount { resp }
		})
		.await
	}

	/// Stop; anything still pending is logged as orphaned.
	pub async fn shutdown(&self) {
		request::stop(&self.tx, self.request_timeout, |resp| CorrelatorCommand::Shutdown { resp }).await;
	}
}

/// Owns the id -> pending send map for one connection.
pub struct Correlator {
	history: HistoryHandle,
	fanout: UpdateFanout,
	pending: HashMap<u64, PendingSend>,
}

impl Correlator {
	pub fn spawn(history: HistoryHandle, fanout: UpdateFanout, settings: ActorSettings) -> CorrelatorHandle {
		let (tx, rx) = mpsc::channel(settings.queue_capacity);
		let actor = Self {
			history,
			fanout,
			pending: HashMap::new(),
		};
		tokio::spawn(actor.run(rx));
		CorrelatorHandle {
			tx,
			request_timeout: settings.request_timeout,
		}
	}

	async fn run(mut self, mut rx: mpsc::Receiver<CorrelatorCommand>) {
		while let Some(cmd) = rx.recv().await {
			match cmd {
				CorrelatorCommand::Register { pending, resp } => {
					let _ = resp.send(self.register(pending));
				}
				CorrelatorCommand::Cancel { id, resp } => {
					let _ = resp.send(Ok(self.pending.remove(&id).is_some()));
				}
				CorrelatorCommand::Ack { ack, deadline, resp } => {
					if expired(deadline) {
						let _ = resp.send(Err(ClientCoreError::DeadlineExceeded));
						continue;
					}
					let result = self.acknowledge(ack, deadline).await;
					let _ = resp.send(result);
				}
				CorrelatorCommand::PendingCount { resp } => {
					let _ = resp.send(Ok(self.pending.len()));
				}
				CorrelatorCommand::Shutdown { resp } => {
					self.orphan_pending();
					let _ = resp.send(());
					return;
				}
			}
		}
		self.orphan_pending();
	}

	fn register(&mut self, pending: PendingSend) -> Result<(), ClientCoreError> {
		if let Some(existing) = self.pending.get(&pending.id) {
			warn!(id = pending.id, channel = %existing.channel, "send id already pending; registration dropped");
			metrics::counter!("parley_correlation_dropped_total").increment(1);
			return Err(ClientCoreError::Correlation(format!("send id {} already pending", pending.id)));
		}
		debug!(id = pending.id, channel = %pending.channel, "send registered");
		self.pending.insert(pending.id, pending);
		Ok(())
	}

	async fn acknowledge(&mut self, ack: ReplyAck, deadline: Instant) -> Result<AckOutcome, ClientCoreError> {
		let Some(sent) = self.pending.remove(&ack.reply_to) else {
			warn!(reply_to = ack.reply_to, "ack for unknown send id; dropped");
			metrics::counter!("parley_correlation_dropped_total").increment(1);
			return Err(ClientCoreError::Correlation(format!(
				"no pending send with id {}",
				ack.reply_to
			)));
		};

		if !ack.ok {
			let error = ack.error.and_then(|e| e.msg);
			warn!(id = sent.id, channel = %sent.channel, error = ?error, "send rejected by server");
			return Ok(AckOutcome::Rejected {
				channel: sent.channel,
				error,
			});
		}

		let Some(ts) = ack.ts else {
			warn!(id = sent.id, "ack without timestamp; send cannot be placed in history");
			return Err(ClientCoreError::Protocol(format!("ack for {} carries no ts", sent.id)));
		};

		let message = RemoteMessage::new(Some(UserId::local_self()), sent.text, ts.clone());
		let changed = self.history.append_until(&sent.channel, message, deadline).await?;
		if changed {
			self.fanout.emit(&sent.channel);
		}
		debug!(id = sent.id, channel = %sent.channel, ts = %ts, "send confirmed");
		Ok(AckOutcome::Confirmed {
			channel: sent.channel,
			ts,
		})
	}

	fn orphan_pending(&mut self) {
		if self.pending.is_empty() {
			debug!("correlator stopped");
			return;
		}
		let mut ids: Vec<u64> = self.pending.keys().copied().collect();
		ids.sort_unstable();
		metrics::counter!("parley_pending_orphaned_total").increment(ids.len() as u64);
		info!(count = ids.len(), ids = ?ids, "correlator stopped with unacknowledged sends");
		self.pending.clear();
	}
}

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parley_domain::{ChannelId, ChannelRecord, UserRecord};
use parley_platform::rtm::socket::{RtmSink, RtmStream, WsMessage};
use parley_platform::rtm::{InboundFrame, OutboundMessage, WsConnector, decode_frame};
use parley_platform::{RtmStart, WebApi};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use url::Url;

use crate::channel_directory::ChannelDirectoryHandle;
use crate::correlator::{Correlator, CorrelatorHandle, PendingSend};
use crate::fanout::UpdateFanout;
use crate::history::HistoryHandle;
use crate::request::{self, Reply, deadline_in, expired};
use crate::user_directory::UserDirectoryHandle;
use crate::{ActorSettings, ClientCoreError, ReconnectPolicy};

const ACTOR: &str = "transport";

/// Realtime connection state, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected { reason: Option<String> },
	Handshaking,
	Connected { session_id: String },
}

impl ConnectionState {
	pub fn is_connected(&self) -> bool {
		matches!(self, Self::Connected { .. })
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Disconnected { reason: None } => f.write_str("disconnected"),
			Self::Disconnected { reason: Some(r) } => write!(f, "disconnected ({r})"),
			Self::Handshaking => f.write_str("connecting"),
			Self::Connected { session_id } => write!(f, "connected (session {session_id})"),
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
	pub actor: ActorSettings,
	pub handshake_timeout: Duration,
	pub reconnect: ReconnectPolicy,
}

/// Everything the transport talks to. Nothing here depends on the transport.
pub struct TransportDeps {
	pub api: Arc<dyn WebApi>,
	pub channels: ChannelDirectoryHandle,
	pub users: UserDirectoryHandle,
	pub history: HistoryHandle,
	pub fanout: UpdateFanout,
	pub connector: WsConnector,
}

enum TransportControl {
	Connect {
		resp: Reply<String>,
	},
	Disconnect {
		resp: Reply<()>,
	},
	Send {
		channel: ChannelId,
		text: String,
		deadline: Instant,
		resp: Reply<u64>,
	},
	Shutdown {
		resp: oneshot::Sender<()>,
	},
}

/// Handle to the transport supervisor.
#[derive(Clone)]
pub struct TransportHandle {
	tx: mpsc::Sender<TransportControl>,
	state_rx: watch::Receiver<ConnectionState>,
	settings: TransportSettings,
}

impl fmt::Debug for TransportHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TransportHandle")
			.field("state", &*self.state_rx.borrow())
			.finish_non_exhaustive()
	}
}

impl TransportHandle {
	/// Handshake and open the socket. Returns the session id; a no-op when already connected.
	pub async fn connect(&self) -> Result<String, ClientCoreError> {
		// handshake + socket open, each bounded, plus both directory pre-warms
		let budget = self.settings.handshake_timeout * 2 + self.settings.actor.request_timeout * 2;
		request::call(&self.tx, ACTOR, deadline_in(budget), |resp| TransportControl::Connect { resp }).await
	}

	/// Drop the connection and cancel any scheduled reconnect.
	pub async fn disconnect(&self) -> Result<(), ClientCoreError> {
		request::call(
			&self.tx,
			ACTOR,
			deadline_in(self.settings.actor.request_timeout),
			|resp| TransportControl::Disconnect { resp },
		)
		.await
	}

	pub async fn send_message(&self, channel: ChannelId, text: impl Into<String>) -> Result<u64, ClientCoreError> {
		self.send_message_until(channel, text, deadline_in(self.settings.actor.request_timeout))
			.await
	}

	/// Queue a chat message. Resolves with the assigned send id once the frame is written.
	pub async fn send_message_until(
		&self,
		channel: ChannelId,
		text: impl Into<String>,
		deadline: Instant,
	) -> Result<u64, ClientCoreError> {
		let text = text.into();
		request::call(&self.tx, ACTOR, deadline, |resp| TransportControl::Send {
			channel,
			text,
			deadline,
			resp,
		})
		.await
	}

	pub fn state(&self) -> ConnectionState {
		self.state_rx.borrow().clone()
	}

	pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
		self.state_rx.clone()
	}

	pub async fn shutdown(&self) {
		request::stop(&self.tx, self.settings.actor.request_timeout, |resp| {
			TransportControl::Shutdown { resp }
		})
		.await;
	}
}

struct OutboundRequest {
	channel: ChannelId,
	text: String,
	deadline: Instant,
	resp: Reply<u64>,
}

struct ActiveConnection {
	session_id: String,
	outbound_tx: mpsc::Sender<OutboundRequest>,
	correlator: CorrelatorHandle,
	inbound: JoinHandle<()>,
	outbound: JoinHandle<()>,
	ended_rx: mpsc::Receiver<String>,
}

#[derive(Debug, Clone, Copy)]
struct Retry {
	attempt: u32,
	at: Instant,
}

enum Step {
	Control(Option<TransportControl>),
	Ended(String),
	Retry,
}

/// Supervisor owning the realtime socket and its per-connection tasks.
pub struct Transport {
	deps: TransportDeps,
	settings: TransportSettings,
	state_tx: watch::Sender<ConnectionState>,
	active: Option<ActiveConnection>,
	retry: Option<Retry>,
}

impl Transport {
	pub fn spawn(deps: TransportDeps, settings: TransportSettings) -> TransportHandle {
		let (tx, rx) = mpsc::channel(settings.actor.queue_capacity);
		let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected { reason: None });
		let supervisor = Self {
			deps,
			settings,
			state_tx,
			active: None,
			retry: None,
		};
		tokio::spawn(supervisor.run(rx));
		TransportHandle { tx, state_rx, settings }
	}

	async fn run(mut self, mut rx: mpsc::Receiver<TransportControl>) {
		loop {
			let retry_at = self.retry.map(|r| r.at);
			let step = tokio::select! {
				cmd = rx.recv() => Step::Control(cmd),
				reason = connection_ended(&mut self.active) => Step::Ended(reason),
				_ = retry_due(retry_at) => Step::Retry,
			};

			match step {
				Step::Control(None) => {
					self.teardown("all handles dropped").await;
					break;
				}
				Step::Control(Some(cmd)) => {
					if !self.handle_control(cmd).await {
						break;
					}
				}
				Step::Ended(reason) => {
					warn!(reason = %reason, "realtime connection lost");
					self.teardown(&reason).await;
					self.schedule_retry(1);
				}
				Step::Retry => self.retry_now().await,
			}
		}
		debug!("transport supervisor exited");
	}

	/// Returns false when the supervisor should stop.
	async fn handle_control(&mut self, cmd: TransportControl) -> bool {
		match cmd {
			TransportControl::Connect { resp } => {
				if let Some(active) = &self.active {
					let _ = resp.send(Ok(active.session_id.clone()));
					return true;
				}
				self.retry = None;
				let result = self.establish().await;
				let _ = resp.send(result);
			}
			TransportControl::Disconnect { resp } => {
				if self.retry.take().is_some() {
					info!("scheduled reconnect cancelled");
				}
				self.teardown("disconnected by request").await;
				let _ = resp.send(Ok(()));
			}
			TransportControl::Send {
				channel,
				text,
				deadline,
				resp,
			} => {
				if expired(deadline) {
					let _ = resp.send(Err(ClientCoreError::DeadlineExceeded));
					return true;
				}
				let Some(active) = &self.active else {
					let _ = resp.send(Err(ClientCoreError::NotConnected));
					return true;
				};
				let req = OutboundRequest {
					channel,
					text,
					deadline,
					resp,
				};
				if let Err(e) = active.outbound_tx.try_send(req) {
					let (err, req) = match e {
						mpsc::error::TrySendError::Full(req) => {
							(ClientCoreError::Transport("outbound queue full".to_string()), req)
						}
						mpsc::error::TrySendError::Closed(req) => (ClientCoreError::NotConnected, req),
					};
					let _ = req.resp.send(Err(err));
				}
			}
			TransportControl::Shutdown { resp } => {
				self.retry = None;
				self.teardown("shutting down").await;
				info!("transport shutting down");
				let _ = resp.send(());
				return false;
			}
		}
		true
	}

	fn set_state(&self, state: ConnectionState) {
		debug!(state = %state, "connection state");
		self.state_tx.send_replace(state);
	}

	async fn establish(&mut self) -> Result<String, ClientCoreError> {
		self.set_state(ConnectionState::Handshaking);
		match self.open().await {
			Ok(conn) => {
				let session_id = conn.session_id.clone();
				self.active = Some(conn);
				self.set_state(ConnectionState::Connected {
					session_id: session_id.clone(),
				});
				Ok(session_id)
			}
			Err(e) => {
				warn!(error = %e, "connect failed");
				self.set_state(ConnectionState::Disconnected {
					reason: Some(e.to_string()),
				});
				Err(e)
			}
		}
	}

	async fn open(&self) -> Result<ActiveConnection, ClientCoreError> {
		let handshake_timeout = self.settings.handshake_timeout;
		let start = request::remote(deadline_in(handshake_timeout), self.deps.api.rtm_start()).await?;
		self.prewarm(&start).await;

		let url = Url::parse(&start.url).map_err(|e| ClientCoreError::Transport(format!("invalid socket url: {e}")))?;
		let socket = match tokio::time::timeout(handshake_timeout, (self.deps.connector)(url)).await {
			Ok(Ok(socket)) => socket,
			Ok(Err(e)) => return Err(ClientCoreError::Transport(format!("{e:#}"))),
			Err(_) => return Err(ClientCoreError::Transport("websocket open timed out".to_string())),
		};

		let session_id = uuid::Uuid::new_v4().to_string();
		let correlator = Correlator::spawn(
			self.deps.history.clone(),
			self.deps.fanout.clone(),
			self.settings.actor,
		);

		let (sink, stream) = socket.into_parts();
		let (ended_tx, ended_rx) = mpsc::channel::<String>(2);
		let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundRequest>(self.settings.actor.queue_capacity);

		let inbound = tokio::spawn(inbound_loop(
			stream,
			InboundContext {
				history: self.deps.history.clone(),
				correlator: correlator.clone(),
				fanout: self.deps.fanout.clone(),
				request_timeout: self.settings.actor.request_timeout,
				session_id: session_id.clone(),
			},
			ended_tx.clone(),
		));
		let outbound = tokio::spawn(outbound_loop(
			sink,
			outbound_rx,
			correlator.clone(),
			ended_tx,
			session_id.clone(),
		));

		info!(session_id = %session_id, "realtime connection established");
		Ok(ActiveConnection {
			session_id,
			outbound_tx,
			correlator,
			inbound,
			outbound,
			ended_rx,
		})
	}

	/// Seed both directories from the handshake snapshot. Failures only cost cache warmth.
	async fn prewarm(&self, start: &RtmStart) {
		let channels: Vec<ChannelRecord> = start
			.channels
			.iter()
			.filter(|c| !c.name.trim().is_empty())
			.map(|c| c.record())
			.collect();
		if !channels.is_empty()
			&& let Err(e) = self.deps.channels.put_many(channels).await
		{
			warn!(error = %e, "channel pre-warm failed");
		}

		let mut users: Vec<UserRecord> = start.users.iter().map(|u| u.record()).collect();
		if let Some(me) = &start.self_info
			&& !me.name.trim().is_empty()
		{
			users.push(UserRecord::new(me.id.clone(), me.name.clone()));
		}
		if !users.is_empty() {
			match self.deps.users.insert_missing(users).await {
				Ok(added) => debug!(added, "user pre-warm"),
				Err(e) => warn!(error = %e, "user pre-warm failed"),
			}
		}
	}

	/// Stop the connection tasks and drop connection-scoped state. Directories are kept.
	async fn teardown(&mut self, reason: &str) {
		let Some(conn) = self.active.take() else {
			return;
		};
		conn.inbound.abort();
		conn.outbound.abort();
		drop(conn.outbound_tx);
		conn.correlator.shutdown().await;

		match self.deps.history.reset().await {
			Ok(dropped) => debug!(dropped, "connection-scoped history dropped"),
			Err(e) => warn!(error = %e, "history reset failed"),
		}

		info!(session_id = %conn.session_id, reason = %reason, "realtime connection closed");
		self.set_state(ConnectionState::Disconnected {
			reason: Some(reason.to_string()),
		});
	}

	fn schedule_retry(&mut self, attempt: u32) {
		let policy = self.settings.reconnect;
		if !policy.allows(attempt.saturating_sub(1)) {
			if policy.enabled {
				warn!(attempts = attempt.saturating_sub(1), "giving up on reconnect");
			}
			self.retry = None;
			return;
		}
		let delay = policy.backoff.delay(attempt);
		info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
		self.retry = Some(Retry {
			attempt,
			at: Instant::now() + delay,
		});
	}

	async fn retry_now(&mut self) {
		let Some(retry) = self.retry.take() else {
			return;
		};
		match self.establish().await {
			Ok(session_id) => info!(attempt = retry.attempt, session_id = %session_id, "reconnected"),
			Err(_) => self.schedule_retry(retry.attempt.saturating_add(1)),
		}
	}
}

async fn connection_ended(active: &mut Option<ActiveConnection>) -> String {
	match active {
		Some(conn) => conn
			.ended_rx
			.recv()
			.await
			.unwrap_or_else(|| "connection tasks exited".to_string()),
		None => std::future::pending().await,
	}
}

async fn retry_due(at: Option<Instant>) {
	match at {
		Some(at) => sleep_until(at).await,
		None => std::future::pending().await,
	}
}

struct InboundContext {
	history: HistoryHandle,
	correlator: CorrelatorHandle,
	fanout: UpdateFanout,
	request_timeout: Duration,
	session_id: String,
}

impl InboundContext {
	async fn dispatch(&self, text: &str) {
		let frame = match decode_frame(text) {
			Ok(frame) => frame,
			Err(e) => {
				metrics::counter!("parley_frames_malformed_total").increment(1);
				warn!(session_id = %self.session_id, error = %e, "malformed frame dropped");
				return;
			}
		};

		let deadline = deadline_in(self.request_timeout);
		match frame {
			InboundFrame::Message(event) => {
				let (channel, message) = event.into_remote();
				match self.history.append_until(&channel, message, deadline).await {
					Ok(true) => self.fanout.emit(&channel),
					Ok(false) => {}
					Err(e) => warn!(session_id = %self.session_id, channel = %channel, error = %e, "live message not recorded"),
				}
			}
			InboundFrame::Ack(ack) => {
				let reply_to = ack.reply_to;
				match self.correlator.ack_until(ack, deadline).await {
					Ok(outcome) => debug!(reply_to, ?outcome, "ack handled"),
					Err(ClientCoreError::Correlation(_)) => {}
					Err(e) => warn!(session_id = %self.session_id, reply_to, error = %e, "ack handling failed"),
				}
			}
			InboundFrame::Other { kind } => {
				metrics::counter!("parley_frames_unhandled_total").increment(1);
				debug!(kind = kind.as_deref().unwrap_or("<none>"), "frame ignored");
			}
		}
	}
}

async fn inbound_loop(mut stream: RtmStream, ctx: InboundContext, ended_tx: mpsc::Sender<String>) {
	let reason = loop {
		let frame = match stream.next().await {
			None => break "socket closed by peer".to_string(),
			Some(Err(e)) => break format!("socket read failed: {e}"),
			Some(Ok(frame)) => frame,
		};
		match frame {
			WsMessage::Text(text) => ctx.dispatch(text.as_str()).await,
			WsMessage::Close(Some(close)) => {
				break format!("socket closed by peer ({} {})", close.code, close.reason.as_str());
			}
			WsMessage::Close(None) => break "socket closed by peer".to_string(),
			WsMessage::Binary(_) => {
				metrics::counter!("parley_frames_unhandled_total").increment(1);
				debug!(session_id = %ctx.session_id, "binary frame ignored");
			}
			WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
		}
	};
	let _ = ended_tx.send(reason).await;
}

/// Assigns ids from 0 for this connection. Each send is registered with the
/// correlator before its frame is written.
async fn outbound_loop(
	mut sink: RtmSink,
	mut rx: mpsc::Receiver<OutboundRequest>,
	correlator: CorrelatorHandle,
	ended_tx: mpsc::Sender<String>,
	session_id: String,
) {
	let mut next_id: u64 = 0;

	while let Some(req) = rx.recv().await {
		if expired(req.deadline) {
			let _ = req.resp.send(Err(ClientCoreError::DeadlineExceeded));
			continue;
		}

		let id = next_id;
		next_id += 1;

		let pending = PendingSend {
			id,
			channel: req.channel.clone(),
			text: req.text.clone(),
		};
		if let Err(e) = correlator.register_until(pending, req.deadline).await {
			let _ = req.resp.send(Err(e));
			continue;
		}

		let encoded = match OutboundMessage::new(id, req.channel, req.text).encode() {
			Ok(encoded) => encoded,
			Err(e) => {
				let _ = correlator.cancel(id).await;
				let _ = req.resp.send(Err(e.into()));
				continue;
			}
		};

		if let Err(e) = sink.send(WsMessage::text(encoded)).await {
			let _ = correlator.cancel(id).await;
			let reason = format!("socket write failed: {e}");
			let _ = req.resp.send(Err(ClientCoreError::Transport(reason.clone())));
			let _ = ended_tx.send(reason).await;
			return;
		}
		debug!(session_id = %session_id, id, "frame sent");
		let _ = req.resp.send(Ok(id));
	}

	let _ = sink.close().await;
}

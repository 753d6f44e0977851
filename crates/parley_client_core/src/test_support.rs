#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_domain::{ChannelId, Timestamp, UserId};
use parley_platform::rtm::{BoxFuture, RtmSocket, WsConnector};
use parley_platform::{
	ApiError, HistoryPage, HistoryRange, RemoteChannel, RemoteMessage, RemoteUser, RtmSelf, RtmStart, WebApi,
};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use url::Url;

use crate::ActorSettings;

pub(crate) fn settings() -> ActorSettings {
	ActorSettings {
		queue_capacity: 16,
		request_timeout: Duration::from_millis(500),
	}
}

pub(crate) fn cid(s: &str) -> ChannelId {
	ChannelId::new(s).expect("valid channel id")
}

pub(crate) fn uid(s: &str) -> UserId {
	UserId::new(s).expect("valid user id")
}

pub(crate) fn ts(s: &str) -> Timestamp {
	Timestamp::new(s).expect("valid timestamp")
}

pub(crate) fn remote(user: &str, text: &str, t: &str) -> RemoteMessage {
	RemoteMessage::new(Some(uid(user)), text, ts(t))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Endpoint {
	ListChannels,
	ChannelInfo,
	ListUsers,
	UserInfo,
	History,
	RtmStart,
}

#[derive(Default)]
struct FakeState {
	channels: HashMap<ChannelId, RemoteChannel>,
	users: HashMap<UserId, RemoteUser>,
	/// Stored in any order; pages are served newest first.
	history: HashMap<ChannelId, Vec<RemoteMessage>>,
	calls: HashMap<Endpoint, usize>,
	failing: HashMap<Endpoint, bool>,
	delays: HashMap<Endpoint, Duration>,
	history_ranges: Vec<HistoryRange>,
	socket_url: String,
}

/// Scripted in-memory remote service.
pub(crate) struct FakeApi {
	state: Mutex<FakeState>,
	page_size: usize,
}

impl FakeApi {
	pub(crate) fn new() -> Self {
		Self {
			state: Mutex::new(FakeState {
				socket_url: "wss://rtm.test/socket".to_string(),
				..FakeState::default()
			}),
			page_size: 2,
		}
	}

	pub(crate) fn with_channel(self, id: &str, name: &str) -> Self {
		self.state.lock().unwrap().channels.insert(
			cid(id),
			RemoteChannel {
				id: cid(id),
				name: name.to_string(),
				is_member: true,
				is_archived: false,
			},
		);
		self
	}

	/// `channels.info` for `requested` answers with whatever record is given here.
	pub(crate) fn with_channel_reply(self, requested: &str, id: &str, name: &str) -> Self {
		self.state.lock().unwrap().channels.insert(
			cid(requested),
			RemoteChannel {
				id: cid(id),
				name: name.to_string(),
				is_member: true,
				is_archived: false,
			},
		);
		self
	}

	pub(crate) fn with_user(self, id: &str, name: &str) -> Self {
		self.add_user(id, name);
		self
	}

	pub(crate) fn add_user(&self, id: &str, name: &str) {
		self.state.lock().unwrap().users.insert(
			uid(id),
			RemoteUser {
				id: uid(id),
				name: name.to_string(),
				deleted: false,
				real_name: None,
			},
		);
	}

	pub(crate) fn with_message(self, channel: &str, message: RemoteMessage) -> Self {
		self.push_message(channel, message);
		self
	}

	pub(crate) fn push_message(&self, channel: &str, message: RemoteMessage) {
		self.state.lock().unwrap().history.entry(cid(channel)).or_default().push(message);
	}

	pub(crate) fn set_failing(&self, endpoint: Endpoint, failing: bool) {
		self.state.lock().unwrap().failing.insert(endpoint, failing);
	}

	pub(crate) fn set_delay(&self, endpoint: Endpoint, delay: Duration) {
		self.state.lock().unwrap().delays.insert(endpoint, delay);
	}

	pub(crate) fn calls(&self, endpoint: Endpoint) -> usize {
		self.state.lock().unwrap().calls.get(&endpoint).copied().unwrap_or(0)
	}

	pub(crate) fn history_ranges(&self) -> Vec<HistoryRange> {
		self.state.lock().unwrap().history_ranges.clone()
	}

	async fn enter(&self, endpoint: Endpoint, method: &'static str) -> Result<(), ApiError> {
		let (delay, failing) = {
			let mut st = self.state.lock().unwrap();
			*st.calls.entry(endpoint).or_default() += 1;
			(
				st.delays.get(&endpoint).copied(),
				st.failing.get(&endpoint).copied().unwrap_or(false),
			)
		};
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		if failing {
			return Err(ApiError::NotOk {
				method,
				error: Some("fake_failure".to_string()),
			});
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl WebApi for FakeApi {
	async fn list_channels(&self) -> Result<Vec<RemoteChannel>, ApiError> {
		self.enter(Endpoint::ListChannels, "channels.list").await?;
		let mut channels: Vec<_> = self.state.lock().unwrap().channels.values().cloned().collect();
		channels.sort_by(|a, b| a.id.cmp(&b.id));
		Ok(channels)
	}

	async fn channel_info(&self, id: &ChannelId) -> Result<RemoteChannel, ApiError> {
		self.enter(Endpoint::ChannelInfo, "channels.info").await?;
		self.state
			.lock()
			.unwrap()
			.channels
			.get(id)
			.cloned()
			.ok_or(ApiError::NotOk {
				method: "channels.info",
				error: Some("channel_not_found".to_string()),
			})
	}

	async fn list_users(&self) -> Result<Vec<RemoteUser>, ApiError> {
		self.enter(Endpoint::ListUsers, "users.list").await?;
		Ok(self.state.lock().unwrap().users.values().cloned().collect())
	}

	async fn user_info(&self, id: &UserId) -> Result<RemoteUser, ApiError> {
		self.enter(Endpoint::UserInfo, "users.info").await?;
		self.state.lock().unwrap().users.get(id).cloned().ok_or(ApiError::NotOk {
			method: "users.info",
			error: Some("user_not_found".to_string()),
		})
	}

	async fn history_page(&self, channel: &ChannelId, range: &HistoryRange) -> Result<HistoryPage, ApiError> {
		self.enter(Endpoint::History, "channels.history").await?;
		let mut st = self.state.lock().unwrap();
		st.history_ranges.push(range.clone());

		let mut matching: Vec<RemoteMessage> = st
			.history
			.get(channel)
			.map(|msgs| {
				msgs.iter()
					.filter(|m| range.latest.as_ref().is_none_or(|latest| &m.ts < latest))
					.filter(|m| range.oldest.as_ref().is_none_or(|oldest| &m.ts > oldest))
					.cloned()
					.collect()
			})
			.unwrap_or_default();
		matching.sort_by(|a, b| b.ts.cmp(&a.ts));

		let has_more = matching.len() > self.page_size;
		matching.truncate(self.page_size);
		Ok(HistoryPage {
			messages: matching,
			has_more,
		})
	}

	async fn rtm_start(&self) -> Result<RtmStart, ApiError> {
		self.enter(Endpoint::RtmStart, "rtm.start").await?;
		let st = self.state.lock().unwrap();
		Ok(RtmStart {
			url: st.socket_url.clone(),
			self_info: Some(RtmSelf {
				id: uid("U0"),
				name: "operator".to_string(),
			}),
			users: st.users.values().cloned().collect(),
			channels: st.channels.values().cloned().collect(),
		})
	}
}

pub(crate) type ServerSocket = WebSocketStream<DuplexStream>;

/// Connector backed by in-memory duplex pipes; each connect hands the server end to the test.
pub(crate) struct FakeSockets {
	pub(crate) connector: WsConnector,
	pub(crate) accepted: mpsc::UnboundedReceiver<ServerSocket>,
	refuse: Arc<AtomicBool>,
}

impl FakeSockets {
	pub(crate) fn new() -> Self {
		let (tx, accepted) = mpsc::unbounded_channel();
		let refuse = Arc::new(AtomicBool::new(false));
		let refuse_flag = Arc::clone(&refuse);

		let connector: WsConnector = Arc::new(move |_url: Url| {
			let tx = tx.clone();
			let refuse = refuse_flag.load(Ordering::SeqCst);
			Box::pin(async move {
				if refuse {
					anyhow::bail!("connection refused");
				}
				let (client_io, server_io) = tokio::io::duplex(64 * 1024);
				let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
				let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
				tx.send(server).map_err(|_| anyhow::anyhow!("test dropped the accept queue"))?;
				Ok(RtmSocket::from_websocket(client))
			}) as BoxFuture<'static, anyhow::Result<RtmSocket>>
		});

		Self {
			connector,
			accepted,
			refuse,
		}
	}

	pub(crate) fn set_refuse(&self, refuse: bool) {
		self.refuse.store(refuse, Ordering::SeqCst);
	}

	pub(crate) async fn accept(&mut self) -> ServerSocket {
		tokio::time::timeout(Duration::from_secs(2), self.accepted.recv())
			.await
			.expect("connector was not called in time")
			.expect("accept queue closed")
	}
}

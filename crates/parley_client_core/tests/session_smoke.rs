#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parley_client_core::{Client, ClientConfig, ConnectionState, ReconnectPolicy};
use parley_domain::{ChannelId, Timestamp, UserId};
use parley_platform::rtm::{BoxFuture, RtmSocket, WsConnector};
use parley_platform::{
	ApiError, HistoryPage, HistoryRange, RemoteChannel, RemoteMessage, RemoteUser, RtmSelf, RtmStart, WebApi,
};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::Role;

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("PARLEY_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

fn cid(s: &str) -> ChannelId {
	ChannelId::new(s).expect("channel id")
}

fn uid(s: &str) -> UserId {
	UserId::new(s).expect("user id")
}

fn ts(s: &str) -> Timestamp {
	Timestamp::new(s).expect("timestamp")
}

/// One channel, one user, a two-message backlog; history served in a single page.
struct Workspace {
	backlog: Mutex<Vec<RemoteMessage>>,
}

impl Workspace {
	fn new() -> Self {
		Self {
			backlog: Mutex::new(vec![
				RemoteMessage::new(Some(uid("U1")), "first", ts("100.000001")),
				RemoteMessage::new(Some(uid("U1")), "second", ts("200.000001")),
			]),
		}
	}

	fn general() -> RemoteChannel {
		RemoteChannel {
			id: cid("C1"),
			name: "general".to_string(),
			is_member: true,
			is_archived: false,
		}
	}

	fn alice() -> RemoteUser {
		RemoteUser {
			id: uid("U1"),
			name: "alice".to_string(),
			deleted: false,
			real_name: Some("Alice Example".to_string()),
		}
	}
}

#[async_trait::async_trait]
impl WebApi for Workspace {
	async fn list_channels(&self) -> Result<Vec<RemoteChannel>, ApiError> {
		Ok(vec![Self::general()])
	}

	async fn channel_info(&self, id: &ChannelId) -> Result<RemoteChannel, ApiError> {
		if *id == cid("C1") {
			return Ok(Self::general());
		}
		Err(ApiError::NotOk {
			method: "channels.info",
			error: Some("channel_not_found".to_string()),
		})
	}

	async fn list_users(&self) -> Result<Vec<RemoteUser>, ApiError> {
		Ok(vec![Self::alice()])
	}

	async fn user_info(&self, _id: &UserId) -> Result<RemoteUser, ApiError> {
		Err(ApiError::NotOk {
			method: "users.info",
			error: Some("user_not_found".to_string()),
		})
	}

	async fn history_page(&self, channel: &ChannelId, range: &HistoryRange) -> Result<HistoryPage, ApiError> {
		if *channel != cid("C1") {
			return Ok(HistoryPage::default());
		}
		let mut messages: Vec<RemoteMessage> = self
			.backlog
			.lock()
			.unwrap()
			.iter()
			.filter(|m| range.latest.as_ref().is_none_or(|latest| &m.ts < latest))
			.cloned()
			.collect();
		messages.sort_by(|a, b| b.ts.cmp(&a.ts));
		Ok(HistoryPage {
			messages,
			has_more: false,
		})
	}

	async fn rtm_start(&self) -> Result<RtmStart, ApiError> {
		Ok(RtmStart {
			url: "wss://rtm.example.test/socket".to_string(),
			self_info: Some(RtmSelf {
				id: uid("U0"),
				name: "tester".to_string(),
			}),
			users: vec![Self::alice()],
			channels: vec![Self::general()],
		})
	}
}

type ServerSocket = WebSocketStream<DuplexStream>;

fn duplex_connector() -> (WsConnector, mpsc::UnboundedReceiver<ServerSocket>) {
	let (tx, rx) = mpsc::unbounded_channel();
	let connector: WsConnector = Arc::new(move |_url: url::Url| {
		let tx = tx.clone();
		Box::pin(async move {
			let (client_io, server_io) = tokio::io::duplex(64 * 1024);
			let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
			let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
			tx.send(server).map_err(|_| anyhow::anyhow!("server side dropped"))?;
			Ok(RtmSocket::from_websocket(client))
		}) as BoxFuture<'static, anyhow::Result<RtmSocket>>
	});
	(connector, rx)
}

fn test_config() -> ClientConfig {
	ClientConfig {
		self_name: "tester".to_string(),
		request_timeout: Duration::from_secs(2),
		handshake_timeout: Duration::from_secs(2),
		reconnect: ReconnectPolicy::disabled(),
		..ClientConfig::default()
	}
}

#[tokio::test]
async fn client_boundary_end_to_end() -> anyhow::Result<()> {
	init_test_logging();

	let (connector, mut accepted) = duplex_connector();
	let client = Client::start_with(Arc::new(Workspace::new()), connector, &test_config()).await?;

	// directories
	assert_eq!(client.get_channel_id("general").await?, cid("C1"));
	assert_eq!(client.get_channel_name(&cid("C1")).await?, "general");
	assert_eq!(client.get_user_name(&uid("U1")).await?, "alice");
	assert_eq!(client.get_user_name(&UserId::local_self()).await?, "tester");
	assert_eq!(client.channel_display_name(&cid("C404")).await, "<unknown channel C404>");
	assert_eq!(client.user_display_name(&uid("U404")).await, "<unknown user U404>");

	client.register_channel(cid("C9"), "ops").await?;
	assert_eq!(client.get_channel_id("ops").await?, cid("C9"));
	let names: Vec<String> = client.list_channels().await?.into_iter().map(|c| c.name).collect();
	assert_eq!(names, ["general", "ops"]);

	// cold history
	let history = client.get_history(&cid("C1")).await?;
	let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
	assert_eq!(texts, ["second", "first"]);

	// realtime
	let mut updates = client.subscribe_updates();
	let session_id = client.connect().await?;
	assert_eq!(client.connection_state(), ConnectionState::Connected { session_id });
	let mut server = timeout(Duration::from_secs(2), accepted.recv())
		.await?
		.expect("socket opened");

	server
		.send(WsMessage::text(
			r#"{"type":"message","channel":"C1","user":"U1","text":"live","ts":"300.000001"}"#,
		))
		.await?;
	assert_eq!(timeout(Duration::from_secs(2), updates.recv()).await??, cid("C1"));
	let history = client.get_history(&cid("C1")).await?;
	assert_eq!(history.newest().map(|m| m.text.as_str()), Some("live"));
	assert_eq!(history.len(), 3);

	let send_id = client.send_message(cid("C1"), "ping").await?;
	let frame = timeout(Duration::from_secs(2), server.next()).await?.expect("frame")?;
	let frame: serde_json::Value = serde_json::from_str(frame.to_text()?)?;
	assert_eq!(frame["id"], send_id);
	assert_eq!(frame["text"], "ping");

	let ack = format!(r#"{{"ok":true,"reply_to":{send_id},"ts":"400.000001","text":"ping"}}"#);
	server.send(WsMessage::text(ack)).await?;
	assert_eq!(timeout(Duration::from_secs(2), updates.recv()).await??, cid("C1"));

	let history = client.get_history(&cid("C1")).await?;
	let newest = history.newest().expect("confirmed send");
	assert_eq!(newest.author_name, "tester");
	assert_eq!(newest.text, "ping");
	assert_eq!(newest.timestamp, ts("400.000001"));

	client.disconnect().await?;
	assert!(!client.connection_state().is_connected());
	assert_eq!(client.get_channel_id("general").await?, cid("C1"));

	client.shutdown().await;
	Ok(())
}

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use parley_domain::{ChannelHistory, ChannelId, ChannelRecord, Placeholder, UserId};
use parley_platform::WebApi;
use parley_platform::rtm::{WsConnector, default_connector};
use parley_platform::web::WebApiClient;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::channel_directory::{ChannelDirectory, ChannelDirectoryHandle};
use crate::fanout::{UpdateFanout, UpdateRx};
use crate::history::{HistoryCache, HistoryHandle};
use crate::request::{self, deadline_in};
use crate::transport::{ConnectionState, Transport, TransportDeps, TransportHandle, TransportSettings};
use crate::user_directory::{UserDirectory, UserDirectoryHandle};
use crate::{ClientConfig, ClientCoreError};

/// The boundary offered to a presentation layer.
///
/// Wires the actors in dependency order: users, channels, history (needs users),
/// transport (needs all three). Cloning is cheap; every clone talks to the same actors.
#[derive(Clone, Debug)]
pub struct Client {
	channels: ChannelDirectoryHandle,
	users: UserDirectoryHandle,
	history: HistoryHandle,
	transport: TransportHandle,
	fanout: UpdateFanout,
}

impl Client {
	/// Build the REST client and websocket connector from `cfg` and start every actor.
	pub async fn start(cfg: &ClientConfig) -> anyhow::Result<Self> {
		let token = cfg
			.token
			.clone()
			.context("no API token configured (set PARLEY_TOKEN or `token` in config.toml)")?;
		let api = WebApiClient::new(&cfg.api_base_url, token, cfg.request_timeout).context("build web api client")?;
		Self::start_with(Arc::new(api), default_connector(), cfg).await
	}

	/// Start against any `WebApi` and socket connector.
	pub async fn start_with(api: Arc<dyn WebApi>, connector: WsConnector, cfg: &ClientConfig) -> anyhow::Result<Self> {
		let settings = cfg.actor_settings();

		let users = UserDirectory::start(api.clone(), cfg.self_name.clone(), settings)
			.await
			.context("preload user directory")?;

		let channels = ChannelDirectory::spawn(api.clone(), settings);
		match request::remote(deadline_in(settings.request_timeout), api.list_channels()).await {
			Ok(remote) => {
				let records: Vec<ChannelRecord> = remote
					.iter()
					.filter(|c| !c.name.trim().is_empty())
					.map(|c| c.record())
					.collect();
				if let Err(e) = channels.put_many(records).await {
					warn!(error = %e, "channel seed failed");
				}
			}
			Err(e) => warn!(error = %e, "channel list unavailable; directory starts cold"),
		}

		let history = HistoryCache::spawn(api.clone(), users.clone(), settings);
		let fanout = UpdateFanout::new(cfg.fanout_capacity);

		let transport = Transport::spawn(
			TransportDeps {
				api,
				channels: channels.clone(),
				users: users.clone(),
				history: history.clone(),
				fanout: fanout.clone(),
				connector,
			},
			TransportSettings {
				actor: settings,
				handshake_timeout: cfg.handshake_timeout,
				reconnect: cfg.reconnect,
			},
		);

		info!("client started");
		Ok(Self {
			channels,
			users,
			history,
			transport,
			fanout,
		})
	}

	pub async fn get_channel_id(&self, name: &str) -> Result<ChannelId, ClientCoreError> {
		self.channels.get_id(name).await
	}

	pub async fn get_channel_name(&self, id: &ChannelId) -> Result<String, ClientCoreError> {
		self.channels.get_name(id).await
	}

	pub async fn get_user_name(&self, id: &UserId) -> Result<String, ClientCoreError> {
		self.users.get_name(id).await
	}

	/// Newest-first history, fetched in full on first access.
	pub async fn get_history(&self, channel: &ChannelId) -> Result<ChannelHistory, ClientCoreError> {
		self.history.get(channel).await
	}

	/// Queue a message. Returns the send id once written; confirmation arrives as a
	/// `channel-updated` notification when the server acknowledges it.
	pub async fn send_message(&self, channel: ChannelId, text: impl Into<String>) -> Result<u64, ClientCoreError> {
		self.transport.send_message(channel, text).await
	}

	pub async fn register_channel(&self, id: ChannelId, name: impl Into<String>) -> Result<(), ClientCoreError> {
		self.channels.put(name, id).await
	}

	pub async fn list_channels(&self) -> Result<Vec<ChannelRecord>, ClientCoreError> {
		self.channels.list().await
	}

	/// Channel name, or a placeholder when it cannot be resolved.
	pub async fn channel_display_name(&self, id: &ChannelId) -> String {
		self.channels
			.get_name(id)
			.await
			.unwrap_or_else(|_| Placeholder::channel(id))
	}

	pub async fn user_display_name(&self, id: &UserId) -> String {
		self.users.get_name(id).await.unwrap_or_else(|_| Placeholder::user(id))
	}

	/// `channel-updated` notifications.
	pub fn subscribe_updates(&self) -> UpdateRx {
		self.fanout.subscribe()
	}

	pub fn connection_state(&self) -> ConnectionState {
		self.transport.state()
	}

	pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
		self.transport.watch_state()
	}

	pub async fn connect(&self) -> Result<String, ClientCoreError> {
		self.transport.connect().await
	}

	pub async fn disconnect(&self) -> Result<(), ClientCoreError> {
		self.transport.disconnect().await
	}

	/// Stop every actor, dependents first.
	pub async fn shutdown(&self) {
		self.transport.shutdown().await;
		self.history.shutdown().await;
		self.users.shutdown().await;
		self.channels.shutdown().await;
		info!("client stopped");
	}
}

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_platform::SecretString;
use parley_platform::web::DEFAULT_BASE_URL;
use parley_util::backoff::Backoff;
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_SELF_NAME: &str = "me";
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_FANOUT_CAPACITY: usize = 256;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the client config from TOML and env overrides.
pub fn load_client_config() -> anyhow::Result<ClientConfig> {
	let path = default_config_path()?;
	load_client_config_from_path(&path)
}

/// Same as `load_client_config` but with an explicit config path.
pub fn load_client_config_from_path(path: &Path) -> anyhow::Result<ClientConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ClientConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	Ok(cfg)
}

/// When and how the transport re-establishes a lost connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
	pub enabled: bool,
	pub backoff: Backoff,
	/// `None` retries forever.
	pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			enabled: true,
			backoff: Backoff::default(),
			max_attempts: None,
		}
	}
}

impl ReconnectPolicy {
	pub fn disabled() -> Self {
		Self {
			enabled: false,
			..Self::default()
		}
	}

	/// Whether another attempt is allowed after `failed` consecutive failures.
	pub fn allows(&self, failed: u32) -> bool {
		self.enabled && self.max_attempts.is_none_or(|max| failed < max)
	}
}

/// Queue size and default request deadline shared by the actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorSettings {
	pub queue_capacity: usize,
	pub request_timeout: Duration,
}

impl Default for ActorSettings {
	fn default() -> Self {
		Self {
			queue_capacity: DEFAULT_QUEUE_CAPACITY,
			request_timeout: Duration::from_secs(15),
		}
	}
}

/// Client config.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Pre-obtained API credential.
	pub token: Option<SecretString>,
	pub api_base_url: String,
	/// Display name of the local operator.
	pub self_name: String,
	pub request_timeout: Duration,
	/// Bound on `rtm.start` plus the websocket open.
	pub handshake_timeout: Duration,
	pub reconnect: ReconnectPolicy,
	pub queue_capacity: usize,
	pub fanout_capacity: usize,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			token: None,
			api_base_url: DEFAULT_BASE_URL.to_string(),
			self_name: DEFAULT_SELF_NAME.to_string(),
			request_timeout: Duration::from_secs(15),
			handshake_timeout: Duration::from_secs(15),
			reconnect: ReconnectPolicy::default(),
			queue_capacity: DEFAULT_QUEUE_CAPACITY,
			fanout_capacity: DEFAULT_FANOUT_CAPACITY,
		}
	}
}

impl ClientConfig {
	pub fn actor_settings(&self) -> ActorSettings {
		ActorSettings {
			queue_capacity: self.queue_capacity.max(1),
			request_timeout: self.request_timeout,
		}
	}

	fn from_file(file: FileConfig) -> Self {
		let defaults = Self::default();

		let min = file
			.reconnect
			.min_delay_ms
			.map(Duration::from_millis)
			.unwrap_or(defaults.reconnect.backoff.min);
		let max = file
			.reconnect
			.max_delay_ms
			.map(Duration::from_millis)
			.unwrap_or(defaults.reconnect.backoff.max);

		Self {
			token: file.token.filter(|s| !s.trim().is_empty()).map(SecretString::new),
			api_base_url: file
				.api_base_url
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.api_base_url),
			self_name: file
				.self_name
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.self_name),
			request_timeout: file
				.request_timeout_ms
				.filter(|v| *v > 0)
				.map(Duration::from_millis)
				.unwrap_or(defaults.request_timeout),
			handshake_timeout: file
				.handshake_timeout_ms
				.filter(|v| *v > 0)
				.map(Duration::from_millis)
				.unwrap_or(defaults.handshake_timeout),
			reconnect: ReconnectPolicy {
				enabled: file.reconnect.enabled.unwrap_or(defaults.reconnect.enabled),
				backoff: Backoff { min, max },
				max_attempts: file.reconnect.max_attempts,
			},
			queue_capacity: file.queue_capacity.filter(|v| *v > 0).unwrap_or(defaults.queue_capacity),
			fanout_capacity: file.fanout_capacity.filter(|v| *v > 0).unwrap_or(defaults.fanout_capacity),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	token: Option<String>,
	api_base_url: Option<String>,
	self_name: Option<String>,
	request_timeout_ms: Option<u64>,
	handshake_timeout_ms: Option<u64>,
	queue_capacity: Option<usize>,
	fanout_capacity: Option<usize>,

	#[serde(default)]
	reconnect: FileReconnectSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileReconnectSettings {
	enabled: Option<bool>,
	min_delay_ms: Option<u64>,
	max_delay_ms: Option<u64>,
	max_attempts: Option<u32>,
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Apply `PARLEY_*` overrides; `lookup` is `std::env::var` outside tests.
fn apply_env_overrides(cfg: &mut ClientConfig, lookup: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("PARLEY_TOKEN") {
		cfg.token = Some(SecretString::new(v));
		info!("client config: token overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_API_BASE_URL") {
		info!(api_base_url = %v, "client config: api_base_url overridden by env");
		cfg.api_base_url = v;
	}

	if let Some(v) = non_empty("PARLEY_SELF_NAME") {
		info!(self_name = %v, "client config: self_name overridden by env");
		cfg.self_name = v;
	}

	if let Some(v) = non_empty("PARLEY_REQUEST_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.request_timeout = Duration::from_millis(ms);
		info!(ms, "client config: request_timeout overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_HANDSHAKE_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.handshake_timeout = Duration::from_millis(ms);
		info!(ms, "client config: handshake_timeout overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_RECONNECT")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.reconnect.enabled = enabled;
		info!(enabled, "client config: reconnect.enabled overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_RECONNECT_MIN_DELAY_MS")
		&& let Ok(min_ms) = v.parse::<u64>()
	{
		cfg.reconnect.backoff.min = Duration::from_millis(min_ms);
		info!(min_ms, "client config: reconnect.min_delay overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_RECONNECT_MAX_DELAY_MS")
		&& let Ok(max_ms) = v.parse::<u64>()
	{
		cfg.reconnect.backoff.max = Duration::from_millis(max_ms);
		info!(max_ms, "client config: reconnect.max_delay overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_RECONNECT_MAX_ATTEMPTS")
		&& let Ok(max_attempts) = v.parse::<u32>()
	{
		cfg.reconnect.max_attempts = Some(max_attempts);
		info!(max_attempts, "client config: reconnect.max_attempts overridden by env");
	}

	let backoff = cfg.reconnect.backoff;
	if backoff.min > backoff.max {
		warn!(
			min_ms = backoff.min.as_millis(),
			max_ms = backoff.max.as_millis(),
			"client config: reconnect.min_delay > reconnect.max_delay; swapping"
		);
		cfg.reconnect.backoff = Backoff::new(backoff.min, backoff.max);
	}
}

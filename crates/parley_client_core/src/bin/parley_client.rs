#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::Context as _;
use parley_client_core::{Client, ConnectionState, load_client_config, load_client_config_from_path};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_client [--config path]\n\
\n\
Options:\n\
	--config    Config file (default: ~/.parley/config.toml)\n\
	--help      Show this help\n\
\n\
Input:\n\
	#channel text        send a message\n\
	/history #channel    print a channel's history\n\
	/quit                exit\n\
\n\
Environment:\n\
	PARLEY_TOKEN         API token (required unless set in the config file)\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_client_core=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

fn parse_args() -> Option<PathBuf> {
	let mut config: Option<PathBuf> = None;
	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}
	config
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
	Send { channel: String, text: String },
	History { channel: String },
	Quit,
	Blank,
}

fn parse_line(line: &str) -> Result<Input, String> {
	let line = line.trim();
	if line.is_empty() {
		return Ok(Input::Blank);
	}
	if line == "/quit" {
		return Ok(Input::Quit);
	}
	if let Some(rest) = line.strip_prefix("/history") {
		let channel = rest.trim().strip_prefix('#').unwrap_or(rest.trim());
		if channel.is_empty() {
			return Err("usage: /history #channel".to_string());
		}
		return Ok(Input::History {
			channel: channel.to_string(),
		});
	}
	if let Some(rest) = line.strip_prefix('#') {
		let (channel, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
		let text = text.trim();
		if channel.is_empty() || text.is_empty() {
			return Err("usage: #channel text".to_string());
		}
		return Ok(Input::Send {
			channel: channel.to_string(),
			text: text.to_string(),
		});
	}
	Err(format!("unrecognized input: {line}"))
}

async fn print_history(client: &Client, channel: &str) -> anyhow::Result<()> {
	let id = client.get_channel_id(channel).await?;
	let history = client.get_history(&id).await?;
	// oldest first reads naturally in a terminal
	for m in history.to_vec().iter().rev() {
		println!("[#{channel} {}] {}: {}", m.timestamp, m.author_name, m.text);
	}
	Ok(())
}

async fn handle_input(client: &Client, input: Input) -> anyhow::Result<bool> {
	match input {
		Input::Blank => {}
		Input::Quit => return Ok(false),
		Input::History { channel } => print_history(client, &channel).await?,
		Input::Send { channel, text } => {
			let id = client.get_channel_id(&channel).await?;
			let send_id = client.send_message(id, text).await?;
			info!(channel = %channel, send_id, "message queued");
		}
	}
	Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let config_path = parse_args();

	let cfg = match &config_path {
		Some(path) => load_client_config_from_path(path)?,
		None => load_client_config()?,
	};

	let client = Client::start(&cfg).await.context("start client")?;
	let session_id = client.connect().await.context("connect to realtime api")?;
	info!(session_id = %session_id, "connected");

	for channel in client.list_channels().await? {
		println!("#{} ({})", channel.name, channel.id);
	}

	let mut updates = client.subscribe_updates();
	let printer = client.clone();
	tokio::spawn(async move {
		loop {
			match updates.recv().await {
				Ok(channel) => {
					let name = printer.channel_display_name(&channel).await;
					match printer.get_history(&channel).await {
						Ok(history) => {
							if let Some(m) = history.newest() {
								println!("[#{name}] {}: {}", m.author_name, m.text);
							}
						}
						Err(e) => warn!(channel = %channel, error = %e, "history unavailable"),
					}
				}
				Err(RecvError::Lagged(skipped)) => warn!(skipped, "update printer fell behind"),
				Err(RecvError::Closed) => break,
			}
		}
	});

	let mut state_rx = client.watch_connection();
	tokio::spawn(async move {
		while state_rx.changed().await.is_ok() {
			let state = state_rx.borrow_and_update().clone();
			if let ConnectionState::Disconnected { reason: Some(reason) } = &state {
				warn!(reason = %reason, "connection lost");
			}
			eprintln!("* {state}");
		}
	});

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	while let Some(line) = lines.next_line().await.context("read stdin")? {
		let input = match parse_line(&line) {
			Ok(input) => input,
			Err(msg) => {
				eprintln!("{msg}");
				continue;
			}
		};
		match handle_input(&client, input).await {
			Ok(true) => {}
			Ok(false) => break,
			Err(e) => eprintln!("error: {e:#}"),
		}
	}

	client.shutdown().await;
	Ok(())
}

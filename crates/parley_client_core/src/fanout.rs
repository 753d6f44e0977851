#![forbid(unsafe_code)]

use parley_domain::ChannelId;
use tokio::sync::broadcast;
use tracing::trace;

/// Receiver half of the channel-updated stream.
pub type UpdateRx = broadcast::Receiver<ChannelId>;

/// Broadcast of "this channel changed" events.
///
/// Knows nothing about which channel the presentation layer is focused on.
#[derive(Debug, Clone)]
pub struct UpdateFanout {
	tx: broadcast::Sender<ChannelId>,
}

impl UpdateFanout {
	pub fn new(capacity: usize) -> Self {
		let (tx, _rx) = broadcast::channel(capacity.max(1));
		Self { tx }
	}

	pub fn emit(&self, channel: &ChannelId) {
		if self.tx.send(channel.clone()).is_err() {
			trace!(channel = %channel, "no update subscribers");
		}
	}

	pub fn subscribe(&self) -> UpdateRx {
		self.tx.subscribe()
	}
}

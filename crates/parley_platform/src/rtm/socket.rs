#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use url::Url;

pub type WsMessage = tokio_tungstenite::tungstenite::Message;
pub type WsError = tokio_tungstenite::tungstenite::Error;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type RtmSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;
pub type RtmStream = Pin<Box<dyn Stream<Item = Result<WsMessage, WsError>> + Send>>;

/// Opens the realtime socket for a handshake URL. Swappable in tests.
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<RtmSocket>> + Send + Sync>;

/// A connected realtime socket, split into its write and read halves.
pub struct RtmSocket {
	sink: RtmSink,
	stream: RtmStream,
}

impl RtmSocket {
	pub fn from_websocket<S>(ws: WebSocketStream<S>) -> Self
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let (sink, stream) = ws.split();
		Self {
			sink: Box::pin(sink),
			stream: Box::pin(stream),
		}
	}

	pub fn into_parts(self) -> (RtmSink, RtmStream) {
		(self.sink, self.stream)
	}
}

impl std::fmt::Debug for RtmSocket {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RtmSocket").finish_non_exhaustive()
	}
}

pub async fn connect_websocket(url: Url) -> anyhow::Result<RtmSocket> {
	debug!(host = url.host_str().unwrap_or(""), "opening rtm websocket");
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to rtm ws")?;
	Ok(RtmSocket::from_websocket(ws))
}

pub fn default_connector() -> WsConnector {
	Arc::new(|url: Url| Box::pin(async move { connect_websocket(url).await }) as BoxFuture<'static, anyhow::Result<RtmSocket>>)
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use futures_util::SinkExt;
	use tokio::time::timeout;
	use tokio_tungstenite::tungstenite::protocol::Role;

	use super::*;

	#[tokio::test]
	async fn split_socket_carries_text_both_ways() {
		let (client_io, server_io) = tokio::io::duplex(4096);
		let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
		let mut server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;

		let (mut sink, mut stream) = RtmSocket::from_websocket(client).into_parts();

		sink.send(WsMessage::text(r#"{"id":0}"#)).await.expect("client send");
		let got = timeout(Duration::from_millis(500), server.next())
			.await
			.expect("server recv timeout")
			.expect("server stream open")
			.expect("server frame");
		assert_eq!(got.to_text().expect("text"), r#"{"id":0}"#);

		server.send(WsMessage::text(r#"{"type":"hello"}"#)).await.expect("server send");
		let got = timeout(Duration::from_millis(500), stream.next())
			.await
			.expect("client recv timeout")
			.expect("client stream open")
			.expect("client frame");
		assert_eq!(got.to_text().expect("text"), r#"{"type":"hello"}"#);
	}
}

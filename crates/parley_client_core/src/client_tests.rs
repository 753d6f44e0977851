#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::test_support::{Endpoint, FakeApi, FakeSockets, cid};
use crate::{Client, ClientConfig, ClientCoreError, ReconnectPolicy};

fn config() -> ClientConfig {
	ClientConfig {
		self_name: "tester".to_string(),
		request_timeout: Duration::from_millis(200),
		handshake_timeout: Duration::from_millis(500),
		reconnect: ReconnectPolicy::disabled(),
		..ClientConfig::default()
	}
}

#[tokio::test]
async fn start_seeds_channels_from_the_list() {
	let api = Arc::new(FakeApi::new().with_channel("C1", "general").with_user("U1", "alice"));
	let sockets = FakeSockets::new();
	let client = Client::start_with(api.clone(), sockets.connector.clone(), &config())
		.await
		.expect("start");

	assert_eq!(client.get_channel_id("general").await.expect("seeded"), cid("C1"));
	assert_eq!(api.calls(Endpoint::ListChannels), 1);
	client.shutdown().await;
}

#[tokio::test]
async fn stalled_channel_list_is_bounded_and_start_continues_cold() {
	let api = Arc::new(FakeApi::new().with_channel("C1", "general").with_user("U1", "alice"));
	api.set_delay(Endpoint::ListChannels, Duration::from_secs(30));
	let sockets = FakeSockets::new();

	let started = Instant::now();
	let client = Client::start_with(api.clone(), sockets.connector.clone(), &config())
		.await
		.expect("start");
	assert!(started.elapsed() < Duration::from_secs(5));

	assert!(client.list_channels().await.expect("list").is_empty());
	let err = client.get_channel_id("general").await.expect_err("cold directory");
	assert!(matches!(err, ClientCoreError::NotFound(_)), "got: {err:?}");

	// names still resolve on demand
	assert_eq!(client.get_channel_name(&cid("C1")).await.expect("name"), "general");
	client.shutdown().await;
}

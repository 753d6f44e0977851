#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::ClientCoreError;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, ClientCoreError>>;

/// Absolute deadline `timeout` from now.
pub fn deadline_in(timeout: Duration) -> Instant {
	Instant::now() + timeout
}

pub(crate) fn expired(deadline: Instant) -> bool {
	Instant::now() >= deadline
}

/// Send a command built around a fresh reply slot and wait for the answer until `deadline`.
pub(crate) async fn call<C, T>(
	tx: &mpsc::Sender<C>,
	actor: &'static str,
	deadline: Instant,
	make: impl FnOnce(Reply<T>) -> C,
) -> Result<T, ClientCoreError> {
	let (resp_tx, resp_rx) = oneshot::channel();
	let exchange = async {
		tx.send(make(resp_tx))
			.await
			.map_err(|_| ClientCoreError::ActorClosed(actor))?;
		resp_rx.await.map_err(|_| ClientCoreError::ActorClosed(actor))?
	};
	match tokio::time::timeout_at(deadline, exchange).await {
		Ok(result) => result,
		Err(_) => Err(ClientCoreError::DeadlineExceeded),
	}
}

/// Bound a remote call by `deadline`.
pub(crate) async fn remote<T, E>(deadline: Instant, fut: impl Future<Output = Result<T, E>>) -> Result<T, ClientCoreError>
where
	ClientCoreError: From<E>,
{
	match tokio::time::timeout_at(deadline, fut).await {
		Ok(result) => result.map_err(ClientCoreError::from),
		Err(_) => Err(ClientCoreError::DeadlineExceeded),
	}
}

/// Ask an actor to stop and wait for it to acknowledge.
pub(crate) async fn stop<C>(tx: &mpsc::Sender<C>, timeout: Duration, make: impl FnOnce(oneshot::Sender<()>) -> C) {
	let (resp_tx, resp_rx) = oneshot::channel();
	if tx.send(make(resp_tx)).await.is_err() {
		return;
	}
	let _ = tokio::time::timeout(timeout, resp_rx).await;
}

#[cfg(test)]
mod tests {
	use super::*;

	enum Cmd {
		Echo { value: u32, resp: Reply<u32> },
		Hang { resp: Reply<u32> },
	}

	#[tokio::test]
	async fn call_round_trips_through_actor() {
		let (tx, mut rx) = mpsc::channel::<Cmd>(4);
		tokio::spawn(async move {
			let mut parked = Vec::new();
			while let Some(cmd) = rx.recv().await {
				match cmd {
					Cmd::Echo { value, resp } => {
						let _ = resp.send(Ok(value + 1));
					}
					Cmd::Hang { resp } => parked.push(resp),
				}
			}
		});

		let got = call(&tx, "echo", deadline_in(Duration::from_millis(500)), |resp| Cmd::Echo {
			value: 41,
			resp,
		})
		.await
		.expect("reply");
		assert_eq!(got, 42);

		let err = call(&tx, "echo", deadline_in(Duration::from_millis(50)), |resp| Cmd::Hang { resp })
			.await
			.expect_err("should time out");
		assert_eq!(err, ClientCoreError::DeadlineExceeded);
	}

	#[tokio::test]
	async fn call_reports_closed_actor() {
		let (tx, rx) = mpsc::channel::<Cmd>(1);
		drop(rx);
		let err = call(&tx, "echo", deadline_in(Duration::from_millis(100)), |resp| Cmd::Echo {
			value: 1,
			resp,
		})
		.await
		.expect_err("closed");
		assert_eq!(err, ClientCoreError::ActorClosed("echo"));
	}
}

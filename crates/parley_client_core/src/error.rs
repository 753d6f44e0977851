#![forbid(unsafe_code)]

use parley_platform::ApiError;
use parley_platform::rtm::FrameError;

/// Errors returned by client core requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientCoreError {
	/// Directory miss that the remote side cannot resolve.
	#[error("not found: {0}")]
	NotFound(String),

	/// Remote call failed (`ok: false`, bad status, undecodable body).
	#[error("upstream error: {0}")]
	Upstream(String),

	/// Realtime socket failure.
	#[error("transport error: {0}")]
	Transport(String),

	/// Acknowledgement for an unknown or already resolved send.
	#[error("correlation error: {0}")]
	Correlation(String),

	/// Malformed or unexpected frame.
	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("deadline exceeded")]
	DeadlineExceeded,

	/// The owning task has stopped.
	#[error("{0} is no longer running")]
	ActorClosed(&'static str),

	#[error("not connected")]
	NotConnected,
}

impl From<ApiError> for ClientCoreError {
	fn from(e: ApiError) -> Self {
		ClientCoreError::Upstream(e.to_string())
	}
}

impl From<FrameError> for ClientCoreError {
	fn from(e: FrameError) -> Self {
		ClientCoreError::Protocol(e.to_string())
	}
}

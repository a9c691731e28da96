#![forbid(unsafe_code)]

use thiserror::Error;

/// Contract violations detected by `Router::serve`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RouterError {
	#[error("dispatcher is missing")]
	DispatcherMissing,
	#[error("session storage is missing")]
	StorageMissing,
}

/// Failures delivering a packet through a `Dispatcher`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
	#[error("gateway {gateway} unreachable: {reason}")]
	Unreachable { gateway: String, reason: String },
	#[error("no receivers given")]
	NoReceivers,
	#[error("context is not bound to a dispatcher")]
	Detached,
}

/// Failures reading or writing session state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
	#[error("session not found")]
	SessionNotFound,
	#[error("session storage backend error: {0}")]
	Backend(String),
	#[error("context is not bound to a session storage")]
	Detached,
}

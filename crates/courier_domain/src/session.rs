#![forbid(unsafe_code)]

use core::fmt;

use serde::{Deserialize, Serialize};

/// A logged-in connection as tracked by session storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
	/// Connection id, unique within the gateway that owns it.
	pub channel_id: String,
	/// Service id of the gateway holding the connection.
	pub gate_id: String,
	pub account: String,
	pub device: String,
	pub remote_ip: String,
	pub app: String,
	pub tags: Vec<String>,
}

impl Session {
	pub fn new(channel_id: impl Into<String>, gate_id: impl Into<String>, account: impl Into<String>) -> Self {
		Self {
			channel_id: channel_id.into(),
			gate_id: gate_id.into(),
			account: account.into(),
			..Self::default()
		}
	}

	/// Where packets for this session are delivered.
	pub fn location(&self) -> Location {
		Location {
			channel_id: self.channel_id.clone(),
			gate_id: self.gate_id.clone(),
		}
	}
}

/// Delivery address of one connection: gateway plus channel on that gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
	pub channel_id: String,
	pub gate_id: String,
}

impl Location {
	pub fn new(channel_id: impl Into<String>, gate_id: impl Into<String>) -> Self {
		Self {
			channel_id: channel_id.into(),
			gate_id: gate_id.into(),
		}
	}
}

impl fmt::Display for Location {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}@{}", self.channel_id, self.gate_id)
	}
}

#![forbid(unsafe_code)]

pub mod registration;
pub mod session;
pub mod topology;

pub use registration::{Protocol, ServiceRegistration};
pub use session::{Location, Session};
pub use topology::{Country, Idc, MAX_IDC_WEIGHT, Region, RegionId, Topology, TopologyError};

use thiserror::Error;

/// Well-known service names published to discovery.
pub mod service {
	/// WebSocket gateway fleet.
	pub const WS_GATEWAY: &str = "wgateway";
	/// Raw TCP gateway fleet.
	pub const TCP_GATEWAY: &str = "tgateway";
	/// Chat logic servers behind the gateways.
	pub const CHAT: &str = "chat";
	/// Login servers behind the gateways.
	pub const LOGIN: &str = "login";
}

/// Meta key carrying the public domain a gateway is reachable at.
pub const META_DOMAIN: &str = "domain";

/// Tag key carrying IDC membership (`IDC:<id>`).
pub const TAG_IDC: &str = "IDC";

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
	#[error("empty value")]
	Empty,
	#[error("unknown protocol: {0}")]
	UnknownProtocol(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn session_location_matches_gate_and_channel() {
		let s = Session::new("ch-1", "gw-1", "alice");
		assert_eq!(s.location(), Location::new("ch-1", "gw-1"));
		assert_eq!(s.location().to_string(), "ch-1@gw-1");
	}
}

#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ParseError;

/// Transport a gateway instance accepts connections on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Tcp,
	Ws,
	Wss,
}

impl Protocol {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Protocol::Tcp => "tcp",
			Protocol::Ws => "ws",
			Protocol::Wss => "wss",
		}
	}

	/// Raw stream transports are dialed without a scheme prefix.
	pub const fn is_raw_stream(self) -> bool {
		matches!(self, Protocol::Tcp)
	}
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Protocol {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"tcp" => Ok(Protocol::Tcp),
			"ws" => Ok(Protocol::Ws),
			"wss" => Ok(Protocol::Wss),
			other => Err(ParseError::UnknownProtocol(other.to_string())),
		}
	}
}

/// One running service instance as published to discovery.
///
/// Gateways create this on startup; the lookup service reads it back from
/// naming and uses `tags` for IDC filtering and `meta["domain"]` as the
/// address handed to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
	id: String,
	name: String,
	address: String,
	port: u16,
	protocol: Protocol,
	namespace: String,
	tags: Vec<String>,
	meta: BTreeMap<String, String>,
}

impl ServiceRegistration {
	/// Create a registration with an empty namespace, tags and meta.
	pub fn new(
		id: impl Into<String>,
		name: impl Into<String>,
		protocol: Protocol,
		address: impl Into<String>,
		port: u16,
	) -> Result<Self, ParseError> {
		let id = id.into();
		let name = name.into();
		let address = address.into();
		if id.trim().is_empty() || name.trim().is_empty() || address.trim().is_empty() {
			return Err(ParseError::Empty);
		}
		if port == 0 {
			return Err(ParseError::InvalidFormat("port must be in 1..=65535".into()));
		}

		Ok(Self {
			id,
			name,
			address,
			port,
			protocol,
			namespace: String::new(),
			tags: Vec::new(),
			meta: BTreeMap::new(),
		})
	}

	pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
		self.namespace = namespace.into();
		self
	}

	pub fn with_tags<I, S>(mut self, tags: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.tags.extend(tags.into_iter().map(Into::into));
		self
	}

	pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.meta.insert(key.into(), value.into());
		self
	}

	pub fn service_id(&self) -> &str {
		&self.id
	}

	pub fn service_name(&self) -> &str {
		&self.name
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn public_address(&self) -> &str {
		&self.address
	}

	pub fn public_port(&self) -> u16 {
		self.port
	}

	pub fn protocol(&self) -> Protocol {
		self.protocol
	}

	pub fn tags(&self) -> &[String] {
		&self.tags
	}

	pub fn meta(&self) -> &BTreeMap<String, String> {
		&self.meta
	}

	/// Value of a single meta key, if present.
	pub fn meta_value(&self, key: &str) -> Option<&str> {
		self.meta.get(key).map(String::as_str)
	}

	pub fn has_tag(&self, tag: &str) -> bool {
		self.tags.iter().any(|t| t == tag)
	}

	/// `address:port` for raw stream transports, `protocol://address:port` otherwise.
	pub fn dial_url(&self) -> String {
		if self.protocol.is_raw_stream() {
			format!("{}:{}", self.address, self.port)
		} else {
			format!("{}://{}:{}", self.protocol, self.address, self.port)
		}
	}
}

impl fmt::Display for ServiceRegistration {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"id:{},name:{},address:{},port:{},ns:{},tags:{:?},meta:{:?}",
			self.id, self.name, self.address, self.port, self.namespace, self.tags, self.meta
		)
	}
}

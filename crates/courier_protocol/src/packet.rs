#![forbid(unsafe_code)]

use bytes::Bytes;
use prost::Message;

/// Reply status carried in every response header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Status {
	Success = 0,
	NoDestination = 100,
	InvalidPacketBody = 101,
	InvalidCommand = 103,
	Unauthorized = 105,
	SystemException = 300,
	NotImplemented = 301,
	SessionNotFound = 404,
}

/// Free-form header metadata entry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Meta {
	#[prost(string, tag = "1")]
	pub key: String,
	#[prost(string, tag = "2")]
	pub value: String,
}

/// Logic packet header.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Header {
	/// Command name selecting the handler chain (e.g. `chat.user.talk`).
	#[prost(string, tag = "1")]
	pub command: String,
	/// Sender connection id, assigned by the gateway.
	#[prost(string, tag = "2")]
	pub channel_id: String,
	#[prost(uint32, tag = "3")]
	pub sequence: u32,
	#[prost(enumeration = "Status", tag = "4")]
	pub status: i32,
	/// Destination account or group.
	#[prost(string, tag = "5")]
	pub dest: String,
	#[prost(message, repeated, tag = "6")]
	pub meta: Vec<Meta>,
}

/// Body sent with any non-success status.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorResp {
	#[prost(string, tag = "1")]
	pub message: String,
}

/// A decoded logic packet: header plus still-encoded body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogicPkt {
	pub header: Header,
	pub body: Bytes,
}

impl LogicPkt {
	/// New request packet for `command`.
	pub fn new(command: impl Into<String>) -> Self {
		Self {
			header: Header {
				command: command.into(),
				..Header::default()
			},
			body: Bytes::new(),
		}
	}

	/// Response to `request`: same command, channel and sequence, with `status`.
	pub fn reply_to(request: &Header, status: Status) -> Self {
		Self {
			header: Header {
				command: request.command.clone(),
				channel_id: request.channel_id.clone(),
				sequence: request.sequence,
				status: status as i32,
				..Header::default()
			},
			body: Bytes::new(),
		}
	}

	pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
		self.header.channel_id = channel_id.into();
		self
	}

	pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
		self.header.dest = dest.into();
		self
	}

	pub fn with_sequence(mut self, sequence: u32) -> Self {
		self.header.sequence = sequence;
		self
	}

	pub fn with_status(mut self, status: Status) -> Self {
		self.header.status = status as i32;
		self
	}

	pub fn command(&self) -> &str {
		&self.header.command
	}

	/// Header status, `None` for values this build does not know.
	pub fn status(&self) -> Option<Status> {
		Status::try_from(self.header.status).ok()
	}

	/// Replace the body with the encoding of `body`.
	pub fn write_body<M: Message>(&mut self, body: &M) {
		self.body = Bytes::from(body.encode_to_vec());
	}

	pub fn read_body<M: Message + Default>(&self) -> Result<M, prost::DecodeError> {
		M::decode(self.body.clone())
	}

	pub fn add_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
		self.header.meta.push(Meta {
			key: key.into(),
			value: value.into(),
		});
	}

	/// First meta value stored under `key`.
	pub fn meta(&self, key: &str) -> Option<&str> {
		self.header.meta.iter().find(|m| m.key == key).map(|m| m.value.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reply_keeps_request_identity() {
		let req = LogicPkt::new("chat.user.talk")
			.with_channel("ch-9")
			.with_sequence(42)
			.with_dest("bob");

		let resp = LogicPkt::reply_to(&req.header, Status::NotImplemented);
		assert_eq!(resp.command(), "chat.user.talk");
		assert_eq!(resp.header.channel_id, "ch-9");
		assert_eq!(resp.header.sequence, 42);
		assert_eq!(resp.status(), Some(Status::NotImplemented));
		assert!(resp.header.dest.is_empty());
	}

	#[test]
	fn body_is_carried_encoded() {
		let mut p = LogicPkt::new("sys.error");
		p.write_body(&ErrorResp {
			message: "boom".to_string(),
		});

		let decoded: ErrorResp = p.read_body().expect("decode body");
		assert_eq!(decoded.message, "boom");
	}

	#[test]
	fn unknown_status_value_is_none() {
		let mut p = LogicPkt::new("x");
		p.header.status = 7;
		assert_eq!(p.status(), None);
		assert_eq!(LogicPkt::new("x").status(), Some(Status::Success));
	}

	#[test]
	fn meta_lookup_returns_first_match() {
		let mut p = LogicPkt::new("x");
		p.add_meta("trace", "a");
		p.add_meta("trace", "b");
		assert_eq!(p.meta("trace"), Some("a"));
		assert_eq!(p.meta("missing"), None);
	}
}

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use courier_domain::{Location, Session};
use courier_protocol::{ErrorResp, Header, LogicPkt, Status};
use prost::Message;
use tracing::warn;

use crate::error::{DispatchError, StorageError};
use crate::storage::SessionStorage;

/// Delivers packets to connections held by a gateway.
pub trait Dispatcher: Send + Sync {
	/// Push `packet` to `channels` on `gateway`.
	fn push(&self, gateway: &str, channels: &[String], packet: LogicPkt) -> Result<(), DispatchError>;
}

/// One link of a handler chain.
pub type HandlerFunc = Arc<dyn Fn(&mut Context) + Send + Sync>;

/// Ordered handlers bound to a command (middleware prefix first).
pub type HandlersChain = Arc<[HandlerFunc]>;

/// Wrap a closure as a `HandlerFunc`.
pub fn handler<F>(f: F) -> HandlerFunc
where
	F: Fn(&mut Context) + Send + Sync + 'static,
{
	Arc::new(f)
}

/// Per-dispatch state handed to every handler of a chain.
///
/// Contexts are pooled by the router: `serve` binds one to a packet and its
/// collaborators, runs the chain, then resets it. A context is never shared
/// between two dispatches.
pub struct Context {
	request: LogicPkt,
	handlers: HandlersChain,
	index: usize,
	aborted: bool,
	dispatcher: Option<Arc<dyn Dispatcher>>,
	storage: Option<Arc<dyn SessionStorage>>,
	session: Session,
}

impl Context {
	pub(crate) fn new() -> Self {
		Self {
			request: LogicPkt::default(),
			handlers: HandlersChain::default(),
			index: 0,
			aborted: false,
			dispatcher: None,
			storage: None,
			session: Session::default(),
		}
	}

	pub(crate) fn bind(
		&mut self,
		request: LogicPkt,
		handlers: HandlersChain,
		dispatcher: Arc<dyn Dispatcher>,
		storage: Arc<dyn SessionStorage>,
		session: Session,
	) {
		self.request = request;
		self.handlers = handlers;
		self.dispatcher = Some(dispatcher);
		self.storage = Some(storage);
		self.session = session;
	}

	pub(crate) fn reset(&mut self) {
		self.request = LogicPkt::default();
		self.handlers = HandlersChain::default();
		self.index = 0;
		self.aborted = false;
		self.dispatcher = None;
		self.storage = None;
		self.session = Session::default();
	}

	/// Run the remaining handlers of the chain.
	///
	/// Middleware calls this to wrap the rest of the chain; handlers that
	/// never call it are still followed by the next link unless they `abort`.
	pub fn next(&mut self) {
		while !self.aborted && self.index < self.handlers.len() {
			let handler = Arc::clone(&self.handlers[self.index]);
			self.index += 1;
			handler(self);
		}
	}

	/// Stop the chain after the current handler returns.
	pub fn abort(&mut self) {
		self.aborted = true;
	}

	pub fn is_aborted(&self) -> bool {
		self.aborted
	}

	pub fn header(&self) -> &Header {
		&self.request.header
	}

	pub fn packet(&self) -> &LogicPkt {
		&self.request
	}

	pub fn read_body<M: Message + Default>(&self) -> Result<M, prost::DecodeError> {
		self.request.read_body()
	}

	pub fn session(&self) -> &Session {
		&self.session
	}

	pub fn dispatcher(&self) -> &dyn Dispatcher {
		match self.dispatcher.as_deref() {
			Some(d) => d,
			None => &Detached,
		}
	}

	pub fn storage(&self) -> &dyn SessionStorage {
		match self.storage.as_deref() {
			Some(s) => s,
			None => &Detached,
		}
	}

	/// Reply to the sender with `status` and `body`.
	pub fn resp<M: Message>(&self, status: Status, body: &M) -> Result<(), DispatchError> {
		let mut packet = LogicPkt::reply_to(&self.request.header, status);
		packet.write_body(body);

		self.dispatcher().push(
			&self.session.gate_id,
			std::slice::from_ref(&self.session.channel_id),
			packet,
		)
	}

	/// Reply with `status` and an `ErrorResp` carrying `err`.
	pub fn resp_with_error(&self, status: Status, err: impl fmt::Display) -> Result<(), DispatchError> {
		self.resp(
			status,
			&ErrorResp {
				message: err.to_string(),
			},
		)
	}

	/// Push `body` under the request's command to every receiver, one push per gateway.
	///
	/// All gateways are attempted; the first failure is returned.
	pub fn dispatch<M: Message>(&self, body: &M, receivers: &[Location]) -> Result<(), DispatchError> {
		if receivers.is_empty() {
			return Err(DispatchError::NoReceivers);
		}

		let mut packet = LogicPkt::reply_to(&self.request.header, Status::Success).with_dest(&self.request.header.dest);
		packet.write_body(body);

		let mut by_gateway: BTreeMap<&str, Vec<String>> = BTreeMap::new();
		for loc in receivers {
			by_gateway.entry(&loc.gate_id).or_default().push(loc.channel_id.clone());
		}

		let mut first_err = None;
		for (gateway, channels) in by_gateway {
			if let Err(e) = self.dispatcher().push(gateway, &channels, packet.clone()) {
				warn!(gateway, command = %self.request.header.command, error = %e, "dispatch push failed");
				first_err.get_or_insert(e);
			}
		}

		match first_err {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}
}

/// Stand-in collaborators for a context at rest in the pool.
struct Detached;

impl Dispatcher for Detached {
	fn push(&self, _gateway: &str, _channels: &[String], _packet: LogicPkt) -> Result<(), DispatchError> {
		Err(DispatchError::Detached)
	}
}

impl SessionStorage for Detached {
	fn add(&self, _session: Session) -> Result<(), StorageError> {
		Err(StorageError::Detached)
	}

	fn delete(&self, _account: &str, _channel_id: &str) -> Result<(), StorageError> {
		Err(StorageError::Detached)
	}

	fn get(&self, _channel_id: &str) -> Result<Session, StorageError> {
		Err(StorageError::Detached)
	}

	fn get_location(&self, _account: &str, _device: &str) -> Result<Location, StorageError> {
		Err(StorageError::Detached)
	}

	fn get_locations(&self, _accounts: &[String]) -> Result<Vec<Location>, StorageError> {
		Err(StorageError::Detached)
	}
}

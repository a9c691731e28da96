#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use courier_domain::Session;
use courier_protocol::{ErrorResp, LogicPkt, Status};
use metrics::counter;
use parking_lot::Mutex;
use tracing::debug;

use crate::context::{Context, Dispatcher, HandlerFunc, HandlersChain, handler};
use crate::error::RouterError;
use crate::storage::SessionStorage;

/// Contexts kept for reuse when the router is built with `Router::new`.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Command name -> handler chain.
#[derive(Default)]
pub struct RouteTable {
	nodes: HashMap<String, HandlersChain>,
}

impl RouteTable {
	/// Append `handlers` to the chain of `command`, creating it if needed.
	pub fn add(&mut self, command: &str, handlers: &[HandlerFunc]) {
		let chain = match self.nodes.get(command) {
			Some(existing) => existing.iter().chain(handlers).cloned().collect(),
			None => handlers.iter().cloned().collect(),
		};
		self.nodes.insert(command.to_string(), chain);
	}

	pub fn get(&self, command: &str) -> Option<&HandlersChain> {
		self.nodes.get(command)
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}
}

/// Free-list of reusable dispatch contexts.
struct ContextPool {
	free: Mutex<Vec<Box<Context>>>,
	capacity: usize,
}

impl ContextPool {
	fn new(capacity: usize) -> Self {
		Self {
			free: Mutex::new(Vec::with_capacity(capacity)),
			capacity,
		}
	}

	fn acquire(&self) -> Box<Context> {
		self.free.lock().pop().unwrap_or_else(|| Box::new(Context::new()))
	}

	fn release(&self, mut ctx: Box<Context>) {
		ctx.reset();
		let mut free = self.free.lock();
		if free.len() < self.capacity {
			free.push(ctx);
		}
	}

	fn idle(&self) -> usize {
		self.free.lock().len()
	}
}

/// Dispatches logic packets to handler chains by command name.
///
/// Register routes during startup, then share the router (e.g. behind an
/// `Arc`) with every connection task; `serve` takes `&self` and keeps no
/// per-dispatch state outside its own pooled context.
pub struct Router {
	middlewares: Vec<HandlerFunc>,
	table: RouteTable,
	not_found: HandlersChain,
	pool: ContextPool,
}

impl Default for Router {
	fn default() -> Self {
		Self::new()
	}
}

impl Router {
	pub fn new() -> Self {
		Self::with_pool_capacity(DEFAULT_POOL_CAPACITY)
	}

	pub fn with_pool_capacity(capacity: usize) -> Self {
		Self {
			middlewares: Vec::new(),
			table: RouteTable::default(),
			not_found: Arc::from(vec![handler(handle_not_found)]),
			pool: ContextPool::new(capacity),
		}
	}

	/// Append middleware applied to every command registered afterwards.
	pub fn use_middleware(&mut self, handlers: impl IntoIterator<Item = HandlerFunc>) {
		self.middlewares.extend(handlers);
	}

	/// Register `handlers` for `command`, behind the current middleware.
	///
	/// Registering the same command again appends to its chain (middleware
	/// prefix included again) instead of replacing it.
	pub fn handle(&mut self, command: &str, handlers: impl IntoIterator<Item = HandlerFunc>) {
		let handlers: Vec<HandlerFunc> = handlers.into_iter().collect();
		self.table.add(command, &self.middlewares);
		self.table.add(command, &handlers);
	}

	/// Serve one packet received on `session`.
	///
	/// Both collaborators are required; a missing one is reported before any
	/// handler runs. Unknown commands are answered with `NotImplemented`.
	pub fn serve(
		&self,
		packet: LogicPkt,
		dispatcher: Option<Arc<dyn Dispatcher>>,
		storage: Option<Arc<dyn SessionStorage>>,
		session: Session,
	) -> Result<(), RouterError> {
		let dispatcher = dispatcher.ok_or(RouterError::DispatcherMissing)?;
		let storage = storage.ok_or(RouterError::StorageMissing)?;

		let chain = match self.table.get(packet.command()) {
			Some(chain) => Arc::clone(chain),
			None => {
				debug!(command = %packet.command(), "no handler registered for command");
				Arc::clone(&self.not_found)
			}
		};

		let mut ctx = self.pool.acquire();
		ctx.bind(packet, chain, dispatcher, storage, session);
		ctx.next();
		self.pool.release(ctx);
		Ok(())
	}

	pub fn routes(&self) -> &RouteTable {
		&self.table
	}

	/// Contexts currently parked in the pool.
	pub fn idle_contexts(&self) -> usize {
		self.pool.idle()
	}
}

fn handle_not_found(ctx: &mut Context) {
	counter!("courier_router_not_implemented_total").increment(1);
	let _ = ctx.resp(
		Status::NotImplemented,
		&ErrorResp {
			message: "NotImplemented".to_string(),
		},
	);
}

#[cfg(test)]
mod tests {
	use super::*;

	fn noop() -> HandlerFunc {
		handler(|_ctx| {})
	}

	#[test]
	fn route_table_appends() {
		let mut table = RouteTable::default();
		table.add("x", &[noop()]);
		table.add("x", &[noop(), noop()]);
		table.add("y", &[noop()]);

		assert_eq!(table.get("x").map(|c| c.len()), Some(3));
		assert_eq!(table.get("y").map(|c| c.len()), Some(1));
		assert!(table.get("z").is_none());
		assert_eq!(table.len(), 2);
	}

	#[test]
	fn handle_prefixes_current_middleware_only() {
		let mut router = Router::new();
		router.handle("early", [noop()]);
		router.use_middleware([noop(), noop()]);
		router.handle("late", [noop()]);

		assert_eq!(router.routes().get("early").map(|c| c.len()), Some(1));
		assert_eq!(router.routes().get("late").map(|c| c.len()), Some(3));
	}

	#[test]
	fn pool_never_grows_past_capacity() {
		let pool = ContextPool::new(1);
		let a = pool.acquire();
		let b = pool.acquire();
		pool.release(a);
		pool.release(b);
		assert_eq!(pool.idle(), 1);
	}
}

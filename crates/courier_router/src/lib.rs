#![forbid(unsafe_code)]

//! Command routing for logic packets.
//!
//! A [`Router`] maps `Header::command` to a chain of handlers (middleware
//! prefix plus terminal handlers) and runs the chain against a pooled
//! [`Context`] bound to the packet, the sender's [`Session`], a
//! [`Dispatcher`] for replies and a [`SessionStorage`].
//!
//! [`Session`]: courier_domain::Session

pub mod context;
pub mod error;
pub mod middleware;
pub mod router;
pub mod storage;

pub use context::{Context, Dispatcher, HandlerFunc, HandlersChain, handler};
pub use error::{DispatchError, RouterError, StorageError};
pub use router::{DEFAULT_POOL_CAPACITY, RouteTable, Router};
pub use storage::{MemoryStorage, SessionStorage};

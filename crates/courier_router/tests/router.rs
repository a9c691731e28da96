#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use courier_domain::{Location, Session};
use courier_protocol::{ErrorResp, LogicPkt, Status, command};
use courier_router::middleware::{recover, trace};
use courier_router::{
	Context, DispatchError, Dispatcher, MemoryStorage, Router, RouterError, SessionStorage, handler,
};
use parking_lot::Mutex;

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("COURIER_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

#[derive(Default)]
struct RecordingDispatcher {
	pushed: Mutex<Vec<(String, Vec<String>, LogicPkt)>>,
}

impl RecordingDispatcher {
	fn packets(&self) -> Vec<LogicPkt> {
		self.pushed.lock().iter().map(|(_, _, p)| p.clone()).collect()
	}
}

impl Dispatcher for RecordingDispatcher {
	fn push(&self, gateway: &str, channels: &[String], packet: LogicPkt) -> Result<(), DispatchError> {
		self.pushed.lock().push((gateway.to_string(), channels.to_vec(), packet));
		Ok(())
	}
}

struct Harness {
	dispatcher: Arc<RecordingDispatcher>,
	storage: Arc<MemoryStorage>,
}

impl Harness {
	fn new() -> Self {
		init_test_logging();
		Self {
			dispatcher: Arc::new(RecordingDispatcher::default()),
			storage: Arc::new(MemoryStorage::new()),
		}
	}

	fn serve(&self, router: &Router, packet: LogicPkt, session: Session) -> Result<(), RouterError> {
		router.serve(
			packet,
			Some(self.dispatcher.clone() as Arc<dyn Dispatcher>),
			Some(self.storage.clone() as Arc<dyn SessionStorage>),
			session,
		)
	}
}

fn alice() -> Session {
	Session::new("ch-alice", "gw-1", "alice")
}

fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> courier_router::HandlerFunc {
	let log = Arc::clone(log);
	handler(move |_ctx| log.lock().push(name))
}

#[test]
fn unknown_command_replies_not_implemented() {
	let h = Harness::new();
	let mut router = Router::new();
	router.handle(command::CHAT_USER_TALK, [handler(|_ctx| {})]);

	let packet = LogicPkt::new("chat.future.feature").with_channel("ch-alice").with_sequence(3);
	h.serve(&router, packet, alice()).expect("serve");

	let pushed = h.dispatcher.pushed.lock();
	assert_eq!(pushed.len(), 1);
	let (gateway, channels, reply) = &pushed[0];
	assert_eq!(gateway, "gw-1");
	assert_eq!(channels, &vec!["ch-alice".to_string()]);
	assert_eq!(reply.status(), Some(Status::NotImplemented));
	assert_eq!(reply.command(), "chat.future.feature");
	assert_eq!(reply.header.sequence, 3);
	assert_eq!(reply.read_body::<ErrorResp>().unwrap().message, "NotImplemented");
}

#[test]
fn unknown_command_skips_middleware() {
	let h = Harness::new();
	let log = Arc::new(Mutex::new(Vec::new()));
	let mut router = Router::new();
	router.use_middleware([recorder(&log, "mw")]);
	router.handle("known", [recorder(&log, "h")]);

	h.serve(&router, LogicPkt::new("unknown"), alice()).unwrap();

	assert!(log.lock().is_empty());
	assert_eq!(h.dispatcher.packets()[0].status(), Some(Status::NotImplemented));
}

#[test]
fn missing_collaborators_fail_without_dispatch() {
	let h = Harness::new();
	let calls = Arc::new(AtomicUsize::new(0));
	let mut router = Router::new();
	{
		let calls = Arc::clone(&calls);
		router.handle("x", [handler(move |_ctx| {
			calls.fetch_add(1, Ordering::SeqCst);
		})]);
	}

	let err = router
		.serve(
			LogicPkt::new("x"),
			None,
			Some(h.storage.clone() as Arc<dyn SessionStorage>),
			alice(),
		)
		.unwrap_err();
	assert_eq!(err, RouterError::DispatcherMissing);

	let err = router
		.serve(
			LogicPkt::new("x"),
			Some(h.dispatcher.clone() as Arc<dyn Dispatcher>),
			None,
			alice(),
		)
		.unwrap_err();
	assert_eq!(err, RouterError::StorageMissing);

	let err = router.serve(LogicPkt::new("unknown"), None, None, alice()).unwrap_err();
	assert_eq!(err, RouterError::DispatcherMissing);

	assert_eq!(calls.load(Ordering::SeqCst), 0);
	assert!(h.dispatcher.pushed.lock().is_empty());
}

#[test]
fn handle_twice_appends_in_registration_order() {
	let h = Harness::new();
	let log = Arc::new(Mutex::new(Vec::new()));
	let mut router = Router::new();
	router.handle("X", [recorder(&log, "h1")]);
	router.handle("X", [recorder(&log, "h2")]);

	h.serve(&router, LogicPkt::new("X"), alice()).unwrap();

	assert_eq!(*log.lock(), vec!["h1", "h2"]);
}

#[test]
fn middleware_wraps_handler_before_and_after() {
	let h = Harness::new();
	let log = Arc::new(Mutex::new(Vec::new()));
	let mut router = Router::new();
	{
		let log = Arc::clone(&log);
		router.use_middleware([handler(move |ctx: &mut Context| {
			log.lock().push("before");
			ctx.next();
			log.lock().push("after");
		})]);
	}
	router.handle("X", [recorder(&log, "h")]);

	h.serve(&router, LogicPkt::new("X"), alice()).unwrap();

	assert_eq!(*log.lock(), vec!["before", "h", "after"]);
}

#[test]
fn abort_short_circuits_the_chain() {
	let h = Harness::new();
	let log = Arc::new(Mutex::new(Vec::new()));
	let mut router = Router::new();
	{
		let log = Arc::clone(&log);
		router.use_middleware([handler(move |ctx: &mut Context| {
			log.lock().push("auth");
			if ctx.session().account.is_empty() {
				let _ = ctx.resp_with_error(Status::Unauthorized, "sign in first");
				ctx.abort();
			}
		})]);
	}
	router.handle("X", [recorder(&log, "h")]);

	h.serve(&router, LogicPkt::new("X"), Session::new("ch-anon", "gw-1", "")).unwrap();
	assert_eq!(*log.lock(), vec!["auth"]);
	assert_eq!(h.dispatcher.packets()[0].status(), Some(Status::Unauthorized));

	log.lock().clear();
	h.serve(&router, LogicPkt::new("X"), alice()).unwrap();
	assert_eq!(*log.lock(), vec!["auth", "h"]);
}

#[test]
fn recover_turns_panics_into_system_exception() {
	let h = Harness::new();
	let log = Arc::new(Mutex::new(Vec::new()));
	let mut router = Router::new();
	router.use_middleware([recover(), trace()]);
	router.handle(
		"X",
		[
			handler(|_ctx| panic!("handler exploded")),
			recorder(&log, "after-panic"),
		],
	);

	h.serve(&router, LogicPkt::new("X"), alice()).unwrap();

	assert!(log.lock().is_empty());
	let replies = h.dispatcher.packets();
	assert_eq!(replies.len(), 1);
	assert_eq!(replies[0].status(), Some(Status::SystemException));
}

#[test]
fn handlers_reach_storage_and_dispatch_to_receivers() {
	let h = Harness::new();
	h.storage.add(Session::new("ch-bob", "gw-2", "bob")).unwrap();

	let mut router = Router::new();
	router.handle(
		command::CHAT_USER_TALK,
		[handler(|ctx: &mut Context| {
			let dest = ctx.header().dest.clone();
			match ctx.storage().get_locations(&[dest]) {
				Ok(receivers) => {
					let _ = ctx.dispatch(&ErrorResp::default(), &receivers);
					let _ = ctx.resp(Status::Success, &ErrorResp::default());
				}
				Err(e) => {
					let _ = ctx.resp_with_error(Status::SessionNotFound, e);
				}
			}
		})],
	);

	h.serve(
		&router,
		LogicPkt::new(command::CHAT_USER_TALK).with_dest("bob"),
		alice(),
	)
	.unwrap();
	h.serve(
		&router,
		LogicPkt::new(command::CHAT_USER_TALK).with_dest("carol"),
		alice(),
	)
	.unwrap();

	let pushed = h.dispatcher.pushed.lock();
	assert_eq!(pushed.len(), 3);
	assert_eq!(pushed[0].0, "gw-2");
	assert_eq!(pushed[0].1, vec!["ch-bob".to_string()]);
	assert_eq!(pushed[1].0, "gw-1");
	assert_eq!(pushed[1].2.status(), Some(Status::Success));
	assert_eq!(pushed[2].2.status(), Some(Status::SessionNotFound));
	assert_eq!(
		Location::new("ch-bob", "gw-2"),
		h.storage.get_location("bob", "").unwrap()
	);
}

#[test]
fn concurrent_serves_use_separate_contexts() {
	let h = Harness::new();
	let mut router = Router::with_pool_capacity(4);
	router.handle(
		"echo",
		[handler(|ctx: &mut Context| {
			let seq = ctx.header().sequence;
			let _ = ctx.resp_with_error(Status::Success, seq);
		})],
	);
	let router = Arc::new(router);

	std::thread::scope(|s| {
		for t in 0..8u32 {
			let router = Arc::clone(&router);
			let h = &h;
			s.spawn(move || {
				for i in 0..100u32 {
					let seq = t * 1000 + i;
					h.serve(&router, LogicPkt::new("echo").with_sequence(seq), alice()).unwrap();
				}
			});
		}
	});

	let replies = h.dispatcher.packets();
	assert_eq!(replies.len(), 800);
	for reply in replies {
		let body: ErrorResp = reply.read_body().unwrap();
		assert_eq!(body.message, reply.header.sequence.to_string());
	}
	assert!(router.idle_contexts() <= 4);
}

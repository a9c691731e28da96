#![forbid(unsafe_code)]

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use courier_protocol::Status;
use metrics::histogram;
use tracing::{debug, error};

use crate::context::{Context, HandlerFunc, handler};

/// Turn a panic anywhere later in the chain into a `SystemException` reply.
pub fn recover() -> HandlerFunc {
	handler(|ctx: &mut Context| {
		if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| ctx.next())) {
			ctx.abort();
			error!(
				command = %ctx.header().command,
				channel = %ctx.session().channel_id,
				panic = %panic_message(payload.as_ref()),
				"handler panicked"
			);
			let _ = ctx.resp_with_error(Status::SystemException, "internal error");
		}
	})
}

/// Log and time every command that passes through.
pub fn trace() -> HandlerFunc {
	handler(|ctx: &mut Context| {
		let start = Instant::now();
		ctx.next();
		let elapsed = start.elapsed();

		histogram!("courier_router_command_seconds", "command" => ctx.header().command.clone())
			.record(elapsed.as_secs_f64());
		debug!(
			command = %ctx.header().command,
			account = %ctx.session().account,
			aborted = ctx.is_aborted(),
			elapsed_us = elapsed.as_micros() as u64,
			"command served"
		);
	})
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
	if let Some(s) = payload.downcast_ref::<&'static str>() {
		s
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.as_str()
	} else {
		"non-string panic payload"
	}
}

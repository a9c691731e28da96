#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use courier_util::endpoint::BindEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{DEFAULT_BIND, LookupConfig};
use crate::server::assign::Assigner;
use crate::server::health::HealthState;
use crate::server::http::{AppState, run_http_server};
use crate::server::naming::MemoryNaming;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: courier_lookup [--bind http://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: server.bind from config, else http://127.0.0.1:8100)\n\
\t          Format: http://host:port\n\
\t--config   Config file (default: ~/.courier/lookup.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected http://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn resolve_bind(endpoint: &str) -> SocketAddr {
	let bind = BindEndpoint::parse(endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

const SERVICE_NAME: &str = "courier_lookup";

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| format!("info,{SERVICE_NAME}=debug"));
	let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());

	let tracer = endpoint.as_deref().map(otlp_tracer);
	let (otel_layer, otel_error) = match tracer {
		Some(Ok(tracer)) => (Some(tracing_opentelemetry::layer().with_tracer(tracer)), None),
		Some(Err(e)) => (None, Some(e)),
		None => (None, None),
	};

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.with(otel_layer)
		.init();

	match (endpoint, otel_error) {
		(Some(_), Some(error)) => warn!(%error, "failed to initialize otlp tracing"),
		(Some(endpoint), None) => info!(%endpoint, "otlp tracing enabled"),
		_ => {}
	}
}

/// Batch span exporter to an OTLP collector, installed as the global provider.
fn otlp_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::SdkTracer, String> {
	use opentelemetry::trace::TracerProvider as _;
	use opentelemetry_otlp::WithExportConfig;

	let exporter = opentelemetry_otlp::SpanExporter::builder()
		.with_tonic()
		.with_endpoint(endpoint)
		.build()
		.map_err(|e| e.to_string())?;
	let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
		.with_resource(opentelemetry_sdk::Resource::builder().with_service_name(SERVICE_NAME).build())
		.with_batch_exporter(exporter)
		.build();

	let tracer = provider.tracer(SERVICE_NAME);
	opentelemetry::global::set_tracer_provider(provider);
	Ok(tracer)
}

/// Prometheus scrape endpoint on `bind` (`host:port` or `http://host:port`).
fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	let addr = match metrics_addr(bind) {
		Ok(addr) => addr,
		Err(error) => {
			warn!(%error, %bind, "invalid server.metrics_bind; metrics disabled");
			return;
		}
	};

	if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
		.with_http_listener(addr)
		.install()
	{
		warn!(error = %e, %addr, "failed to start metrics exporter");
		return;
	}

	metrics::describe_counter!("courier_lookup_requests_total", "Gateway lookups by outcome");
	metrics::describe_counter!(
		"courier_lookup_geo_degraded_total",
		"Lookups that fell back to the default location"
	);
	metrics::describe_histogram!(
		"courier_lookup_duration_seconds",
		metrics::Unit::Seconds,
		"Time spent assigning gateways"
	);
	info!(%addr, "metrics exporter listening");
}

/// `host:port` or `http://host:port`, IP literals only.
fn metrics_addr(bind: &str) -> Result<SocketAddr, String> {
	BindEndpoint::parse(bind)?.to_socket_addr_if_ip_literal()
}

fn build_assigner(cfg: &LookupConfig) -> anyhow::Result<Assigner> {
	let geo = cfg.ip_region().context("build geo ranges")?;

	let naming = MemoryNaming::new();
	for registration in cfg.registrations()? {
		info!(gateway = %registration, "static gateway registered");
		naming.register(registration).context("register static gateway")?;
	}

	info!(
		regions = cfg.topology.regions().count(),
		ip_ranges = geo.len(),
		gateways = naming.len(),
		default_location = %cfg.lookup.default_location,
		"topology loaded"
	);

	Ok(Assigner::new(
		cfg.lookup.clone(),
		Arc::new(cfg.topology.clone()),
		Arc::new(geo),
		Arc::new(naming),
	))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let lookup_cfg = crate::config::load_lookup_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded lookup config (toml + env overrides)");

	let bind_addr = resolve_bind(
		args.bind
			.as_deref()
			.or(lookup_cfg.server.bind.as_deref())
			.unwrap_or(DEFAULT_BIND),
	);

	init_metrics(lookup_cfg.server.metrics_bind.as_deref());

	let health = HealthState::new();
	let state = AppState {
		assigner: Arc::new(build_assigner(&lookup_cfg)?),
		health: health.clone(),
		request_timeout: lookup_cfg.server.request_timeout,
	};

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	info!(bind = %bind_addr, "courier_lookup: http endpoint ready");

	health.mark_ready();

	tokio::select! {
		res = run_http_server(listener, state) => res,
		_ = tokio::signal::ctrl_c() => {
			health.mark_not_ready();
			info!("shutdown requested");
			Ok(())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn metrics_bind_accepts_both_forms() {
		let want: SocketAddr = "127.0.0.1:9100".parse().unwrap();
		assert_eq!(metrics_addr("127.0.0.1:9100"), Ok(want));
		assert_eq!(metrics_addr("http://127.0.0.1:9100"), Ok(want));
		assert!(metrics_addr("metrics.internal:9100").is_err());
		assert!(metrics_addr("127.0.0.1").is_err());
	}
}

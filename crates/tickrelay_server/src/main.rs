#![forbid(unsafe_code)]

use std::path::PathBuf;

use tickrelay_server::config::{default_config_path, load_server_config_from_path};
use tickrelay_server::server::health::{HealthState, spawn_health_server};
use tickrelay_server::start_relay;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: tickrelay_server [--port N] [--starting-slots N] [--config path] [port] [starting_slots]\n\
\n\
Options:\n\
\t--port            TCP port to listen on (default: 15000)\n\
\t--starting-slots  Empty slots announced before anyone joins (default: 0)\n\
\t--config          Config file (default: ~/.tickrelay/config.toml)\n\
\t--help            Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct CliArgs {
	port: Option<u16>,
	starting_slots: Option<usize>,
	config: Option<PathBuf>,
}

fn parse_port(v: &str) -> u16 {
	v.trim().parse().unwrap_or_else(|_| {
		eprintln!("Invalid port: {v}");
		usage_and_exit()
	})
}

fn parse_slots(v: &str) -> usize {
	v.trim().parse().unwrap_or_else(|_| {
		eprintln!("Invalid starting slot count: {v}");
		usage_and_exit()
	})
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs::default();
	let mut positional = 0usize;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--port" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.port = Some(parse_port(&v));
			}
			"--starting-slots" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.starting_slots = Some(parse_slots(&v));
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			other if other.starts_with('-') => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
			other => {
				match positional {
					0 => args.port = Some(parse_port(other)),
					1 => args.starting_slots = Some(parse_slots(other)),
					_ => {
						eprintln!("Unexpected argument: {other}");
						usage_and_exit();
					}
				}
				positional += 1;
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tickrelay_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("tickrelay_server");
				global::set_tracer_provider(tracer_provider);

				base.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => default_config_path()?,
	};
	let mut cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(port) = args.port {
		cfg.relay.port = port;
		info!(port, "relay config: port overridden by command line");
	}
	if let Some(slots) = args.starting_slots {
		cfg.relay.starting_slots = slots;
		info!(slots, "relay config: starting_slots overridden by command line");
	}

	init_metrics(cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => match spawn_health_server(addr, health_state.clone()).await {
				Ok(local) => info!(addr = %local, "health server listening"),
				Err(e) => warn!(error = %e, %addr, "failed to bind health server"),
			},
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let relay = start_relay(cfg.relay.clone()).await?;
	health_state.mark_ready(relay.stats());
	info!(addr = %relay.local_addr(), "tickrelay_server ready");

	tokio::signal::ctrl_c().await?;
	info!("shutdown requested");
	health_state.mark_not_ready();
	relay.shutdown().await;

	Ok(())
}

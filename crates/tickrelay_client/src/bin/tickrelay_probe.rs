#![forbid(unsafe_code)]

use bytes::Bytes;
use tickrelay_client::{ClientConfig, DEFAULT_SERVER_ENDPOINT, RelayClient};
use tickrelay_protocol::{ClientMessage, SlotData, next_frame};
use tracing::info;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: tickrelay_probe [--connect host:port] [--ticks N] [--command text]...\n\
\n\
Options:\n\
	--connect   Relay endpoint (default: 127.0.0.1:15000)\n\
	--ticks     Stop after this many ticks (default: run until closed)\n\
	--command   Command attached to every message (repeatable)\n\
	--help      Show this help\n\
\n\
Joins the relay, submits one message per tick for the next frame and\n\
prints a line per received tick.\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tickrelay_client=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct ProbeArgs {
	endpoint: String,
	ticks: Option<u64>,
	commands: Vec<String>,
}

fn parse_args() -> ProbeArgs {
	let mut args = ProbeArgs {
		endpoint: DEFAULT_SERVER_ENDPOINT.to_string(),
		ticks: None,
		commands: Vec::new(),
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.endpoint = v;
			}
			"--ticks" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let n: u64 = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --ticks value: {v}");
					usage_and_exit()
				});
				args.ticks = Some(n);
			}
			"--command" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.commands.push(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let cfg = ClientConfig::from_endpoint(&args.endpoint)?;
	let mut client = RelayClient::connect(cfg).await?;

	let hs = client.recv_handshake().await?;
	info!(slot = hs.slot_index, client_count = hs.client_count, frame = hs.frame_id, "joined relay");

	let mut seen = 0u64;
	loop {
		let tick = client.recv_tick().await?;
		seen += 1;

		let present = tick.slots.iter().filter(|s| matches!(s, SlotData::Present(_))).count();
		let entries: usize = tick
			.slots
			.iter()
			.map(|s| match s {
				SlotData::Present(entries) => entries.len(),
				SlotData::Absent => 0,
			})
			.sum();
		println!(
			"[frame {}] slots={} present={} entries={}",
			tick.frame_id,
			tick.client_count(),
			present,
			entries
		);

		let mut msg = ClientMessage::new(next_frame(tick.frame_id), Bytes::from(format!("probe-{seen}")));
		for cmd in &args.commands {
			msg = msg.with_command(cmd.as_bytes());
		}
		client.send(&msg).await?;

		if args.ticks.is_some_and(|n| seen >= n) {
			break;
		}
	}

	Ok(())
}

#![forbid(unsafe_code)]

use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tickrelay_protocol::{DecodeError, DecodeEvent, MessageDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::relay::RelayEvent;
use crate::server::sync::SyncError;
use crate::server::usage::{UsageExceeded, UsageLimiter};

/// Why a client connection ended.
#[derive(Debug, Error)]
pub enum CloseReason {
	#[error("peer closed the connection")]
	Eof,

	#[error("read failed: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Decode(#[from] DecodeError),

	#[error(transparent)]
	Usage(#[from] UsageExceeded),

	#[error(transparent)]
	Sync(#[from] SyncError),
}

/// Read, decode and bill one connection until it ends, then report why.
///
/// Decoded messages are forwarded to the dispatcher in arrival order. The
/// task is aborted by the dispatcher when it drops the client first.
pub(crate) async fn read_loop(
	conn_id: u64,
	slot: usize,
	mut read: OwnedReadHalf,
	mut usage: UsageLimiter,
	events: mpsc::UnboundedSender<RelayEvent>,
) {
	let reason = match pump(conn_id, &mut read, &mut usage, &events).await {
		Ok(()) => CloseReason::Eof,
		Err(reason) => reason,
	};

	match &reason {
		CloseReason::Eof => debug!(conn_id, slot, "connection closed by peer"),
		CloseReason::Io(e) => debug!(conn_id, slot, error = %e, "connection read failed"),
		CloseReason::Decode(e) => {
			metrics::counter!("tickrelay_decode_errors_total").increment(1);
			warn!(conn_id, slot, error = %e, "closing client for malformed data");
		}
		CloseReason::Usage(e) => {
			metrics::counter!("tickrelay_usage_kicks_total").increment(1);
			warn!(conn_id, slot, remaining = e.remaining, "closing client for exceeding usage budget");
		}
		CloseReason::Sync(_) => {}
	}

	let _ = events.send(RelayEvent::Closed { conn_id, reason });
}

async fn pump(
	conn_id: u64,
	read: &mut OwnedReadHalf,
	usage: &mut UsageLimiter,
	events: &mpsc::UnboundedSender<RelayEvent>,
) -> Result<(), CloseReason> {
	let mut decoder = MessageDecoder::new();
	let mut tmp = [0u8; 8192];

	loop {
		let n = read.read(&mut tmp).await?;
		if n == 0 {
			return Ok(());
		}
		metrics::counter!("tickrelay_bytes_in_total").increment(n as u64);

		usage.on_read(n, Instant::now())?;
		decoder.feed(&tmp[..n]);

		while let Some(event) = decoder.poll()? {
			match event {
				DecodeEvent::ProcessingFee => usage.on_processing_fee()?,
				DecodeEvent::Message(msg) => {
					if events.send(RelayEvent::Message { conn_id, msg }).is_err() {
						return Ok(());
					}
				}
			}
		}
	}
}

/// Write queued packets in order until the dispatcher drops the sender.
pub(crate) async fn write_loop(conn_id: u64, mut write: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Bytes>) {
	while let Some(bytes) = outbound.recv().await {
		if let Err(e) = write.write_all(&bytes).await {
			debug!(conn_id, error = %e, "connection write failed");
			return;
		}
		metrics::counter!("tickrelay_bytes_out_total").increment(bytes.len() as u64);
	}

	let _ = write.shutdown().await;
}

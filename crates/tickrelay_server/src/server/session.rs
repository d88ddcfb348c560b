#![forbid(unsafe_code)]

use bytes::Bytes;
use tickrelay_protocol::{ClientMessage, Handshake, SlotData, TickPacket, next_frame};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::server::admission::AdmissionError;
use crate::server::sync::{ClientQueue, SyncError, Submitted};

/// A connected client bound to a slot.
#[derive(Debug)]
pub struct ClientSlot {
	pub conn_id: u64,
	pub queue: ClientQueue,
	/// Consecutive ticks in which this client contributed nothing.
	pub missed_ticks: u32,
	pub handshake_sent: bool,
	outbound: mpsc::UnboundedSender<Bytes>,
	reader: Option<AbortHandle>,
}

impl ClientSlot {
	pub fn new(conn_id: u64, outbound: mpsc::UnboundedSender<Bytes>) -> Self {
		Self {
			conn_id,
			queue: ClientQueue::new(),
			missed_ticks: 0,
			handshake_sent: false,
			outbound,
			reader: None,
		}
	}

	pub fn attach_reader(&mut self, reader: AbortHandle) {
		self.reader = Some(reader);
	}

	fn send(&self, bytes: Bytes) {
		// A closed writer means the reader is about to report the disconnect.
		let _ = self.outbound.send(bytes);
	}

	/// Stop reading and let the writer drain whatever was already queued.
	fn close(self) {
		if let Some(reader) = self.reader {
			reader.abort();
		}
	}
}

/// A client dropped by [`Session::tick`] for contributing nothing for too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evicted {
	pub conn_id: u64,
	pub slot: usize,
	pub missed_ticks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
	/// Frame id written into the broadcast packet.
	pub frame: u32,
	pub client_count: usize,
	pub packet_len: usize,
	/// Clients that received the packet.
	pub delivered: usize,
	pub evicted: Vec<Evicted>,
}

/// One play session: the slot table plus the shared frame counter.
///
/// Slots keep their index for the lifetime of the session. A departed
/// client leaves an empty slot behind, which the next arrival reuses.
#[derive(Debug)]
pub struct Session {
	frame: u32,
	slots: Vec<Option<ClientSlot>>,
}

impl Session {
	/// Start at frame 0 with `starting_slots` empty slots already announced.
	pub fn new(starting_slots: usize) -> Self {
		Self {
			frame: 0,
			slots: (0..starting_slots).map(|_| None).collect(),
		}
	}

	pub fn frame(&self) -> u32 {
		self.frame
	}

	pub fn slot_count(&self) -> usize {
		self.slots.len()
	}

	pub fn occupied(&self) -> usize {
		self.slots.iter().filter(|s| s.is_some()).count()
	}

	pub fn slot_of(&self, conn_id: u64) -> Option<usize> {
		self.slots
			.iter()
			.position(|s| s.as_ref().is_some_and(|c| c.conn_id == conn_id))
	}

	pub fn client_mut(&mut self, slot: usize) -> Option<&mut ClientSlot> {
		self.slots.get_mut(slot).and_then(Option::as_mut)
	}

	/// Place a client in the lowest free slot, growing the table if needed.
	pub fn insert(&mut self, client: ClientSlot, max_clients: usize) -> Result<usize, AdmissionError> {
		if let Some(ix) = self.slots.iter().position(Option::is_none) {
			self.slots[ix] = Some(client);
			return Ok(ix);
		}
		if self.slots.len() >= max_clients {
			return Err(AdmissionError::ServerFull { max: max_clients });
		}

		self.slots.push(Some(client));
		Ok(self.slots.len() - 1)
	}

	/// Free the slot held by `conn_id` and close its connection.
	pub fn remove(&mut self, conn_id: u64) -> Option<usize> {
		let ix = self.slot_of(conn_id)?;
		if let Some(client) = self.slots[ix].take() {
			client.close();
		}
		Some(ix)
	}

	/// Queue a message from `conn_id` against the current frame.
	///
	/// Returns `Ok(None)` when the connection no longer holds a slot.
	pub fn submit(&mut self, conn_id: u64, msg: ClientMessage) -> Result<Option<(usize, Submitted)>, SyncError> {
		let current = self.frame;
		let Some(ix) = self.slot_of(conn_id) else {
			return Ok(None);
		};
		let Some(client) = self.client_mut(ix) else {
			return Ok(None);
		};

		client.queue.submit(msg, current).map(|s| Some((ix, s)))
	}

	/// Broadcast one tick.
	///
	/// Every occupied slot's queue is drained into a single packet stamped
	/// with the current frame, which then advances. Clients that have now
	/// gone `timeout_ticks` ticks without sending anything are closed and
	/// their slots freed before delivery.
	pub fn tick(&mut self, timeout_ticks: u32) -> TickOutcome {
		let frame = self.frame;
		self.frame = next_frame(frame);

		let client_count = self.slots.len();
		let mut slots = Vec::with_capacity(client_count);
		let mut evicted = Vec::new();

		for (ix, slot) in self.slots.iter_mut().enumerate() {
			let Some(client) = slot else {
				slots.push(SlotData::Absent);
				continue;
			};

			let entries = client.queue.drain();
			if entries.is_empty() {
				client.missed_ticks += 1;
				if client.missed_ticks >= timeout_ticks {
					evicted.push(Evicted {
						conn_id: client.conn_id,
						slot: ix,
						missed_ticks: client.missed_ticks,
					});
				}
			} else {
				client.missed_ticks = 0;
			}
			slots.push(SlotData::Present(entries));
		}

		for ev in &evicted {
			if let Some(client) = self.slots[ev.slot].take() {
				client.close();
			}
		}

		let packet = TickPacket { frame_id: frame, slots }.encode();
		let mut delivered = 0;

		for (ix, slot) in self.slots.iter_mut().enumerate() {
			let Some(client) = slot else {
				continue;
			};

			if !client.handshake_sent {
				let handshake = Handshake {
					slot_index: ix as u8,
					client_count: client_count as u8,
					frame_id: frame,
				};
				client.send(handshake.encode());
				client.handshake_sent = true;
			}

			client.send(packet.clone());
			client.queue.rotate();
			delivered += 1;
		}

		TickOutcome {
			frame,
			client_count,
			packet_len: packet.len(),
			delivered,
			evicted,
		}
	}

	/// Close every remaining client.
	pub fn close_all(&mut self) {
		for client in self.slots.iter_mut().filter_map(Option::take) {
			client.close();
		}
	}
}

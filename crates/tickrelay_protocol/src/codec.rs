#![forbid(unsafe_code)]

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
	ABSENT_SLOT_MARKER, COMMAND_PREFIX_LEN, FRAME_ID_MAX, HANDSHAKE_LEN, MAGIC_FIRST_BYTE, MAX_CMD_COUNT,
	MESSAGE_HEADER_LEN, OFFSET_RING_LEN,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
	#[error("handshake must start with {expected:#04x}, got {got:#04x}")]
	BadMagic {
		expected: u8,
		got: u8,
	},

	#[error("frame id {frame_id} out of range")]
	FrameIdOutOfRange {
		frame_id: u32,
	},

	#[error("payload too large: len={len} max=255")]
	PayloadTooLarge {
		len: usize,
	},

	#[error("too many commands: count={count} max={max}")]
	TooManyCommands {
		count: usize,
		max: usize,
	},

	#[error("too many entries for one slot: count={count} max={max}")]
	TooManyEntries {
		count: usize,
		max: usize,
	},
}

/// One message as submitted by a client.
///
/// `commands` hold each command blob with its 4-byte length prefix still
/// attached; this is the exact form in which they are relayed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientMessage {
	pub frame_id: u32,
	pub payload: Bytes,
	pub commands: Vec<Bytes>,
}

impl ClientMessage {
	pub fn new(frame_id: u32, payload: impl Into<Bytes>) -> Self {
		Self {
			frame_id,
			payload: payload.into(),
			commands: Vec::new(),
		}
	}

	/// Attach a command body, adding its length prefix.
	pub fn with_command(mut self, body: &[u8]) -> Self {
		self.commands.push(prefixed_command(body));
		self
	}

	/// Command bodies without their length prefixes.
	pub fn command_bodies(&self) -> impl Iterator<Item = &[u8]> {
		self.commands.iter().map(|c| &c[COMMAND_PREFIX_LEN.min(c.len())..])
	}

	/// Encode into the inbound wire layout.
	pub fn encode(&self) -> Result<Bytes, ProtocolError> {
		if self.frame_id >= FRAME_ID_MAX {
			return Err(ProtocolError::FrameIdOutOfRange { frame_id: self.frame_id });
		}
		if self.payload.len() > u8::MAX as usize {
			return Err(ProtocolError::PayloadTooLarge { len: self.payload.len() });
		}
		if self.commands.len() > u8::MAX as usize {
			return Err(ProtocolError::TooManyCommands {
				count: self.commands.len(),
				max: u8::MAX as usize,
			});
		}

		let cmd_len: usize = self.commands.iter().map(Bytes::len).sum();
		let mut out = BytesMut::with_capacity(MESSAGE_HEADER_LEN + self.payload.len() + 1 + cmd_len);
		out.put_u8(self.payload.len() as u8);
		out.put_u32(self.frame_id);
		out.extend_from_slice(&self.payload);
		out.put_u8(self.commands.len() as u8);
		for cmd in &self.commands {
			out.extend_from_slice(cmd);
		}
		Ok(out.freeze())
	}
}

/// Build a length-prefixed command blob.
pub fn prefixed_command(body: &[u8]) -> Bytes {
	let mut out = BytesMut::with_capacity(COMMAND_PREFIX_LEN + body.len());
	out.put_u32(body.len() as u32);
	out.extend_from_slice(body);
	out.freeze()
}

/// Client data queued for one specific tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEntry {
	/// Tick the server scheduled this entry for (after clamping).
	pub target_frame: u32,
	pub payload: Bytes,
	/// Length-prefixed command blobs.
	pub commands: Vec<Bytes>,
}

impl FrameEntry {
	pub fn encoded_len(&self) -> usize {
		MESSAGE_HEADER_LEN + self.payload.len() + 1 + self.commands.iter().map(Bytes::len).sum::<usize>()
	}

	pub fn encode_into(&self, out: &mut BytesMut) {
		out.put_u8(self.payload.len() as u8);
		out.put_u32(self.target_frame);
		out.extend_from_slice(&self.payload);
		out.put_u8(self.commands.len() as u8);
		for cmd in &self.commands {
			out.extend_from_slice(cmd);
		}
	}
}

/// Per-slot section of a tick packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotData {
	/// No client occupies the slot.
	Absent,
	/// A client occupies the slot; it may have queued nothing this tick.
	Present(Vec<FrameEntry>),
}

/// The consolidated packet broadcast once per tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickPacket {
	pub frame_id: u32,
	pub slots: Vec<SlotData>,
}

impl TickPacket {
	/// Slot count as announced on the wire.
	pub fn client_count(&self) -> usize {
		self.slots.len()
	}

	pub fn encoded_len(&self) -> usize {
		5 + self
			.slots
			.iter()
			.map(|slot| match slot {
				SlotData::Absent => 1,
				SlotData::Present(entries) => 1 + entries.iter().map(FrameEntry::encoded_len).sum::<usize>(),
			})
			.sum::<usize>()
	}

	pub fn encode(&self) -> Bytes {
		let mut out = BytesMut::with_capacity(self.encoded_len());
		out.put_u32(self.frame_id);
		out.put_u8(self.slots.len() as u8);
		for slot in &self.slots {
			match slot {
				SlotData::Absent => out.put_u8(ABSENT_SLOT_MARKER),
				SlotData::Present(entries) => {
					out.put_u8(entries.len() as u8);
					for entry in entries {
						entry.encode_into(&mut out);
					}
				}
			}
		}
		out.freeze()
	}

	/// Decode one packet from the front of `buf`.
	///
	/// Returns `Ok(None)` and leaves `buf` untouched while the packet is
	/// still incomplete.
	pub fn try_decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
		let Some(len) = measure_tick(&buf[..])? else {
			return Ok(None);
		};

		let raw = buf.split_to(len).freeze();
		Ok(Some(build_tick(&raw)))
	}
}

/// One-time header sent ahead of a client's first tick packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
	pub slot_index: u8,
	pub client_count: u8,
	pub frame_id: u32,
}

impl Handshake {
	pub fn encode(&self) -> Bytes {
		let mut out = BytesMut::with_capacity(HANDSHAKE_LEN);
		out.put_u8(MAGIC_FIRST_BYTE);
		out.put_u8(self.slot_index);
		out.put_u8(self.client_count);
		out.put_u32(self.frame_id);
		out.freeze()
	}

	pub fn try_decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
		if let Some(&first) = buf.first()
			&& first != MAGIC_FIRST_BYTE
		{
			return Err(ProtocolError::BadMagic {
				expected: MAGIC_FIRST_BYTE,
				got: first,
			});
		}
		if buf.len() < HANDSHAKE_LEN {
			return Ok(None);
		}

		let raw = buf.split_to(HANDSHAKE_LEN);
		Ok(Some(Self {
			slot_index: raw[1],
			client_count: raw[2],
			frame_id: u32::from_be_bytes([raw[3], raw[4], raw[5], raw[6]]),
		}))
	}
}

struct Cursor<'a> {
	src: &'a [u8],
	pos: usize,
}

impl<'a> Cursor<'a> {
	fn new(src: &'a [u8]) -> Self {
		Self { src, pos: 0 }
	}

	fn u8(&mut self) -> Option<u8> {
		let b = *self.src.get(self.pos)?;
		self.pos += 1;
		Some(b)
	}

	fn u32(&mut self) -> Option<u32> {
		let raw = self.take(4)?;
		Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
	}

	fn take(&mut self, n: usize) -> Option<&'a [u8]> {
		let end = self.pos.checked_add(n)?;
		let raw = self.src.get(self.pos..end)?;
		self.pos = end;
		Some(raw)
	}
}

/// Validate a tick packet and report its length without consuming anything.
fn measure_tick(src: &[u8]) -> Result<Option<usize>, ProtocolError> {
	let mut cur = Cursor::new(src);

	let Some(frame_id) = cur.u32() else {
		return Ok(None);
	};
	if frame_id >= FRAME_ID_MAX {
		return Err(ProtocolError::FrameIdOutOfRange { frame_id });
	}
	let Some(slot_count) = cur.u8() else {
		return Ok(None);
	};

	for _ in 0..slot_count {
		let Some(entry_count) = cur.u8() else {
			return Ok(None);
		};
		if entry_count == ABSENT_SLOT_MARKER {
			continue;
		}
		if usize::from(entry_count) > OFFSET_RING_LEN {
			return Err(ProtocolError::TooManyEntries {
				count: entry_count.into(),
				max: OFFSET_RING_LEN,
			});
		}

		for _ in 0..entry_count {
			let Some(payload_len) = cur.u8() else {
				return Ok(None);
			};
			if cur.take(4 + usize::from(payload_len)).is_none() {
				return Ok(None);
			}
			let Some(cmd_count) = cur.u8() else {
				return Ok(None);
			};
			if usize::from(cmd_count) > MAX_CMD_COUNT {
				return Err(ProtocolError::TooManyCommands {
					count: cmd_count.into(),
					max: MAX_CMD_COUNT,
				});
			}
			for _ in 0..cmd_count {
				let Some(len) = cur.u32() else {
					return Ok(None);
				};
				if cur.take(len as usize).is_none() {
					return Ok(None);
				}
			}
		}
	}

	Ok(Some(cur.pos))
}

/// Build a packet from bytes already validated by `measure_tick`.
fn build_tick(raw: &Bytes) -> TickPacket {
	let mut pos = 0usize;
	let read_u32 = |pos: usize| u32::from_be_bytes([raw[pos], raw[pos + 1], raw[pos + 2], raw[pos + 3]]);

	let frame_id = read_u32(pos);
	let slot_count = raw[pos + 4];
	pos += 5;

	let mut slots = Vec::with_capacity(slot_count.into());
	for _ in 0..slot_count {
		let entry_count = raw[pos];
		pos += 1;
		if entry_count == ABSENT_SLOT_MARKER {
			slots.push(SlotData::Absent);
			continue;
		}

		let mut entries = Vec::with_capacity(entry_count.into());
		for _ in 0..entry_count {
			let payload_len = usize::from(raw[pos]);
			let target_frame = read_u32(pos + 1);
			pos += MESSAGE_HEADER_LEN;
			let payload = raw.slice(pos..pos + payload_len);
			pos += payload_len;

			let cmd_count = raw[pos];
			pos += 1;
			let mut commands = Vec::with_capacity(cmd_count.into());
			for _ in 0..cmd_count {
				let len = read_u32(pos) as usize;
				commands.push(raw.slice(pos..pos + COMMAND_PREFIX_LEN + len));
				pos += COMMAND_PREFIX_LEN + len;
			}

			entries.push(FrameEntry {
				target_frame,
				payload,
				commands,
			});
		}
		slots.push(SlotData::Present(entries));
	}

	TickPacket { frame_id, slots }
}

#![forbid(unsafe_code)]

pub mod codec;
pub mod decoder;
pub mod frame;

pub use codec::{ClientMessage, FrameEntry, Handshake, ProtocolError, SlotData, TickPacket, prefixed_command};
pub use decoder::{DecodeError, DecodeEvent, MessageDecoder};
pub use frame::{frame_add, frame_delta, next_frame};

/// Frame ids live in `[0, FRAME_ID_MAX)` and wrap.
pub const FRAME_ID_MAX: u32 = 1 << 29;

/// Furthest a client may schedule data ahead of the current tick.
/// Must match the client's own limit.
pub const MAX_AHEAD: usize = 15;

/// Number of relative-tick positions tracked per client (`0..=MAX_AHEAD`).
pub const OFFSET_RING_LEN: usize = MAX_AHEAD + 1;

/// Most commands a single frame entry may carry.
pub const MAX_CMD_COUNT: usize = 16;

/// First byte of the one-time handshake header.
pub const MAGIC_FIRST_BYTE: u8 = 0x90;

/// Per-slot marker for "no client in this slot" (-1 as a signed byte).
pub const ABSENT_SLOT_MARKER: u8 = 0xFF;

/// `[magic][slot][client count][frame id]`.
pub const HANDSHAKE_LEN: usize = 7;

/// Size byte plus frame id that precede every payload.
pub const MESSAGE_HEADER_LEN: usize = 5;

/// Length prefix in front of every command blob.
pub const COMMAND_PREFIX_LEN: usize = 4;

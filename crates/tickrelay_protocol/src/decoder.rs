#![forbid(unsafe_code)]

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::codec::ClientMessage;
use crate::{COMMAND_PREFIX_LEN, FRAME_ID_MAX, MESSAGE_HEADER_LEN};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
	#[error("bad frame number {frame_id}, invalid network communication")]
	BadFrameId {
		frame_id: u32,
	},
}

/// Output of [`MessageDecoder::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
	/// A fixed-cost processing step started (message body or command header).
	/// The caller bills it against the connection's usage budget.
	ProcessingFee,

	/// A full message, including all of its commands, has been read.
	Message(ClientMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	/// Waiting for the payload size byte.
	Size,
	/// Waiting for size byte + frame id + payload.
	Body { payload_len: usize },
	/// Waiting for the command count byte.
	CmdCount,
	/// Waiting for the next command's length prefix.
	CmdSize,
	/// Waiting for a command's length prefix plus its body.
	Cmd { len: usize },
}

impl Phase {
	fn required(self) -> usize {
		match self {
			Phase::Size | Phase::CmdCount => 1,
			Phase::Body { payload_len } => payload_len + MESSAGE_HEADER_LEN,
			Phase::CmdSize => COMMAND_PREFIX_LEN,
			Phase::Cmd { len } => len.saturating_add(COMMAND_PREFIX_LEN),
		}
	}
}

/// Incremental decoder for the inbound message stream of one connection.
///
/// Bytes arrive in arbitrary chunks via [`feed`](Self::feed). Each
/// [`poll`](Self::poll) runs as many phases as the buffered bytes allow and
/// stops at the first event, or returns `Ok(None)` once it needs more input.
/// Phase and partially assembled message survive between calls.
#[derive(Debug)]
pub struct MessageDecoder {
	buf: BytesMut,
	phase: Phase,
	frame_id: u32,
	payload: Bytes,
	commands: Vec<Bytes>,
	cmds_remaining: u8,
}

impl Default for MessageDecoder {
	fn default() -> Self {
		Self::new()
	}
}

impl MessageDecoder {
	pub fn new() -> Self {
		Self {
			buf: BytesMut::with_capacity(1024),
			phase: Phase::Size,
			frame_id: 0,
			payload: Bytes::new(),
			commands: Vec::new(),
			cmds_remaining: 0,
		}
	}

	/// Append received bytes.
	pub fn feed(&mut self, data: &[u8]) {
		self.buf.extend_from_slice(data);
	}

	/// Bytes received but not yet consumed by a phase.
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	/// True when no message is partially decoded.
	pub fn is_idle(&self) -> bool {
		self.phase == Phase::Size && self.buf.is_empty()
	}

	pub fn poll(&mut self) -> Result<Option<DecodeEvent>, DecodeError> {
		loop {
			if self.buf.len() < self.phase.required() {
				return Ok(None);
			}

			match self.phase {
				Phase::Size => {
					self.phase = Phase::Body {
						payload_len: usize::from(self.buf[0]),
					};
				}
				Phase::Body { payload_len } => {
					let mut body = self.buf.split_to(payload_len + MESSAGE_HEADER_LEN);
					body.advance(1);
					let frame_id = body.get_u32();
					if frame_id >= FRAME_ID_MAX {
						return Err(DecodeError::BadFrameId { frame_id });
					}

					self.frame_id = frame_id;
					self.payload = body.freeze();
					self.phase = Phase::CmdCount;
					return Ok(Some(DecodeEvent::ProcessingFee));
				}
				Phase::CmdCount => {
					self.cmds_remaining = self.buf.get_u8();
					if let Some(msg) = self.after_command() {
						return Ok(Some(DecodeEvent::Message(msg)));
					}
				}
				Phase::CmdSize => {
					let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
					self.phase = Phase::Cmd { len: len as usize };
					return Ok(Some(DecodeEvent::ProcessingFee));
				}
				Phase::Cmd { len } => {
					// The length prefix stays attached; blobs are forwarded verbatim.
					let blob = self.buf.split_to(len + COMMAND_PREFIX_LEN).freeze();
					self.commands.push(blob);
					self.cmds_remaining -= 1;
					if let Some(msg) = self.after_command() {
						return Ok(Some(DecodeEvent::Message(msg)));
					}
				}
			}
		}
	}

	/// Pick the phase that follows a command count or a command body,
	/// completing the message when no commands remain.
	fn after_command(&mut self) -> Option<ClientMessage> {
		if self.cmds_remaining > 0 {
			self.phase = Phase::CmdSize;
			return None;
		}

		self.phase = Phase::Size;
		Some(ClientMessage {
			frame_id: self.frame_id,
			payload: std::mem::take(&mut self.payload),
			commands: std::mem::take(&mut self.commands),
		})
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	fn wire(frame_id: u32, payload: &[u8], commands: &[&[u8]]) -> Vec<u8> {
		let mut out = vec![payload.len() as u8];
		out.extend_from_slice(&frame_id.to_be_bytes());
		out.extend_from_slice(payload);
		out.push(commands.len() as u8);
		for cmd in commands {
			out.extend_from_slice(&(cmd.len() as u32).to_be_bytes());
			out.extend_from_slice(cmd);
		}
		out
	}

	fn drain(decoder: &mut MessageDecoder) -> (usize, Vec<ClientMessage>) {
		let mut fees = 0;
		let mut messages = Vec::new();
		while let Some(event) = decoder.poll().expect("decode") {
			match event {
				DecodeEvent::ProcessingFee => fees += 1,
				DecodeEvent::Message(msg) => messages.push(msg),
			}
		}
		(fees, messages)
	}

	#[test]
	fn decodes_message_without_commands() {
		let mut decoder = MessageDecoder::new();
		decoder.feed(&wire(7, b"abc", &[]));

		assert_eq!(decoder.poll().expect("ok"), Some(DecodeEvent::ProcessingFee));
		match decoder.poll().expect("ok") {
			Some(DecodeEvent::Message(msg)) => {
				assert_eq!(msg.frame_id, 7);
				assert_eq!(&msg.payload[..], b"abc");
				assert!(msg.commands.is_empty());
			}
			other => panic!("expected message, got {other:?}"),
		}
		assert_eq!(decoder.poll().expect("ok"), None);
		assert!(decoder.is_idle());
	}

	#[test]
	fn commands_keep_their_length_prefix_and_each_costs_a_fee() {
		let mut decoder = MessageDecoder::new();
		decoder.feed(&wire(1, b"", &[b"hi", b"there"]));

		let (fees, messages) = drain(&mut decoder);
		assert_eq!(fees, 3);
		assert_eq!(messages.len(), 1);

		let cmds = &messages[0].commands;
		assert_eq!(&cmds[0][..], &[0, 0, 0, 2, b'h', b'i']);
		assert_eq!(&cmds[1][4..], b"there");
	}

	#[test]
	fn suspends_mid_message_and_resumes() {
		let bytes = wire(42, b"payload", &[b"cmd"]);
		let mut decoder = MessageDecoder::new();

		decoder.feed(&bytes[..3]);
		assert_eq!(decoder.poll().expect("ok"), None);
		assert_eq!(decoder.buffered(), 3);

		decoder.feed(&bytes[3..13]);
		assert_eq!(decoder.poll().expect("ok"), Some(DecodeEvent::ProcessingFee));
		assert_eq!(decoder.poll().expect("ok"), None);

		decoder.feed(&bytes[13..]);
		let (fees, messages) = drain(&mut decoder);
		assert_eq!(fees, 1);
		assert_eq!(messages[0].frame_id, 42);
		assert_eq!(messages[0].command_bodies().collect::<Vec<_>>(), vec![&b"cmd"[..]]);
	}

	#[test]
	fn rejects_frame_id_out_of_range() {
		let mut decoder = MessageDecoder::new();
		decoder.feed(&wire(FRAME_ID_MAX, b"", &[]));

		assert_eq!(
			decoder.poll(),
			Err(DecodeError::BadFrameId { frame_id: FRAME_ID_MAX })
		);
	}

	#[test]
	fn back_to_back_messages_in_one_chunk() {
		let mut bytes = wire(1, b"a", &[]);
		bytes.extend(wire(2, b"b", &[b"x"]));
		bytes.extend(wire(3, b"c", &[]));

		let mut decoder = MessageDecoder::new();
		decoder.feed(&bytes);
		let (fees, messages) = drain(&mut decoder);

		assert_eq!(fees, 4);
		assert_eq!(messages.iter().map(|m| m.frame_id).collect::<Vec<_>>(), vec![1, 2, 3]);
	}

	proptest! {
		#[test]
		fn chunking_does_not_change_result(
			payload in proptest::collection::vec(any::<u8>(), 0..64),
			cmds in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..16), 0..5),
			frame_id in 0..FRAME_ID_MAX,
			split in 1usize..16,
		) {
			let cmd_refs: Vec<&[u8]> = cmds.iter().map(|c| c.as_slice()).collect();
			let bytes = wire(frame_id, &payload, &cmd_refs);

			let mut decoder = MessageDecoder::new();
			let mut messages = Vec::new();
			for chunk in bytes.chunks(split) {
				decoder.feed(chunk);
				messages.extend(drain(&mut decoder).1);
			}

			prop_assert_eq!(messages.len(), 1);
			prop_assert_eq!(messages[0].frame_id, frame_id);
			prop_assert_eq!(&messages[0].payload[..], &payload[..]);
			let bodies: Vec<&[u8]> = messages[0].command_bodies().collect();
			prop_assert_eq!(bodies, cmd_refs);
			prop_assert!(decoder.is_idle());
		}
	}
}

#![forbid(unsafe_code)]

use std::collections::VecDeque;

use thiserror::Error;
use tickrelay_protocol::{ClientMessage, FrameEntry, MAX_AHEAD, MAX_CMD_COUNT, OFFSET_RING_LEN, frame_add, frame_delta};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
	#[error("too many commands queued for frame {target_frame}: total={total} max={max}")]
	CommandFlood {
		target_frame: u32,
		total: usize,
		max: usize,
	},

	#[error("frame {target_frame} was already broadcast")]
	StaleMerge {
		target_frame: u32,
	},
}

/// How a submission's requested frame compared to the live tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
	OnTime,
	/// Requested a tick already broadcast; moved up to the current one.
	Late { by: u32 },
	/// Requested beyond the look-ahead window; pulled back to its edge.
	Early { by: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
	/// Offset from the current tick after clamping, `0..=MAX_AHEAD`.
	pub delta: usize,
	pub target_frame: u32,
	pub merged: bool,
	pub timing: Timing,
}

/// Which of the next `OFFSET_RING_LEN` ticks already hold an entry.
///
/// Position `(base + d) % OFFSET_RING_LEN` stands for "current tick + d".
#[derive(Debug, Clone, Default)]
pub struct OffsetRing {
	used: [bool; OFFSET_RING_LEN],
	base: usize,
}

impl OffsetRing {
	fn index(&self, delta: usize) -> usize {
		(self.base + delta) % OFFSET_RING_LEN
	}

	pub fn is_used(&self, delta: usize) -> bool {
		self.used[self.index(delta)]
	}

	fn mark(&mut self, delta: usize) {
		let ix = self.index(delta);
		self.used[ix] = true;
	}

	/// Advance by one tick, freeing the position of the tick just broadcast.
	pub fn rotate(&mut self) {
		self.used[self.base] = false;
		self.base = (self.base + 1) % OFFSET_RING_LEN;
	}

	pub fn used_count(&self) -> usize {
		self.used.iter().filter(|u| **u).count()
	}
}

/// Per-client queue of entries awaiting broadcast.
#[derive(Debug, Clone, Default)]
pub struct ClientQueue {
	ring: OffsetRing,
	entries: VecDeque<FrameEntry>,
}

impl ClientQueue {
	pub fn new() -> Self {
		Self::default()
	}

	/// Schedule `msg` relative to `current_frame`.
	///
	/// A frame that already has an entry gets the new commands appended to
	/// it; the payload of the later message is ignored. On error the queue is
	/// left untouched.
	pub fn submit(&mut self, msg: ClientMessage, current_frame: u32) -> Result<Submitted, SyncError> {
		let (delta, timing) = clamp_delta(frame_delta(msg.frame_id, current_frame));
		let target_frame = frame_add(current_frame, delta as u32);
		let max = MAX_CMD_COUNT + 1;

		if self.ring.is_used(delta) {
			let Some(entry) = self.entries.iter_mut().rev().find(|e| e.target_frame == target_frame) else {
				return Err(SyncError::StaleMerge { target_frame });
			};

			let total = 1 + entry.commands.len() + msg.commands.len();
			if total > max {
				return Err(SyncError::CommandFlood {
					target_frame,
					total,
					max,
				});
			}

			entry.commands.extend(msg.commands);
			return Ok(Submitted {
				delta,
				target_frame,
				merged: true,
				timing,
			});
		}

		let total = 1 + msg.commands.len();
		if total > max {
			return Err(SyncError::CommandFlood {
				target_frame,
				total,
				max,
			});
		}

		self.ring.mark(delta);
		self.entries.push_back(FrameEntry {
			target_frame,
			payload: msg.payload,
			commands: msg.commands,
		});

		Ok(Submitted {
			delta,
			target_frame,
			merged: false,
			timing,
		})
	}

	/// Take every queued entry in submission order.
	pub fn drain(&mut self) -> Vec<FrameEntry> {
		self.entries.drain(..).collect()
	}

	pub fn rotate(&mut self) {
		self.ring.rotate();
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn ring(&self) -> &OffsetRing {
		&self.ring
	}
}

fn clamp_delta(raw: i32) -> (usize, Timing) {
	if raw < 0 {
		(0, Timing::Late { by: raw.unsigned_abs() })
	} else if raw as usize > MAX_AHEAD {
		(
			MAX_AHEAD,
			Timing::Early {
				by: raw as u32 - MAX_AHEAD as u32,
			},
		)
	} else {
		(raw as usize, Timing::OnTime)
	}
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;
	use proptest::prelude::*;
	use tickrelay_protocol::FRAME_ID_MAX;

	use super::*;

	fn msg(frame_id: u32, payload: &'static [u8], cmds: usize) -> ClientMessage {
		let mut m = ClientMessage::new(frame_id, Bytes::from_static(payload));
		for i in 0..cmds {
			m = m.with_command(format!("c{i}").as_bytes());
		}
		m
	}

	#[test]
	fn on_time_message_keeps_requested_frame() {
		let mut q = ClientQueue::new();
		let s = q.submit(msg(12, b"p", 0), 10).expect("submit");
		assert_eq!(s.delta, 2);
		assert_eq!(s.target_frame, 12);
		assert_eq!(s.timing, Timing::OnTime);
		assert!(!s.merged);
		assert!(q.ring().is_used(2));
	}

	#[test]
	fn late_message_moves_to_current_frame() {
		let mut q = ClientQueue::new();
		let s = q.submit(msg(97, b"p", 0), 100).expect("submit");
		assert_eq!(s.delta, 0);
		assert_eq!(s.target_frame, 100);
		assert_eq!(s.timing, Timing::Late { by: 3 });

		let entries = q.drain();
		assert_eq!(entries[0].target_frame, 100);
	}

	#[test]
	fn early_message_clamps_to_window_edge() {
		let mut q = ClientQueue::new();
		let s = q.submit(msg(140, b"p", 0), 100).expect("submit");
		assert_eq!(s.delta, MAX_AHEAD);
		assert_eq!(s.target_frame, 115);
		assert_eq!(s.timing, Timing::Early { by: 25 });
	}

	#[test]
	fn clamping_works_across_wrap() {
		let mut q = ClientQueue::new();
		let current = FRAME_ID_MAX - 2;
		let s = q.submit(msg(3, b"p", 0), current).expect("submit");
		assert_eq!(s.delta, 5);
		assert_eq!(s.target_frame, 3);

		let s = q.submit(msg(FRAME_ID_MAX - 4, b"q", 0), current).expect("submit");
		assert_eq!(s.timing, Timing::Late { by: 2 });
		assert_eq!(s.target_frame, current);
	}

	#[test]
	fn second_message_for_same_frame_merges_commands() {
		let mut q = ClientQueue::new();
		q.submit(msg(5, b"first", 2), 5).expect("submit");
		let s = q.submit(msg(5, b"second", 3), 5).expect("submit");
		assert!(s.merged);

		let entries = q.drain();
		assert_eq!(entries.len(), 1);
		assert_eq!(&entries[0].payload[..], b"first");
		assert_eq!(entries[0].commands.len(), 5);
	}

	#[test]
	fn merge_targets_the_matching_entry_not_the_latest() {
		let mut q = ClientQueue::new();
		q.submit(msg(7, b"a", 0), 5).expect("submit");
		q.submit(msg(6, b"b", 0), 5).expect("submit");
		q.submit(msg(7, b"c", 1), 5).expect("submit");

		let entries = q.drain();
		assert_eq!(entries.len(), 2);
		assert_eq!(entries[0].target_frame, 7);
		assert_eq!(entries[0].commands.len(), 1);
		assert!(entries[1].commands.is_empty());
	}

	#[test]
	fn flood_on_merge_leaves_entry_unmodified() {
		let mut q = ClientQueue::new();
		q.submit(msg(5, b"p", 10), 5).expect("submit");

		let err = q.submit(msg(5, b"p", 7), 5).unwrap_err();
		assert_eq!(
			err,
			SyncError::CommandFlood {
				target_frame: 5,
				total: 18,
				max: MAX_CMD_COUNT + 1
			}
		);

		let entries = q.drain();
		assert_eq!(entries[0].commands.len(), 10);
	}

	#[test]
	fn merge_up_to_the_limit_is_accepted() {
		let mut q = ClientQueue::new();
		q.submit(msg(5, b"p", 10), 5).expect("submit");
		q.submit(msg(5, b"p", 6), 5).expect("exactly max commands");
		assert_eq!(q.drain()[0].commands.len(), MAX_CMD_COUNT);
	}

	#[test]
	fn flood_on_fresh_entry_queues_nothing() {
		let mut q = ClientQueue::new();
		let err = q.submit(msg(5, b"p", MAX_CMD_COUNT + 1), 5).unwrap_err();
		assert!(matches!(err, SyncError::CommandFlood { .. }));
		assert!(q.is_empty());
		assert_eq!(q.ring().used_count(), 0);
	}

	#[test]
	fn rotation_frees_broadcast_position() {
		let mut q = ClientQueue::new();
		q.submit(msg(10, b"p", 0), 10).expect("submit");
		q.submit(msg(11, b"p", 0), 10).expect("submit");
		assert_eq!(q.drain().len(), 2);
		q.rotate();

		// Current is now 11; its position is still marked from the last submit.
		assert!(q.ring().is_used(0));
		assert_eq!(q.ring().used_count(), 1);

		let err = q.submit(msg(11, b"late merge", 0), 11).unwrap_err();
		assert_eq!(err, SyncError::StaleMerge { target_frame: 11 });

		q.rotate();
		assert_eq!(q.ring().used_count(), 0);
		assert!(q.submit(msg(12, b"p", 0), 12).is_ok());
	}

	#[test]
	fn sixteen_consecutive_offsets_fit() {
		let mut q = ClientQueue::new();
		for d in 0..=MAX_AHEAD as u32 {
			let s = q.submit(msg(50 + d, b"p", 0), 50).expect("submit");
			assert!(!s.merged);
		}
		assert_eq!(q.ring().used_count(), OFFSET_RING_LEN);
		assert_eq!(q.len(), OFFSET_RING_LEN);
	}

	#[test]
	fn furthest_position_frees_after_sixteen_quiet_ticks() {
		let mut q = ClientQueue::new();
		let mut current = 0u32;

		// Walk the ring base around several times first.
		for _ in 0..40 {
			q.submit(msg(current + MAX_AHEAD as u32, b"p", 0), current).expect("submit");
			q.drain();
			q.rotate();
			current += 1;
		}

		let s = q.submit(msg(current + MAX_AHEAD as u32, b"p", 0), current).expect("submit");
		assert!(!s.merged);
		let held = s.target_frame;

		for _ in 0..MAX_AHEAD {
			q.drain();
			q.rotate();
			current += 1;
		}
		// The held frame is now current and its position still marked.
		assert_eq!(current, held);
		assert!(q.ring().is_used(0));

		q.drain();
		q.rotate();
		current += 1;
		assert_eq!(q.ring().used_count(), 0);

		let s = q.submit(msg(current + MAX_AHEAD as u32, b"p", 0), current).expect("reuse");
		assert!(!s.merged);
		assert_eq!(s.delta, MAX_AHEAD);
	}

	#[test]
	fn next_frame_submits_stay_fresh_across_wraps() {
		let mut q = ClientQueue::new();
		for current in 0..(3 * OFFSET_RING_LEN as u32) {
			let entries = q.drain();
			if current > 0 {
				assert_eq!(entries.len(), 1);
				assert_eq!(entries[0].target_frame, current);
			}

			let s = q.submit(msg(current + 1, b"p", 0), current).expect("submit");
			assert_eq!(s.delta, 1);
			assert!(!s.merged);
			q.rotate();
		}

		for _ in 0..OFFSET_RING_LEN {
			q.drain();
			q.rotate();
		}
		assert_eq!(q.ring().used_count(), 0);

		let current = 7 * OFFSET_RING_LEN as u32;
		for d in 0..=MAX_AHEAD as u32 {
			let s = q.submit(msg(current + d, b"p", 0), current).expect("submit");
			assert!(!s.merged);
		}
		assert_eq!(q.ring().used_count(), OFFSET_RING_LEN);
	}

	proptest! {
		#[test]
		fn target_always_lands_inside_window(current in 0..FRAME_ID_MAX, requested in 0..FRAME_ID_MAX) {
			let mut q = ClientQueue::new();
			let s = q.submit(ClientMessage::new(requested, Bytes::new()), current).expect("fresh queue");
			prop_assert!(s.delta <= MAX_AHEAD);
			prop_assert_eq!(frame_delta(s.target_frame, current), s.delta as i32);
			prop_assert!(s.target_frame < FRAME_ID_MAX);
		}
	}
}

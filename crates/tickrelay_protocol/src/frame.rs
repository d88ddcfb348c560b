#![forbid(unsafe_code)]

use crate::FRAME_ID_MAX;

const HALF_RANGE: u32 = FRAME_ID_MAX / 2;

/// Signed distance from `current` to `requested` on the wrapping frame counter.
///
/// `FRAME_ID_MAX` divides 2^32, so wrapping `u32` arithmetic followed by a
/// reduction modulo `FRAME_ID_MAX` is exact. A requested frame just past
/// the wrap point therefore reads as slightly ahead rather than hugely behind.
#[inline]
pub fn frame_delta(requested: u32, current: u32) -> i32 {
	let shifted = requested.wrapping_sub(current).wrapping_add(HALF_RANGE) % FRAME_ID_MAX;
	shifted as i32 - HALF_RANGE as i32
}

/// The frame after `frame`.
#[inline]
pub fn next_frame(frame: u32) -> u32 {
	frame_add(frame, 1)
}

/// `frame + offset`, wrapped into `[0, FRAME_ID_MAX)`.
#[inline]
pub fn frame_add(frame: u32, offset: u32) -> u32 {
	((u64::from(frame) + u64::from(offset)) % u64::from(FRAME_ID_MAX)) as u32
}

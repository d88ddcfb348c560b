#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

/// Lazily refilled token bucket.
///
/// There is no background timer: elapsed wall time is converted into tokens
/// whenever the bucket is consulted. With a non-zero `min_refill_interval`
/// refills are batched and only happen once at least that much time has
/// passed since the previous one.
#[derive(Debug, Clone)]
pub struct TokenBucket {
	capacity: f64,
	value: f64,
	refill_per_sec: f64,
	last_refill: Instant,
	min_refill_interval: Duration,
}

impl TokenBucket {
	/// A full bucket.
	pub fn new(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
		Self {
			capacity,
			value: capacity,
			refill_per_sec,
			last_refill: now,
			min_refill_interval: Duration::ZERO,
		}
	}

	pub fn with_min_refill_interval(mut self, interval: Duration) -> Self {
		self.min_refill_interval = interval;
		self
	}

	pub fn capacity(&self) -> f64 {
		self.capacity
	}

	pub fn value(&self) -> f64 {
		self.value
	}

	/// Credit the time elapsed since the last refill, capped at capacity.
	pub fn refill(&mut self, now: Instant) {
		let elapsed = now.saturating_duration_since(self.last_refill);
		if elapsed.is_zero() || elapsed < self.min_refill_interval {
			return;
		}

		self.value = (self.value + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
		self.last_refill = now;
	}

	/// Refill, then take `amount` if the bucket holds at least that much.
	pub fn try_take(&mut self, amount: f64, now: Instant) -> bool {
		self.refill(now);
		if self.value >= amount {
			self.value -= amount;
			true
		} else {
			false
		}
	}

	/// Subtract `amount` unconditionally. Returns false once the bucket is overdrawn.
	pub fn charge(&mut self, amount: f64) -> bool {
		self.value -= amount;
		self.value >= 0.0
	}
}

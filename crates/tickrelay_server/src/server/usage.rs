#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::server::token_bucket::TokenBucket;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("usage budget exhausted ({remaining:.0} bytes left)")]
pub struct UsageExceeded {
	pub remaining: f64,
}

/// Per-connection budget settings.
#[derive(Debug, Clone, Copy)]
pub struct UsageSettings {
	pub pool: u64,
	pub recovery_per_sec: u64,
	/// Flat cost added to every socket read.
	pub header_adj: u32,
	/// Flat cost of each message body and command header.
	pub proc_adj: u32,
}

/// Bills raw bytes and decoding work against one connection's budget.
///
/// Refills are batched: the budget only recovers once at least a second has
/// passed since the previous refill.
#[derive(Debug)]
pub struct UsageLimiter {
	bucket: TokenBucket,
	header_adj: f64,
	proc_adj: f64,
}

impl UsageLimiter {
	pub fn new(settings: UsageSettings, now: Instant) -> Self {
		Self {
			bucket: TokenBucket::new(settings.pool as f64, settings.recovery_per_sec as f64, now)
				.with_min_refill_interval(Duration::from_secs(1)),
			header_adj: f64::from(settings.header_adj),
			proc_adj: f64::from(settings.proc_adj),
		}
	}

	pub fn on_read(&mut self, bytes: usize, now: Instant) -> Result<(), UsageExceeded> {
		self.bucket.refill(now);
		self.charge(bytes as f64 + self.header_adj)
	}

	pub fn on_processing_fee(&mut self) -> Result<(), UsageExceeded> {
		self.charge(self.proc_adj)
	}

	pub fn remaining(&self) -> f64 {
		self.bucket.value()
	}

	fn charge(&mut self, amount: f64) -> Result<(), UsageExceeded> {
		if self.bucket.charge(amount) {
			Ok(())
		} else {
			Err(UsageExceeded {
				remaining: self.bucket.value(),
			})
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn settings(pool: u64) -> UsageSettings {
		UsageSettings {
			pool,
			recovery_per_sec: 100,
			header_adj: 50,
			proc_adj: 50,
		}
	}

	#[test]
	fn read_is_charged_with_header_adjustment() {
		let t0 = Instant::now();
		let mut usage = UsageLimiter::new(settings(1000), t0);
		usage.on_read(100, t0).expect("within budget");
		assert_eq!(usage.remaining(), 850.0);

		usage.on_processing_fee().expect("within budget");
		assert_eq!(usage.remaining(), 800.0);
	}

	#[test]
	fn overdraw_fails() {
		let t0 = Instant::now();
		let mut usage = UsageLimiter::new(settings(200), t0);
		usage.on_read(150, t0).expect("exactly at budget");
		assert_eq!(usage.remaining(), 0.0);

		let err = usage.on_processing_fee().unwrap_err();
		assert_eq!(err.remaining, -50.0);
	}

	#[test]
	fn recovery_is_batched_per_second() {
		let t0 = Instant::now();
		let mut usage = UsageLimiter::new(settings(1000), t0);
		usage.on_read(450, t0).expect("within budget");
		assert_eq!(usage.remaining(), 500.0);

		// Under a second since the last refill: no recovery.
		usage.on_read(0, t0 + Duration::from_millis(500)).expect("within budget");
		assert_eq!(usage.remaining(), 450.0);

		// 2s elapsed: +200, then the read costs 50.
		usage.on_read(0, t0 + Duration::from_secs(2)).expect("within budget");
		assert_eq!(usage.remaining(), 600.0);
	}
}

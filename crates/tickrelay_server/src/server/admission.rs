#![forbid(unsafe_code)]

use std::time::Instant;

use thiserror::Error;

use crate::server::token_bucket::TokenBucket;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
	#[error("client pool exhausted")]
	PoolExhausted,

	#[error("max clients reached ({max})")]
	ServerFull {
		max: usize,
	},
}

/// Gates how quickly new connections are accepted.
///
/// Owned by the relay dispatcher rather than the session, so a burst of
/// reconnects right after a session teardown is still throttled.
#[derive(Debug)]
pub struct AdmissionController {
	pool: TokenBucket,
}

impl AdmissionController {
	pub fn new(client_pool: u32, recovery_per_sec: f64, now: Instant) -> Self {
		Self {
			pool: TokenBucket::new(f64::from(client_pool), recovery_per_sec, now),
		}
	}

	/// Spend one token for a new connection.
	pub fn admit(&mut self, now: Instant) -> Result<(), AdmissionError> {
		if self.pool.try_take(1.0, now) {
			Ok(())
		} else {
			Err(AdmissionError::PoolExhausted)
		}
	}

	pub fn remaining(&self) -> f64 {
		self.pool.value()
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[test]
	fn burst_of_forty_admits_exactly_pool_size() {
		let t0 = Instant::now();
		let mut admission = AdmissionController::new(32, 0.2, t0);

		let admitted = (0..40).filter(|_| admission.admit(t0).is_ok()).count();
		assert_eq!(admitted, 32);
		assert_eq!(admission.admit(t0), Err(AdmissionError::PoolExhausted));
	}

	#[test]
	fn pool_recovers_at_configured_rate() {
		let t0 = Instant::now();
		let mut admission = AdmissionController::new(2, 0.2, t0);
		assert!(admission.admit(t0).is_ok());
		assert!(admission.admit(t0).is_ok());
		assert!(admission.admit(t0 + Duration::from_secs(4)).is_err());

		// 0.2/s needs five seconds for one connection.
		assert!(admission.admit(t0 + Duration::from_secs(5)).is_ok());
		assert!(admission.remaining() < 1.0);
	}
}

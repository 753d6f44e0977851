#![forbid(unsafe_code)]

pub mod backoff {
	use std::time::Duration;

	use rand::Rng;

	/// Exponential reconnect delay bounded by `[min, max]`.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct Backoff {
		pub min: Duration,
		pub max: Duration,
	}

	impl Default for Backoff {
		fn default() -> Self {
			Self {
				min: Duration::from_millis(500),
				max: Duration::from_secs(30),
			}
		}
	}

	impl Backoff {
		pub fn new(min: Duration, max: Duration) -> Self {
			if min > max {
				Self { min: max, max: min }
			} else {
				Self { min, max }
			}
		}

		/// Delay before the given attempt (1-based) without jitter.
		pub fn base_delay(&self, attempt: u32) -> Duration {
			let pow = attempt.saturating_sub(1).min(16);
			let ms = self.min.as_millis().saturating_mul(1u128 << pow);
			let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
			d.min(self.max).max(self.min)
		}

		/// Delay before the given attempt with +/-10% jitter, still within `[min, max]`.
		pub fn delay(&self, attempt: u32) -> Duration {
			let base_ms = self.base_delay(attempt).as_millis() as u64;
			let jitter_window = (base_ms / 10).max(1);
			let mut rng = rand::rng();
			let offset = rng.random_range(0..=(jitter_window * 2));
			let ms = base_ms.saturating_sub(jitter_window).saturating_add(offset);
			Duration::from_millis(ms).min(self.max).max(self.min)
		}
	}

}

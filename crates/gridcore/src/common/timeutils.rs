#[cfg(not(test))]
use std::time::Instant;

#[cfg(not(test))]
pub fn now_monotonic() -> Instant {
    Instant::now()
}

#[cfg(test)]
pub use mock_time::now_monotonic;

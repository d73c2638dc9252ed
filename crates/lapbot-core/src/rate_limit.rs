//! Spacing of outgoing LLM calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// Hands out call slots at least `spacing` apart, shared by all workers.
///
/// Slots are reserved under a short lock and awaited outside it, so a
/// waiting worker never blocks the others from reserving later slots.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    spacing: Duration,
    next_slot: Arc<Mutex<Option<Instant>>>,
}

impl RateLimiter {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Arc::new(Mutex::new(None)),
        }
    }

    /// `requests_per_minute == 0` means unlimited.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        if requests_per_minute == 0 {
            Self::new(Duration::ZERO)
        } else {
            Self::new(Duration::from_secs(60) / requests_per_minute)
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Waits until this caller may start a request.
    pub async fn acquire(&self) {
        if self.spacing.is_zero() {
            return;
        }

        let slot = {
            let mut next = self.next_slot.lock().unwrap_or_else(|p| p.into_inner());
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.spacing);
            slot
        };

        tokio::time::sleep_until(slot).await;
    }
}

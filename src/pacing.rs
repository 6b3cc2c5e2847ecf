//! Adaptive pacing for the sender.
//!
//! The mesh has no per-packet ACKs and no RTT signal, so the only loss
//! indicator available is a resume request carrying a non-empty missing
//! set. The controller counts consecutive lossy requests; once the count
//! reaches the threshold, the inter-piece delay is multiplied and clamped
//! to the ceiling. A clean request (empty missing set) resets the counter
//! but never shrinks the delay — once a link has shown loss, the slower
//! pace is kept for the rest of the transfer.
//!
//! Invariant: `initial_delay <= current_delay <= max_delay` at all times.

use crate::config::Config;
use std::time::Duration;

/// Loss-driven delay controller, one per send transfer.
#[derive(Debug, Clone)]
pub struct PacingController {
    current_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    retry_threshold: u32,
    loss_retry_counter: u32,
}

impl PacingController {
    pub fn from_config(config: &Config) -> Self {
        Self {
            current_delay: config.initial_delay,
            max_delay: config.max_delay,
            backoff_factor: config.backoff_factor,
            retry_threshold: config.retry_threshold,
            loss_retry_counter: 0,
        }
    }

    /// Feed one observed resume request into the controller.
    ///
    /// `loss_reported` is true when the request carried a non-empty
    /// missing set.
    pub fn on_resume_request(&mut self, loss_reported: bool) {
        if !loss_reported {
            self.loss_retry_counter = 0;
            return;
        }

        self.loss_retry_counter += 1;
        if self.loss_retry_counter >= self.retry_threshold {
            self.current_delay = self
                .current_delay
                .mul_f64(self.backoff_factor)
                .min(self.max_delay);
            self.loss_retry_counter = 0;
        }
    }

    /// The delay to sleep between piece transmissions.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Consecutive lossy requests seen since the last backoff or clean
    /// request.
    pub fn loss_retry_counter(&self) -> u32 {
        self.loss_retry_counter
    }
}

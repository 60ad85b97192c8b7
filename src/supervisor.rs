//! Reconnect supervision
//!
//! A supervisor owns one session's lifecycle: connect, start data transfer,
//! wait for the session to die, back off, repeat. Backoff is exponential
//! with jitter and a cap; every reconnect builds a fresh engine, so sequence
//! numbers restart from zero and share nothing with the previous instance.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::ConnectionState;
use crate::session::Iec104Session;

/// Reconnect backoff policy
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
    /// Multiplier applied per failed attempt
    pub multiplier: f64,
    /// Randomize each delay by up to ±25%
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let mut delay = self.initial_delay.mul_f64(self.multiplier.powi(exponent as i32));
        if delay > self.max_delay {
            delay = self.max_delay;
        }
        if self.jitter {
            let range = delay.as_millis() as f64 * 0.25;
            let offset = rand::thread_rng().gen_range(-range..=range);
            let millis = (delay.as_millis() as f64 + offset).max(0.0);
            delay = Duration::from_millis(millis as u64);
        }
        delay
    }
}

/// Keeps one session connected and in data transfer until cancelled
pub struct SessionSupervisor {
    session: Arc<Iec104Session>,
    policy: BackoffPolicy,
    shutdown: CancellationToken,
}

impl SessionSupervisor {
    pub fn new(session: Arc<Iec104Session>, policy: BackoffPolicy) -> Self {
        Self {
            session,
            policy,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the supervision loop and disconnects the session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Supervision loop: `while !shutdown { connect_and_run(); backoff }`.
    pub async fn run(self) {
        let mut attempt: u32 = 0;

        while !self.shutdown.is_cancelled() {
            match self.connect_and_run().await {
                Ok(()) => {
                    // clean shutdown requested
                    return;
                }
                Err(detail) => {
                    attempt += 1;
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        session = %self.session.name(),
                        event_kind = "reconnect_scheduled",
                        detail = %format!("{detail}; retry {attempt} in {delay:?}"),
                        "session lost"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One connect-to-death pass. `Ok` means shutdown was requested;
    /// `Err` carries the reason to back off and retry.
    async fn connect_and_run(&self) -> std::result::Result<(), String> {
        tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            result = self.session.connect() => {
                result.map_err(|e| format!("connect failed: {e}"))?;
            }
        }

        if let Err(e) = self.session.start_data_transfer().await {
            self.session.disconnect().await;
            return Err(format!("start data transfer failed: {e}"));
        }

        info!(
            session = %self.session.name(),
            event_kind = "data_transfer_started",
            detail = %self.session.endpoint(),
            "session active"
        );

        // watch the engine until it dies or shutdown is requested
        let Some(mut state_rx) = self.session.state_watch() else {
            return Err("session closed during startup".to_string());
        };
        loop {
            if *state_rx.borrow() == ConnectionState::Disconnected {
                return Err("session disconnected".to_string());
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.session.disconnect().await;
                    return Ok(());
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err("engine task ended".to_string());
                    }
                }
            }
        }
    }
}

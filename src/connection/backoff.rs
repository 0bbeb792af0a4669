use std::marker::PhantomData;
use std::time::Duration;
use tracing::trace;
use crate::config::ClientConfig;
use crate::util::random::{Random, RngRandom};

/// Delay between a client's reconnect attempts. Each delay grows the previous one by 50% plus
///  a random share of up to another 50%, uniformly distributed jitter and the base delay:
///
/// ```ascii
/// wait = wait * 1.5 + U(0, wait * 0.5) + U(0, jitter) + base
/// ```
///
/// The result is clamped to a ceiling that is itself randomized between 50% and 100% of the
///  configured maximum, once per backoff cycle, so that clients that lost their server at the
///  same time do not saturate at the same delay.
pub struct ReconnectBackoff<R: Random = RngRandom> {
    base_millis: f64,
    jitter_millis: f64,
    max_millis: f64,
    reset_after: Duration,

    current_millis: f64,
    ceiling_millis: Option<f64>,
    _random: PhantomData<R>,
}

impl<R: Random> ReconnectBackoff<R> {
    pub fn new(config: &ClientConfig) -> ReconnectBackoff<R> {
        ReconnectBackoff {
            base_millis: config.reconnect_base_delay.as_secs_f64() * 1000.0,
            jitter_millis: config.reconnect_jitter.as_secs_f64() * 1000.0,
            max_millis: config.max_reconnect_delay.as_secs_f64() * 1000.0,
            reset_after: config.max_pong_wait,
            current_millis: 0.0,
            ceiling_millis: None,
            _random: Default::default(),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let max_millis = self.max_millis;
        let ceiling = *self.ceiling_millis
            .get_or_insert_with(|| R::gen_f64_range(0.5..1.0) * max_millis);

        let current = self.current_millis;
        let grown = current * 1.5
            + R::gen_f64_range(0.0..current * 0.5)
            + R::gen_f64_range(0.0..self.jitter_millis)
            + self.base_millis;

        self.current_millis = grown.min(ceiling);
        trace!("next reconnect delay {:.0}ms (ceiling {:.0}ms)", self.current_millis, ceiling);
        Duration::from_secs_f64(self.current_millis / 1000.0)
    }

    /// Starts a new cycle: the next delay is computed from the base again, with a new ceiling
    pub fn reset(&mut self) {
        self.current_millis = 0.0;
        self.ceiling_millis = None;
    }

    /// A session that stayed open for at least the max pong wait counts as a successful
    ///  connection and resets the backoff
    pub fn on_session_ended(&mut self, session_duration: Duration) {
        if session_duration >= self.reset_after {
            trace!("session lasted {:?}, resetting reconnect backoff", session_duration);
            self.reset();
        }
    }
}

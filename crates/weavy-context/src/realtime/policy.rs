use std::time::Duration;

use crate::signals::BrowserSignals;

/// State of an ongoing reconnection, handed to a [`RetryPolicy`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryContext {
    /// Attempts made so far in this outage.
    pub previous_retry_count: u32,
    /// Time since the connection was lost.
    pub elapsed: Duration,
    /// Error that caused the last attempt (or the loss) to fail.
    pub retry_reason: Option<String>,
}

/// Decides whether and when a lost hub connection reconnects.
pub trait RetryPolicy: Send + Sync + 'static {
    /// `None` stops reconnecting and closes the connection.
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration>;
}

impl<F> RetryPolicy for F
where
    F: Fn(&RetryContext) -> Option<Duration> + Send + Sync + 'static,
{
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration> {
        self(context)
    }
}

const FAST_RETRY_DELAYS: [Duration; 3] = [
    Duration::ZERO,
    Duration::from_secs(2),
    Duration::from_secs(10),
];
const FAST_RETRY_WINDOW: Duration = Duration::from_secs(60);
const SLOW_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Retries quickly at first, then every 10 seconds, while the page is online
/// and visible.
#[derive(Debug, Clone)]
pub struct WeavyRetryPolicy {
    signals: BrowserSignals,
}

impl WeavyRetryPolicy {
    pub fn new(signals: BrowserSignals) -> Self {
        Self { signals }
    }
}

impl RetryPolicy for WeavyRetryPolicy {
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration> {
        if !self.signals.is_online() || !self.signals.is_visible() {
            return None;
        }

        let attempt = context.previous_retry_count as usize;
        if context.elapsed < FAST_RETRY_WINDOW && attempt < FAST_RETRY_DELAYS.len() {
            Some(FAST_RETRY_DELAYS[attempt])
        } else {
            Some(SLOW_RETRY_DELAY)
        }
    }
}

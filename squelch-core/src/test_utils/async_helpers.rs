//! Async test helpers

use std::future::Future;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};

/// Default timeout duration for tests
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Window in which an event is expected *not* to arrive
pub const QUIET_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    Closed,
}

impl std::fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvTimeoutError::Timeout => write!(f, "receive operation timed out"),
            RecvTimeoutError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}

/// Receive from an unbounded channel with a timeout
pub async fn recv_timeout<T>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    duration: Duration,
) -> Result<T, RecvTimeoutError> {
    timeout(duration, rx.recv())
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
        .ok_or(RecvTimeoutError::Closed)
}

/// Receive until `matches` accepts a message, discarding the others
pub async fn recv_matching<T>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    duration: Duration,
    matches: impl Fn(&T) -> bool,
) -> Result<T, RecvTimeoutError> {
    let deadline = Instant::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let msg = recv_timeout(rx, remaining).await?;
        if matches(&msg) {
            return Ok(msg);
        }
    }
}

/// Drain everything already queued without waiting
pub fn try_drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut results = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        results.push(msg);
    }
    results
}

/// Helper to assert a future completes within duration
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}

/// Poll `probe` until it yields `Some`, panicking after `duration`
pub async fn wait_until<F, Fut, T>(duration: Duration, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + duration;
    loop {
        if let Some(value) = probe().await {
            return value;
        }
        if Instant::now() >= deadline {
            panic!("Condition not met within {:?}", duration);
        }
        sleep(Duration::from_millis(5)).await;
    }
}

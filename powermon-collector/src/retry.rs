//! Fixed-backoff retry policy shared by the device reader and the HTTP client

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included. Zero behaves as one.
    pub max_attempts: u32,
    /// Pause between two attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        Self { max_attempts, backoff }
    }

    /// Serial reads: 100 ms between attempts
    pub const fn device(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::from_millis(100))
    }

    /// Ingestion API: 3 attempts, 5 s apart
    pub const fn network() -> Self {
        Self::fixed(3, Duration::from_secs(5))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Blocking variant, for code that already runs off the async runtime
    pub fn run_blocking<T, E, F, R>(&self, mut op: F, retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        R: Fn(&E) -> bool,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && retryable(&e) => {
                    debug!("attempt {}/{} failed, retrying in {:?}", attempt, attempts, self.backoff);
                    std::thread::sleep(self.backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Async variant. A fired `interrupt` cuts the backoff short and returns
    /// the last error; an attempt already in flight is never interrupted.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        mut op: F,
        retryable: R,
        interrupt: Option<&ShutdownSignal>,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && retryable(&e) => {
                    debug!("attempt {}/{} failed, retrying in {:?}", attempt, attempts, self.backoff);
                    match interrupt {
                        Some(signal) => {
                            let mut signal = signal.clone();
                            tokio::select! {
                                _ = tokio::time::sleep(self.backoff) => {}
                                _ = signal.triggered() => return Err(e),
                            }
                        }
                        None => tokio::time::sleep(self.backoff).await,
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

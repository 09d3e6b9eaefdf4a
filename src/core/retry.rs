//! 模型调用重试策略
//!
//! 只重试 Transient（限流、5xx、网络抖动）；Fatal 直接放行。退避为
//! base * 2^(attempt-1)，可选 0~10% 抖动避免同步羊群。

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::llm::ModelError;

#[derive(Clone, Debug)]
pub struct RetryGovernor {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryGovernor {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl RetryGovernor {
    pub fn new(max_attempts: u32, base_delay: Duration, jitter: bool) -> Self {
        Self { max_attempts, base_delay, jitter }
    }

    /// 第 attempt 次失败后的等待时长（attempt 从 1 计）
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
        let factor = if self.jitter {
            1.0 + rand::thread_rng().gen::<f64>() * 0.1
        } else {
            1.0
        };
        Duration::from_secs_f64(exp * factor)
    }

    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, ModelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(ModelError::Fatal(msg)) => return Err(ModelError::Fatal(msg)),
                Err(ModelError::Transient(msg)) => {
                    if attempt >= self.max_attempts {
                        return Err(ModelError::Transient(msg));
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "Transient model failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryGovernor {
        RetryGovernor::new(3, Duration::from_millis(1), false)
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = fast()
            .call(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ModelError::Transient("rate limited".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ModelError::Fatal("bad request".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Fatal(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ModelError::Transient("overloaded".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Transient(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_doubles_without_jitter() {
        let g = RetryGovernor::new(3, Duration::from_secs(1), false);
        assert_eq!(g.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(g.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(g.backoff_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let g = RetryGovernor::new(3, Duration::from_secs(1), true);
        for _ in 0..100 {
            let d = g.backoff_delay(2).as_secs_f64();
            assert!((2.0..=2.2).contains(&d));
        }
    }
}

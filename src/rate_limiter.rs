//! 按模型划分的速率限制
//!
//! 每个模型标识对应一个令牌桶，首次使用时创建并在进程生命周期内复用，
//! 所有并发的翻译调用共享同一个桶，因此限流是按模型聚合的。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::error::{Result, TranslationError};

/// 令牌桶的补充窗口
pub const REFILL_WINDOW: Duration = Duration::from_secs(60);

/// 令牌桶状态快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterState {
    pub capacity: u32,
    pub tokens: f64,
    /// 补充一个令牌所需的毫秒数
    pub refill_interval_ms: f64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// 速率限制器
///
/// 容量等于每分钟请求数，令牌在 60 秒窗口内连续补充。
/// 等待者按到达顺序排队（`tokio::sync::Mutex` 是公平锁），
/// 队首在等待下一个令牌期间持有锁，后来者不会插队。
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_interval: Duration,
    bucket: tokio::sync::Mutex<Bucket>,
}

impl RateLimiter {
    /// 创建新的速率限制器
    ///
    /// # 参数
    ///
    /// * `requests_per_minute` - 每分钟允许的最大请求数
    pub fn new(requests_per_minute: u32) -> Result<Self> {
        if requests_per_minute == 0 {
            return Err(TranslationError::InvalidInput(
                "requests per minute must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            capacity: requests_per_minute,
            refill_interval: REFILL_WINDOW / requests_per_minute,
            bucket: tokio::sync::Mutex::new(Bucket {
                tokens: requests_per_minute as f64,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        let gained = elapsed.as_secs_f64() / self.refill_interval.as_secs_f64();
        bucket.tokens = (bucket.tokens + gained).min(self.capacity as f64);
        bucket.last_refill = now;
    }

    /// 获取请求许可
    ///
    /// 在发起模型请求前调用，等待并消耗一个令牌后返回。
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        loop {
            self.refill(&mut bucket);
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return;
            }
            let missing = 1.0 - bucket.tokens;
            let wait = self.refill_interval.mul_f64(missing);
            tracing::debug!("速率限制：等待 {:?} 获取下一个令牌", wait);
            sleep(wait).await;
        }
    }

    /// 当前状态快照（会先按流逝时间补充令牌）
    pub async fn state(&self) -> RateLimiterState {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        RateLimiterState {
            capacity: self.capacity,
            tokens: bucket.tokens,
            refill_interval_ms: self.refill_interval.as_secs_f64() * 1000.0,
        }
    }
}

/// 按模型标识索引的速率限制器注册表
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取（必要时创建）某个模型的限流器
    ///
    /// 桶的容量在首次创建时确定，之后同一模型的不同配置不会重建桶。
    pub fn limiter_for(&self, model_id: &str, requests_per_minute: u32) -> Result<Arc<RateLimiter>> {
        let mut limiters = self
            .limiters
            .lock()
            .map_err(|_| TranslationError::ConfigError("rate limiter registry poisoned".to_string()))?;

        if let Some(limiter) = limiters.get(model_id) {
            if limiter.capacity() != requests_per_minute {
                tracing::debug!(
                    "模型 {} 的限流器已存在（{} rpm），忽略新的配置 {} rpm",
                    model_id,
                    limiter.capacity(),
                    requests_per_minute
                );
            }
            return Ok(Arc::clone(limiter));
        }

        let limiter = Arc::new(RateLimiter::new(requests_per_minute)?);
        tracing::info!("为模型 {} 创建限流器：{} rpm", model_id, requests_per_minute);
        limiters.insert(model_id.to_string(), Arc::clone(&limiter));
        Ok(limiter)
    }

    /// 等待并消耗指定模型的一个令牌
    pub async fn acquire(&self, model_id: &str, requests_per_minute: u32) -> Result<()> {
        let limiter = self.limiter_for(model_id, requests_per_minute)?;
        limiter.acquire().await;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.limiters.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_zero_rpm_rejected() {
        assert_err!(RateLimiter::new(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_wait_for_refill() {
        let limiter = RateLimiter::new(2).unwrap();
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(1));

        // 桶已空，第三次要等一个补充间隔（60s / 2）
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_reports_refill_interval() {
        let limiter = RateLimiter::new(60).unwrap();
        limiter.acquire().await;
        let state = limiter.state().await;
        assert_eq!(state.capacity, 60);
        assert!((state.refill_interval_ms - 1000.0).abs() < f64::EPSILON);
        assert!(state.tokens < 60.0);
    }

    #[tokio::test]
    async fn test_registry_reuses_bucket_per_model() {
        let registry = RateLimiterRegistry::new();
        let a = assert_ok!(registry.limiter_for("gemini-2.0-flash", 10));
        let b = assert_ok!(registry.limiter_for("gemini-2.0-flash", 99));
        let c = assert_ok!(registry.limiter_for("gemini-1.5-pro", 10));

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(b.capacity(), 10);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_model_budget() {
        let registry = Arc::new(RateLimiterRegistry::new());
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.acquire("model", 2).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}

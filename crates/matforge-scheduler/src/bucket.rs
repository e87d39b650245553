use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// How long `acquire` sleeps between attempts when the bucket is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe continuous-refill token bucket.
///
/// `tokens = min(burst, tokens + elapsed * rate)`; the bucket starts
/// full. Waiters sleep a fixed small interval between attempts rather
/// than busy-spinning.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64) -> anyhow::Result<Self> {
        anyhow::ensure!(rate > 0.0, "token bucket rate must be positive");
        anyhow::ensure!(burst >= 1.0, "token bucket burst must admit at least one call");
        Ok(Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Take one token if available, without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            // A poisoned lock means a panic mid-update; refuse the token
            // rather than poisoning callers too.
            Err(_) => return false,
        };
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

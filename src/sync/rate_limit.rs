use std::time::Duration;

use tokio::time::Instant;

use crate::error::Error;

/// Check if an upstream failure looks like a 429 rate limit.
pub fn is_rate_limited(e: &Error) -> bool {
    let msg = e.to_string();
    msg.contains("429") || msg.to_lowercase().contains("rate limit")
}

/// Enforces a fixed pause between successive upstream calls.
///
/// Calls are made one at a time; `pace` waits until `delay` has passed since
/// the previous call finished. Cache hits never call `pace`, so they are not
/// slowed down.
#[derive(Debug)]
pub struct RequestPacer {
    delay: Duration,
    last_finished: Option<Instant>,
}

impl RequestPacer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_finished: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait before issuing the next upstream call.
    pub async fn pace(&self) {
        if let Some(last) = self.last_finished {
            let ready_at = last + self.delay;
            if ready_at > Instant::now() {
                log::trace!("Pacing upstream call for {:?}", ready_at - Instant::now());
                tokio::time::sleep_until(ready_at).await;
            }
        }
    }

    /// Record that an upstream call just finished (successfully or not).
    pub fn finished(&mut self) {
        self.last_finished = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_call_is_not_delayed() {
        let pacer = RequestPacer::new(Duration::from_millis(250));
        let start = Instant::now();
        pacer.pace().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successive_calls_are_spaced() {
        let mut pacer = RequestPacer::new(Duration::from_millis(250));
        let start = Instant::now();
        for _ in 0..3 {
            pacer.pace().await;
            pacer.finished();
        }
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_calls_need_no_extra_wait() {
        let mut pacer = RequestPacer::new(Duration::from_millis(250));
        pacer.pace().await;
        pacer.finished();
        tokio::time::advance(Duration::from_secs(1)).await;
        let before = Instant::now();
        pacer.pace().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_is_rate_limited() {
        assert!(is_rate_limited(&Error::upstream("GET /contributions", "HTTP 429 Too Many Requests")));
        assert!(!is_rate_limited(&Error::upstream("GET /contributions", "HTTP 500")));
    }
}

//! Fixed-window request rate limiting per client key.

use crate::settings::RateLimitSettings;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

struct Window {
    started: Instant,
    count: u32,
}

/// Counts requests per client key (IP address or API key) within a rolling
/// fixed window.
pub struct RateLimiter {
    settings: RateLimitSettings,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one request. On rejection, returns the seconds until
    /// the client's window resets.
    pub fn check(&self, key: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        if windows.len() > 4 * 1024 {
            windows.retain(|_, w| now.duration_since(w.started) < self.settings.window);
        }
        let window = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= self.settings.window {
            window.started = now;
            window.count = 0;
        }
        window.count += 1;
        if window.count > self.settings.max_requests {
            let elapsed = now.duration_since(window.started);
            let retry_after = self.settings.window.saturating_sub(elapsed).as_secs().max(1);
            tracing::warn!(client = key, "request rate limit exceeded");
            Err(retry_after)
        } else {
            Ok(())
        }
    }
}

//! Small helpers shared across the simulator.
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use rand::Rng;
use tokio::time::{self, MissedTickBehavior};

#[cfg(test)]
pub mod test;

// RFC 1123 names only allow lower case alphanumerics between dashes.
const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TEXT_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generate a collision resistant name suffix of `len` lower case
/// alphanumerics, safe to append to an RFC 1123 resource name.
pub fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}

/// Generate `len` bytes of random alphanumeric filler text.
pub fn random_text(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| TEXT_CHARSET[rng.gen_range(0..TEXT_CHARSET.len())] as char)
        .collect()
}

/// Signals that a poll outlived its deadline.
///
/// Callers downgrade this to a warning rather than a hard failure, so it must
/// stay distinguishable from other errors in an [`anyhow::Error`] chain.
#[derive(Debug, thiserror::Error)]
#[error("timed out after {timeout:?}")]
pub struct WaitTimeout {
    /// The deadline that was exceeded.
    pub timeout: Duration,
}

/// Poll `condition` every `interval` until it reports done, it errors, or
/// `timeout` elapses. The first check happens immediately.
pub async fn poll_until<F, Fut>(
    interval: Duration,
    timeout: Duration,
    mut condition: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    time::timeout(timeout, async {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if condition().await? {
                return Ok(());
            }
        }
    })
    .await
    .unwrap_or_else(|_| Err(anyhow::Error::new(WaitTimeout { timeout })))
}

/// Hostname of this process, captured once at first use.
///
/// Falls back to `"unknown"` when the hostname cannot be resolved so the
/// `created-by` label is always populated.
pub fn hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        let hostname = gethostname::gethostname()
            .into_string()
            .unwrap_or_default();
        if hostname.is_empty() {
            "unknown".to_owned()
        } else {
            hostname
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_suffix_is_rfc1123_safe() {
        let suffix = random_suffix(16);
        assert_eq!(suffix.len(), 16);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn random_suffixes_differ() {
        assert_ne!(random_suffix(16), random_suffix(16));
    }

    #[test]
    fn random_text_has_requested_length() {
        assert_eq!(random_text(2048).len(), 2048);
    }

    #[test]
    fn hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_returns_once_the_condition_holds() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let calls = AtomicU32::new(0);
        let calls = &calls;
        poll_until(
            Duration::from_millis(10),
            Duration::from_secs(1),
            move || async move { Ok(calls.fetch_add(1, Ordering::SeqCst) == 2) },
        )
        .await
        .expect("condition eventually holds");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_surfaces_a_typed_timeout() {
        let err = poll_until(
            Duration::from_millis(10),
            Duration::from_millis(35),
            || async { Ok(false) },
        )
        .await
        .expect_err("condition never holds");
        assert!(err.is::<WaitTimeout>());
    }
}

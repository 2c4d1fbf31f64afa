use std::sync::Arc;
use std::time::Duration;

use micro_protocol::{Error, Result};

use crate::{CallScope, Request};

/// Delay before attempt `i` of a call; attempt 0 is the first one.
pub type BackoffFn = Arc<dyn Fn(&CallScope, &Request, u32) -> Duration + Send + Sync>;

/// Decides whether the failure of attempt `i` is worth another attempt. An
/// error ends the call with that error.
pub type RetryFn = Arc<dyn Fn(&CallScope, &Request, u32, &Error) -> Result<bool> + Send + Sync>;

const BACKOFF_UNIT: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(120);

/// `100ms * attempt^e`, capped at two minutes from attempt 14 on.
pub fn backoff_delay(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    if attempt > 13 {
        return BACKOFF_CAP;
    }
    let factor = (attempt as f64).powf(std::f64::consts::E) as u32;
    BACKOFF_UNIT * factor
}

pub fn exponential_backoff() -> BackoffFn {
    Arc::new(|_, _, attempt| backoff_delay(attempt))
}

pub fn no_backoff() -> BackoffFn {
    Arc::new(|_, _, _| Duration::ZERO)
}

/// Retries transport failures and server errors, never client errors.
pub fn retry_on_error() -> RetryFn {
    Arc::new(|_, _, _, err| Ok(err.is_server_error()))
}

pub fn retry_always() -> RetryFn {
    Arc::new(|_, _, _, _| Ok(true))
}

pub fn retry_never() -> RetryFn {
    Arc::new(|_, _, _, _| Ok(false))
}

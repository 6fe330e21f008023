//! Cached HTTP `Date` header values.
//!
//! Formatting the date on every response is wasteful, so the current value is
//! kept in an [`ArcSwap`] and refreshed by a background task.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::HeaderValue;
use once_cell::sync::Lazy;
use tokio::task::JoinHandle;
use tracing::trace;

static DATE_SERVICE: Lazy<DateService> = Lazy::new(|| DateService::with_update_interval(Duration::from_millis(800)));

/// Keeps the current HTTP date string, refreshed in the background.
pub struct DateService {
    current: Arc<ArcSwap<Bytes>>,
    handle: Option<JoinHandle<()>>,
}

fn http_date() -> Bytes {
    let mut buf = faf_http_date::get_date_buff_no_key();
    faf_http_date::get_date_no_key(&mut buf);
    Bytes::from_owner(buf)
}

impl DateService {
    /// The process wide instance.
    pub fn global() -> &'static DateService {
        &DATE_SERVICE
    }

    /// Starts a service refreshing every `update_interval`.
    ///
    /// Outside a tokio runtime nothing refreshes the cached value, every read
    /// formats the date instead.
    pub fn with_update_interval(update_interval: Duration) -> Self {
        let current = Arc::new(ArcSwap::from_pointee(http_date()));

        let handle = tokio::runtime::Handle::try_current().ok().map(|runtime| {
            let current = Arc::clone(&current);
            runtime.spawn(async move {
                loop {
                    tokio::time::sleep(update_interval).await;
                    current.store(Arc::new(http_date()));
                }
            })
        });
        if handle.is_none() {
            trace!("no runtime to refresh the date, format it on demand");
        }

        DateService { current, handle }
    }

    /// The current date as a header value.
    pub fn http_date(&self) -> Option<HeaderValue> {
        let date = match self.handle {
            Some(_) => self.current.load().as_ref().clone(),
            None => http_date(),
        };
        HeaderValue::from_maybe_shared(date).ok()
    }
}

impl fmt::Debug for DateService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DateService").field("current", &self.current.load()).finish_non_exhaustive()
    }
}

impl Drop for DateService {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

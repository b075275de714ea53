//! Periodic feed polling with new-item detection.
//!
//! One cycle walks every subscription sequentially: fetch, parse, update the
//! error record, and notify on at most one new item. Per-feed failures become
//! [`FeedError`](crate::storage::FeedError) records and never end the cycle;
//! only the shutdown signal does.

use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;

use crate::feed::{parse_feed, FetchError, Fetcher, ParseError, ParsedFeed};
use crate::notify::{format_notification, ChatSink};
use crate::shutdown::{Cancelled, Shutdown};
use crate::storage::{Store, StoreError, Subscription};

/// Default time between cycles.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Why a poll produced no items.
#[derive(Debug, Error)]
enum PollError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// What a single subscription check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// First successful poll; watermark recorded silently
    Baseline,
    /// Newest item unchanged since the last poll
    Unchanged,
    /// A new item was sent to the chat
    Notified,
    /// The feed parsed but had no items; subscription left untouched
    Empty,
    /// Fetch or parse failed and was recorded as a feed error
    FeedFailed,
    /// The notification could not be delivered; watermark not advanced
    SendFailed,
}

/// Tally of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub notified: usize,
    pub baselined: usize,
    pub failed: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: CheckOutcome) {
        self.checked += 1;
        match outcome {
            CheckOutcome::Notified => self.notified += 1,
            CheckOutcome::Baseline => self.baselined += 1,
            CheckOutcome::FeedFailed | CheckOutcome::SendFailed => self.failed += 1,
            CheckOutcome::Unchanged | CheckOutcome::Empty => {}
        }
    }
}

/// Background poller over every subscription in the store.
pub struct Monitor<S> {
    store: Store,
    fetcher: Fetcher,
    sink: S,
    interval: Duration,
}

impl<S: ChatSink> Monitor<S> {
    pub fn new(store: Store, fetcher: Fetcher, sink: S) -> Self {
        Self {
            store,
            fetcher,
            sink,
            interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs one cycle immediately, then one per interval until `shutdown` fires.
    pub async fn run(&self, shutdown: Shutdown) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Starting feed monitor");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle(&shutdown).await {
                Ok(report) => tracing::info!(
                    checked = report.checked,
                    notified = report.notified,
                    baselined = report.baselined,
                    failed = report.failed,
                    "Feed check complete"
                ),
                Err(Cancelled) => break,
            }
        }

        tracing::info!("Feed monitor stopped");
    }

    /// Checks every subscription once, in sequence.
    ///
    /// The subscription list is snapshotted up front; all network I/O
    /// happens outside the store lock.
    ///
    /// # Errors
    ///
    /// [`Cancelled`] if `shutdown` fires before or during a check.
    pub async fn run_cycle(&self, shutdown: &Shutdown) -> Result<CycleReport, Cancelled> {
        let subscriptions = self.store.all_subscriptions().await;
        tracing::info!(count = subscriptions.len(), "Checking feeds");

        let mut report = CycleReport::default();
        for sub in &subscriptions {
            if shutdown.is_triggered() {
                tracing::info!("Feed check interrupted by shutdown");
                return Err(Cancelled);
            }
            let outcome = self.check_subscription(sub, shutdown).await?;
            report.record(outcome);
        }
        Ok(report)
    }

    /// Polls one subscription and applies the new-item rules.
    ///
    /// # Errors
    ///
    /// [`Cancelled`] only; every other failure is folded into the outcome.
    pub async fn check_subscription(
        &self,
        sub: &Subscription,
        shutdown: &Shutdown,
    ) -> Result<CheckOutcome, Cancelled> {
        let feed_url = sub.feed_url.as_str();

        let parsed = match self.poll(feed_url, shutdown).await {
            Ok(parsed) => parsed,
            Err(PollError::Fetch(FetchError::Cancelled)) => return Err(Cancelled),
            Err(e) => {
                tracing::warn!(feed = %feed_url, error = %e, "Feed check failed");
                if let Err(store_err) = self.store.record_feed_error(feed_url, &e.to_string()).await {
                    tracing::error!(feed = %feed_url, error = %store_err, "Failed to record feed error");
                }
                return Ok(CheckOutcome::FeedFailed);
            }
        };

        if let Err(e) = self.store.clear_feed_error(feed_url).await {
            tracing::error!(feed = %feed_url, error = %e, "Failed to clear feed error");
        }

        let Some(newest) = parsed.items.first() else {
            tracing::debug!(feed = %feed_url, dialect = %parsed.dialect, "Feed has no items");
            return Ok(CheckOutcome::Empty);
        };

        let outcome = if sub.needs_baseline() {
            tracing::debug!(feed = %feed_url, guid = %newest.guid, "Recording baseline");
            CheckOutcome::Baseline
        } else if newest.guid == sub.last_item_guid {
            CheckOutcome::Unchanged
        } else {
            let message = format_notification(sub, newest);
            if let Err(e) = self.sink.send_message(message).await {
                tracing::warn!(
                    feed = %feed_url,
                    chat_id = sub.chat_id,
                    error = %e,
                    "Failed to send feed update"
                );
                return Ok(CheckOutcome::SendFailed);
            }
            tracing::debug!(feed = %feed_url, chat_id = sub.chat_id, guid = %newest.guid, "Sent feed update");
            CheckOutcome::Notified
        };

        match self
            .store
            .update_last_checked(sub.user_id, feed_url, &newest.guid)
            .await
        {
            Ok(()) => {}
            Err(StoreError::NotFound) => {
                tracing::debug!(feed = %feed_url, user_id = sub.user_id, "Subscription removed during check");
            }
            Err(e) => tracing::error!(feed = %feed_url, error = %e, "Failed to update subscription"),
        }

        Ok(outcome)
    }

    async fn poll(&self, feed_url: &str, shutdown: &Shutdown) -> Result<ParsedFeed, PollError> {
        let fetched = self.fetcher.fetch(feed_url, shutdown).await?;
        Ok(parse_feed(&fetched.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingSink;
    use crate::storage::FeedInfo;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rss(guids: &[&str]) -> String {
        let items: String = guids
            .iter()
            .map(|g| format!("<item><guid>{g}</guid><title>Post {g}</title><link>https://e.com/{g}</link></item>"))
            .collect();
        format!(r#"<rss version="2.0"><channel><title>T</title>{items}</channel></rss>"#)
    }

    async fn setup(body: String) -> (MockServer, Store, String) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
        let url = format!("{}/feed", server.uri());
        let store = Store::in_memory();
        store
            .add(Subscription::new(1, 10, &url, FeedInfo::new("T", "", "")))
            .await
            .unwrap();
        (server, store, url)
    }

    #[tokio::test]
    async fn test_send_failure_does_not_advance_watermark() {
        let (_server, store, url) = setup(rss(&["b", "a"])).await;
        store.update_last_checked(1, &url, "a").await.unwrap();

        let monitor = Monitor::new(store.clone(), Fetcher::new().unwrap(), RecordingSink::failing());
        let report = monitor.run_cycle(&Shutdown::never()).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(store.user_subscriptions(1).await[0].last_item_guid, "a");
        assert!(store.feed_error(&url).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_feed_leaves_subscription_untouched() {
        let (_server, store, url) = setup(rss(&[])).await;
        let before = store.user_subscriptions(1).await;

        let sink = RecordingSink::new();
        let monitor = Monitor::new(store.clone(), Fetcher::new().unwrap(), sink.clone());
        let sub = &before[0];
        let outcome = monitor
            .check_subscription(sub, &Shutdown::never())
            .await
            .unwrap();

        assert_eq!(outcome, CheckOutcome::Empty);
        assert_eq!(store.user_subscriptions(1).await, before);
        assert!(store.feed_error(&url).await.is_none());
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn test_parse_failure_is_recorded() {
        let (_server, store, url) = setup("<html>nope</html>".to_owned()).await;
        let monitor = Monitor::new(store.clone(), Fetcher::new().unwrap(), RecordingSink::new());

        monitor.run_cycle(&Shutdown::never()).await.unwrap();

        let err = store.feed_error(&url).await.unwrap();
        assert_eq!(err.error_count, 1);
        assert!(err.last_error.contains("not an RSS or Atom feed"));
    }

    #[tokio::test]
    async fn test_cancelled_cycle_stops_before_checking() {
        let (_server, store, _url) = setup(rss(&["a"])).await;
        let (trigger, shutdown) = crate::shutdown::channel();
        trigger.trigger();

        let monitor = Monitor::new(store.clone(), Fetcher::new().unwrap(), RecordingSink::new());
        assert_eq!(monitor.run_cycle(&shutdown).await, Err(Cancelled));
        assert!(store.user_subscriptions(1).await[0].needs_baseline());
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let (_server, store, _url) = setup(rss(&["a"])).await;
        let (trigger, shutdown) = crate::shutdown::channel();
        let monitor = Monitor::new(store.clone(), Fetcher::new().unwrap(), RecordingSink::new())
            .with_interval(Duration::from_secs(3600));

        let handle = tokio::spawn(async move { monitor.run(shutdown).await });
        // The immediate first cycle records the baseline
        for _ in 0..100 {
            if !store.user_subscriptions(1).await[0].needs_baseline() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.user_subscriptions(1).await[0].last_item_guid, "a");

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor should stop")
            .unwrap();
    }
}

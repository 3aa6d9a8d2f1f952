//! The aggregation loop.
//!
//! Each cycle claims the feeds most overdue for a refresh, fetches them with
//! bounded concurrency and stores any posts not seen before. A feed that
//! fails to fetch is still marked fetched so it goes to the back of the
//! queue instead of being retried on every tick.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::db::Database;
use crate::error::{FetchError, StoreError};
use crate::feed::FeedSource;
use crate::models::{Feed, NewPost};

/// Longest claim a scheduler will take on a feed. Keeps the claim expiry a
/// timestamp SQLite can store and compare as text.
pub const MAX_LEASE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of fetches in flight at once.
    pub concurrency: usize,
    /// Time between the starts of two cycles.
    pub interval: Duration,
    /// Hard bound on a single fetch; expiry counts as a network error.
    pub fetch_timeout: Duration,
    /// How long a claimed feed stays reserved if its process dies mid-cycle.
    pub lease: Duration,
    /// Feeds claimed per cycle.
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(30),
            lease: Duration::from_secs(300),
            batch_size: 4,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub selected: usize,
    pub fetched: usize,
    pub failed: usize,
    pub skipped: usize,
    pub new_posts: usize,
}

enum FeedOutcome {
    Fetched { new_posts: usize },
    Failed,
    Skipped,
}

/// Requests a graceful shutdown of a running [`Scheduler`].
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct Scheduler<S> {
    db: Database,
    source: S,
    config: SchedulerConfig,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl<S: FeedSource> Scheduler<S> {
    pub fn new(db: Database, source: S, mut config: SchedulerConfig) -> Self {
        config.concurrency = config.concurrency.max(1);
        config.batch_size = config.batch_size.max(1);
        if config.lease > MAX_LEASE {
            warn!(
                "Lease of {}s exceeds the maximum, using {}s",
                config.lease.as_secs(),
                MAX_LEASE.as_secs()
            );
            config.lease = MAX_LEASE;
        }

        let (stop_tx, stop_rx) = watch::channel(false);

        Self {
            db,
            source,
            config,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn is_stopping(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Runs cycles until stopped. Only a storage connection failure ends the
    /// loop early; it is returned so the caller can decide to restart.
    pub async fn run(&self) -> Result<(), StoreError> {
        info!(
            "Aggregator started (interval: {}s, concurrency: {}, batch: {})",
            self.config.interval.as_secs(),
            self.config.concurrency,
            self.config.batch_size
        );

        let mut stop_rx = self.stop_rx.clone();

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            let started = Instant::now();

            let report = match self.run_cycle().await {
                Ok(report) => report,
                Err(e) => {
                    error!("Aggregation cycle aborted: {}", e);
                    return Err(e);
                }
            };

            if report.selected > 0 {
                info!(
                    "Cycle finished in {:.1}s: {} fetched, {} failed, {} skipped, {} new post(s)",
                    started.elapsed().as_secs_f64(),
                    report.fetched,
                    report.failed,
                    report.skipped,
                    report.new_posts
                );
            }

            // A cycle that overran the interval is followed immediately. An
            // interval too large to schedule waits for the stop signal.
            let idle = async {
                match started.checked_add(self.config.interval) {
                    Some(deadline) => time::sleep_until(deadline).await,
                    None => future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = idle => {}
                _ = stop_rx.changed() => {}
            }
        }

        info!("Aggregator stopped");
        Ok(())
    }

    /// One pass: claim, fetch, store. Fetch failures are counted, not
    /// returned.
    pub async fn run_cycle(&self) -> Result<CycleReport, StoreError> {
        let feeds = self.claim_batch().await?;
        let mut report = CycleReport {
            selected: feeds.len(),
            ..CycleReport::default()
        };

        if feeds.is_empty() {
            debug!("No feeds due for refresh");
            return Ok(report);
        }

        debug!(
            "Refreshing {} feed(s), at most {} at a time",
            feeds.len(),
            self.config.concurrency
        );

        let mut outcomes = stream::iter(feeds)
            .map(|feed| self.refresh_feed(feed))
            .buffer_unordered(self.config.concurrency);

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Ok(FeedOutcome::Fetched { new_posts }) => {
                    report.fetched += 1;
                    report.new_posts += new_posts;
                }
                Ok(FeedOutcome::Failed) => report.failed += 1,
                Ok(FeedOutcome::Skipped) => report.skipped += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("Failed to record feed refresh: {}", e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn claim_batch(&self) -> Result<Vec<Feed>, StoreError> {
        let lease = ChronoDuration::from_std(self.config.lease)
            .unwrap_or_else(|_| ChronoDuration::hours(1));

        let mut feeds = Vec::with_capacity(self.config.batch_size);
        while feeds.len() < self.config.batch_size && !self.is_stopping() {
            let now = Utc::now();
            let claim_until = now
                .checked_add_signed(lease)
                .unwrap_or(now + ChronoDuration::hours(1));
            match self.db.claim_next_feed(now, claim_until).await {
                Ok(feed) => feeds.push(feed),
                Err(StoreError::NotFound(_)) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(feeds)
    }

    async fn refresh_feed(&self, feed: Feed) -> Result<FeedOutcome, StoreError> {
        if self.is_stopping() {
            debug!("Releasing feed {} unfetched, shutting down", feed.id);
            self.db.release_claim(feed.id).await?;
            return Ok(FeedOutcome::Skipped);
        }

        debug!("Fetching feed {} ({})", feed.id, feed.url);

        let fetched = match time::timeout(
            self.config.fetch_timeout,
            self.source.fetch_feed(&feed.url),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Network {
                url: feed.url.clone(),
                message: format!(
                    "timed out after {}ms",
                    self.config.fetch_timeout.as_millis()
                ),
            }),
        };

        self.db.mark_fetched(feed.id, Utc::now()).await?;

        let document = match fetched {
            Ok(document) => document,
            Err(e) => {
                warn!("Failed to fetch feed '{}' ({}): {}", feed.name, feed.id, e);
                return Ok(FeedOutcome::Failed);
            }
        };

        // Sequential per feed: the dedup check relies on it.
        let mut new_posts = 0;
        for item in document.items {
            let post = NewPost::from_item(feed.id, item);
            match self.db.upsert_post(&post).await {
                Ok(true) => new_posts += 1,
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!("Failed to store post {} for feed {}: {}", post.url, feed.id, e),
            }
        }

        if new_posts > 0 {
            info!("Feed '{}': {} new post(s)", feed.name, new_posts);
        } else {
            debug!("Feed '{}': no new posts", feed.name);
        }

        Ok(FeedOutcome::Fetched { new_posts })
    }
}

//! In-memory collaborators for exercising the engine without a network.
//!
//! Compiled for this crate's unit tests and, through the `test-util`
//! feature, for its integration tests. Release builds leave it out.
//!
//! [`ScriptedSource`] serves canned feeds and scripted failures;
//! [`RecordingSink`] records what it was asked to deliver and can be told to
//! fail for specific items.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::feed::{Candidate, ContentSource, FetchError};
use crate::notify::{DeliveryError, NotificationSink, PostNotification, StatusMessage};
use crate::storage::{Account, AccountProfile, Item};

/// A plain item with a title and link derived from its id.
pub fn item(id: &str) -> Item {
    Item {
        external_id: id.to_string(),
        title: format!("Post {id}"),
        description: Some(format!("Idea {id}")),
        url: Some(format!("https://example.com/p/{id}/")),
        image_url: None,
        published_at: None,
    }
}

#[derive(Default)]
struct SourceScript {
    feeds: HashMap<String, Vec<Candidate>>,
    failures: HashMap<String, VecDeque<FetchError>>,
    probe_failures: VecDeque<FetchError>,
    known: HashSet<String>,
}

/// A [`ContentSource`] serving whatever the test put in it.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<SourceScript>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every fetch take `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replace the feed of `account` with `items` (newest first).
    /// The account also becomes known to [`probe`](ContentSource::probe).
    pub fn set_feed(&self, account: &str, items: Vec<Item>) {
        self.set_candidates(account, items.into_iter().map(Ok).collect());
    }

    pub fn set_candidates(&self, account: &str, candidates: Vec<Candidate>) {
        let mut script = self.lock();
        script.known.insert(account.to_string());
        script.feeds.insert(account.to_string(), candidates);
    }

    /// Make `name` exist upstream without giving it any items.
    pub fn add_known(&self, name: &str) {
        self.lock().known.insert(name.to_string());
    }

    /// The next fetch for `account` fails with `error`.
    pub fn fail_next_fetch(&self, account: &str, error: FetchError) {
        self.lock()
            .failures
            .entry(account.to_string())
            .or_default()
            .push_back(error);
    }

    /// The next probe (for any name) fails with `error`.
    pub fn fail_next_probe(&self, error: FetchError) {
        self.lock().probe_failures.push_back(error);
    }

    /// Number of fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Highest number of fetches that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SourceScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ContentSource for ScriptedSource {
    async fn probe(&self, name: &str) -> Result<AccountProfile, FetchError> {
        let mut script = self.lock();
        if let Some(error) = script.probe_failures.pop_front() {
            return Err(error);
        }
        if !script.known.contains(name) {
            return Err(FetchError::NotFound(name.to_string()));
        }
        Ok(AccountProfile {
            name: name.to_string(),
            profile_url: format!("https://example.com/u/{name}/"),
            icon_url: None,
        })
    }

    async fn fetch_candidates(
        &self,
        account: &Account,
        max: usize,
    ) -> Result<Vec<Candidate>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let mut script = self.lock();
            match script
                .failures
                .get_mut(&account.name)
                .and_then(VecDeque::pop_front)
            {
                Some(error) => Err(error),
                None => {
                    let mut candidates = script
                        .feeds
                        .get(&account.name)
                        .cloned()
                        .unwrap_or_default();
                    candidates.truncate(max);
                    Ok(candidates)
                }
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
struct SinkRecord {
    delivered: Vec<PostNotification>,
    statuses: Vec<StatusMessage>,
    failures: HashMap<String, VecDeque<DeliveryError>>,
    always: HashMap<String, DeliveryError>,
    attempts: usize,
}

/// A [`NotificationSink`] that keeps everything it confirms.
#[derive(Default)]
pub struct RecordingSink {
    record: Mutex<SinkRecord>,
    delay: Option<Duration>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery attempt and status report take `delay` before
    /// answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The next attempt to deliver `external_id` fails with `error`.
    /// Call repeatedly to fail several attempts in a row.
    pub fn fail_delivery(&self, external_id: &str, error: DeliveryError) {
        self.lock()
            .failures
            .entry(external_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Every attempt to deliver `external_id` fails with `error`.
    pub fn fail_always(&self, external_id: &str, error: DeliveryError) {
        self.lock().always.insert(external_id.to_string(), error);
    }

    /// Stop failing deliveries of `external_id`.
    pub fn recover(&self, external_id: &str) {
        let mut record = self.lock();
        record.always.remove(external_id);
        record.failures.remove(external_id);
    }

    /// External ids of confirmed deliveries, in delivery order.
    pub fn delivered_ids(&self) -> Vec<String> {
        self.lock()
            .delivered
            .iter()
            .map(|p| p.external_id.clone())
            .collect()
    }

    pub fn statuses(&self) -> Vec<StatusMessage> {
        self.lock().statuses.clone()
    }

    /// Number of delivery attempts, failed ones included.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, post: &PostNotification) -> Result<(), DeliveryError> {
        self.lock().attempts += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut record = self.lock();
        if let Some(error) = record.always.get(&post.external_id) {
            return Err(error.clone());
        }
        if let Some(error) = record
            .failures
            .get_mut(&post.external_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        record.delivered.push(post.clone());
        Ok(())
    }

    async fn report_status(&self, status: &StatusMessage) -> Result<(), DeliveryError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.lock().statuses.push(status.clone());
        Ok(())
    }
}

//! Concurrent reviewer aggregation engine.
//!
//! One task per unique reviewer, bounded by a semaphore pool. A reviewer's
//! failure is converted into data on its own aggregate; it never aborts a
//! sibling task or the run.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use revx_core::{
    AggregationResult, FeedEntry, FeedPage, ReviewRecord, ReviewerAggregate, ReviewerIdentity,
};
use revx_feed::FeedError;
use revx_gateway::{ContentGateway, GatewayError};

pub const CRATE_NAME: &str = "revx-engine";

/// Error recorded on an aggregate whose seed identity carries no usable
/// profile URL.
pub const PROFILE_URL_UNAVAILABLE: &str = "Profile URL not available";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("{0}")]
    Source(String),
}

/// Retrieval seam for one page of a reviewer's public feed. Production
/// code composes the content gateway with the markup extractor; tests
/// script pages and failures directly.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_page(&self, profile_url: &str, page: u32) -> Result<FeedPage, EngineError>;
}

pub struct GatewayFeedSource {
    gateway: Arc<ContentGateway>,
}

impl GatewayFeedSource {
    pub fn new(gateway: Arc<ContentGateway>) -> Self {
        Self { gateway }
    }

    pub fn page_url(profile_url: &str, page: u32) -> String {
        format!("{}/recommended/?p={page}", profile_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl FeedSource for GatewayFeedSource {
    async fn fetch_page(&self, profile_url: &str, page: u32) -> Result<FeedPage, EngineError> {
        let url = Self::page_url(profile_url, page);
        let content = self.gateway.fetch_proxied(&url).await?;
        Ok(revx_feed::parse_feed_page(&content.body)?)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard ceiling on feed pages fetched per reviewer.
    pub max_pages_per_reviewer: u32,
    /// Title to skip in every reviewer's history, typically the title
    /// currently under analysis.
    pub exclude_app_id: Option<String>,
    /// Reviewer tasks admitted concurrently.
    pub max_concurrent_reviewers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_pages_per_reviewer: 3,
            exclude_app_id: None,
            max_concurrent_reviewers: 5,
        }
    }
}

/// Coarse progress callback: (reviewers processed, total reviewers).
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

fn merge_entries(
    reviews: &mut BTreeMap<String, FeedEntry>,
    entries: Vec<FeedEntry>,
    exclude_app_id: Option<&str>,
) {
    for entry in entries {
        if !entry.recommended || entry.app_id.is_empty() {
            continue;
        }
        if exclude_app_id.is_some_and(|excluded| excluded == entry.app_id) {
            continue;
        }
        reviews.insert(entry.app_id.clone(), entry);
    }
}

/// Fetches page 1, then pages 2..=min(total, max) concurrently, merging
/// positive entries into `reviews`. Returns the reviewer's discovered
/// total page count. Pages fetched before a failing sibling are still
/// merged; the first error is reported after the merge.
async fn collect_reviewer_feed(
    feed: Arc<dyn FeedSource>,
    profile_url: &str,
    max_pages: u32,
    exclude_app_id: Option<&str>,
    reviews: &mut BTreeMap<String, FeedEntry>,
) -> Result<u32, EngineError> {
    let first = feed.fetch_page(profile_url, 1).await?;
    let total_pages = first.pagination.total_pages.max(1);
    merge_entries(reviews, first.entries, exclude_app_id);

    let last_page = total_pages.min(max_pages.max(1));
    if last_page >= 2 {
        let mut fetches: JoinSet<(u32, Result<FeedPage, EngineError>)> = JoinSet::new();
        for page in 2..=last_page {
            let feed = Arc::clone(&feed);
            let url = profile_url.to_string();
            fetches.spawn(async move { (page, feed.fetch_page(&url, page).await) });
        }

        let mut pages = Vec::with_capacity((last_page - 1) as usize);
        while let Some(joined) = fetches.join_next().await {
            let (page_no, outcome) = joined
                .map_err(|err| EngineError::Source(format!("feed page task failed: {err}")))?;
            pages.push((page_no, outcome));
        }

        // Tail pages land out of order; merging in page order keeps the
        // last-parsed-wins rule deterministic.
        pages.sort_by_key(|(page_no, _)| *page_no);
        let mut first_error = None;
        for (_, outcome) in pages {
            match outcome {
                Ok(page) => merge_entries(reviews, page.entries, exclude_app_id),
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(_) => {}
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
    }

    Ok(total_pages)
}

/// Visits every unique reviewer behind a batch of seed reviews and merges
/// their own positive review histories into one cross-referenced result.
pub struct Aggregator {
    feed: Arc<dyn FeedSource>,
    config: EngineConfig,
}

impl Aggregator {
    pub fn new(feed: Arc<dyn FeedSource>, config: EngineConfig) -> Self {
        Self { feed, config }
    }

    /// Never rejects for per-reviewer failures: a failed reviewer carries
    /// its error string on its own aggregate and the batch completes.
    /// Progress fires once per terminal reviewer task and reaches
    /// `(total, total)` even when every task fails.
    pub async fn aggregate(
        &self,
        seeds: &[ReviewRecord],
        progress: Option<ProgressFn>,
    ) -> AggregationResult {
        let run_id = Uuid::new_v4();

        // Negative seed reviews do not feed reviewer discovery; the first
        // seen identity stub wins per reviewer id.
        let mut seen = HashSet::new();
        let mut identities = Vec::new();
        for record in seeds.iter().filter(|record| record.voted_up) {
            if seen.insert(record.author.steam_id.clone()) {
                identities.push(ReviewerIdentity::from_author(&record.author));
            }
        }

        let total = identities.len();
        if total == 0 {
            return AggregationResult::default();
        }
        debug!(%run_id, reviewers = total, "starting aggregation run");

        let processed = Arc::new(AtomicUsize::new(0));
        let limiter = Arc::new(Semaphore::new(self.config.max_concurrent_reviewers.max(1)));
        let mut tasks: JoinSet<(String, ReviewerAggregate)> = JoinSet::new();

        for identity in identities {
            let feed = Arc::clone(&self.feed);
            let limiter = Arc::clone(&limiter);
            let processed = Arc::clone(&processed);
            let progress = progress.clone();
            let max_pages = self.config.max_pages_per_reviewer;
            let exclude = self.config.exclude_app_id.clone();

            tasks.spawn(async move {
                let _permit = limiter
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed");

                let reviewer_id = identity.id.clone();
                let mut aggregate = ReviewerAggregate::new(identity);

                match aggregate.identity.profile_url.clone() {
                    Some(profile_url) if aggregate.identity.has_usable_profile_url() => {
                        match collect_reviewer_feed(
                            feed,
                            &profile_url,
                            max_pages,
                            exclude.as_deref(),
                            &mut aggregate.reviews,
                        )
                        .await
                        {
                            Ok(total_pages) => aggregate.total_pages = Some(total_pages),
                            Err(err) => {
                                warn!(%run_id, reviewer = %reviewer_id, error = %err,
                                    "reviewer aggregation failed");
                                aggregate.error = Some(err.to_string());
                            }
                        }
                    }
                    _ => {
                        aggregate.error = Some(PROFILE_URL_UNAVAILABLE.to_string());
                    }
                }

                let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(callback) = &progress {
                    callback(done, total);
                }
                (reviewer_id, aggregate)
            });
        }

        let mut result = AggregationResult::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((reviewer_id, aggregate)) => {
                    result.reviewers.insert(reviewer_id, aggregate);
                }
                Err(err) => {
                    warn!(%run_id, error = %err, "reviewer task join failure");
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use revx_core::{FeedPagination, ReviewAuthor};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct ScriptedFeed {
        pages: HashMap<String, Vec<FeedPage>>,
        failing_pages: HashSet<(String, u32)>,
        calls: Mutex<Vec<(String, u32)>>,
    }

    impl ScriptedFeed {
        fn new() -> Self {
            Self {
                pages: HashMap::new(),
                failing_pages: HashSet::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with_pages(mut self, profile_url: &str, pages: Vec<FeedPage>) -> Self {
            self.pages.insert(profile_url.to_string(), pages);
            self
        }

        fn failing(mut self, profile_url: &str, page: u32) -> Self {
            self.failing_pages.insert((profile_url.to_string(), page));
            self
        }

        fn calls(&self) -> Vec<(String, u32)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FeedSource for ScriptedFeed {
        async fn fetch_page(&self, profile_url: &str, page: u32) -> Result<FeedPage, EngineError> {
            self.calls
                .lock()
                .unwrap()
                .push((profile_url.to_string(), page));
            if self.failing_pages.contains(&(profile_url.to_string(), page)) {
                return Err(EngineError::Source("scripted feed failure".to_string()));
            }
            self.pages
                .get(profile_url)
                .and_then(|pages| pages.get((page - 1) as usize))
                .cloned()
                .ok_or_else(|| {
                    EngineError::Source(format!("no scripted page {page} for {profile_url}"))
                })
        }
    }

    fn seed(id: &str, voted_up: bool, profile_url: Option<&str>) -> ReviewRecord {
        ReviewRecord {
            recommendation_id: format!("rec-{id}-{voted_up}"),
            author: ReviewAuthor {
                steam_id: id.to_string(),
                profile_url: profile_url.map(str::to_string),
                persona_name: None,
                avatar: None,
            },
            body: String::new(),
            created_at: DateTime::UNIX_EPOCH,
            updated_at: DateTime::UNIX_EPOCH,
            voted_up,
            votes_up: 0,
            votes_funny: 0,
            comment_count: 0,
            purchased_on_platform: true,
            received_for_free: false,
            written_during_early_access: false,
        }
    }

    fn entry(app_id: &str, recommended: bool, body: &str) -> FeedEntry {
        FeedEntry {
            app_id: app_id.to_string(),
            title: None,
            cover_url: None,
            recommended,
            hours_on_record: None,
            hours_at_review: None,
            body: body.to_string(),
            posted_display: String::new(),
            posted_at: None,
            permalink: None,
        }
    }

    fn page(entries: Vec<FeedEntry>, current: u32, total: u32) -> FeedPage {
        FeedPage {
            entries,
            pagination: FeedPagination {
                current_page: current,
                total_pages: total,
            },
        }
    }

    fn recorder() -> (ProgressFn, Arc<Mutex<Vec<(usize, usize)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let callback: ProgressFn = Arc::new(move |done, total| {
            sink.lock().unwrap().push((done, total));
        });
        (callback, calls)
    }

    fn aggregator(feed: ScriptedFeed, config: EngineConfig) -> Aggregator {
        Aggregator::new(Arc::new(feed), config)
    }

    #[tokio::test]
    async fn one_failing_reviewer_does_not_abort_the_batch() {
        let feed = ScriptedFeed::new()
            .with_pages("https://steamcommunity.com/profiles/a", vec![page(
                vec![entry("10", true, "a likes 10")],
                1,
                1,
            )])
            .failing("https://steamcommunity.com/profiles/b", 1)
            .with_pages("https://steamcommunity.com/profiles/c", vec![page(
                vec![entry("30", true, "c likes 30")],
                1,
                1,
            )]);
        let (progress, calls) = recorder();

        let seeds = vec![
            seed("a", true, Some("https://steamcommunity.com/profiles/a")),
            seed("b", true, Some("https://steamcommunity.com/profiles/b")),
            seed("c", true, Some("https://steamcommunity.com/profiles/c")),
        ];
        let result = aggregator(feed, EngineConfig::default())
            .aggregate(&seeds, Some(progress))
            .await;

        assert_eq!(result.reviewers.len(), 3);
        assert_eq!(result.reviewers["a"].reviews.len(), 1);
        assert!(result.reviewers["a"].error.is_none());
        assert_eq!(result.reviewers["a"].total_pages, Some(1));

        let failed = &result.reviewers["b"];
        assert!(failed.error.as_deref().unwrap().contains("scripted feed failure"));
        assert!(failed.reviews.is_empty());
        assert!(failed.total_pages.is_none());

        assert_eq!(result.reviewers["c"].reviews.len(), 1);

        let mut observed = calls.lock().unwrap().clone();
        observed.sort_unstable();
        assert_eq!(observed, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn reviewers_deduplicate_by_id_first_seen_wins() {
        let feed = ScriptedFeed::new()
            .with_pages("https://steamcommunity.com/profiles/a", vec![page(vec![], 1, 1)])
            .with_pages("https://steamcommunity.com/profiles/b", vec![page(vec![], 1, 1)]);

        let mut first = seed("a", true, Some("https://steamcommunity.com/profiles/a"));
        first.author.persona_name = Some("first-stub".to_string());
        let mut later = seed("a", true, Some("https://steamcommunity.com/profiles/a-other"));
        later.author.persona_name = Some("later-stub".to_string());

        let seeds = vec![
            first,
            seed("b", true, Some("https://steamcommunity.com/profiles/b")),
            later,
            seed("a", true, Some("https://steamcommunity.com/profiles/a")),
            seed("b", true, Some("https://steamcommunity.com/profiles/b")),
        ];
        let result = aggregator(feed, EngineConfig::default())
            .aggregate(&seeds, None)
            .await;

        assert_eq!(result.reviewers.len(), 2);
        assert_eq!(
            result.reviewers["a"].identity.persona_name.as_deref(),
            Some("first-stub")
        );
    }

    #[tokio::test]
    async fn repeat_titles_collapse_to_the_last_parsed_entry() {
        let url = "https://steamcommunity.com/profiles/a";
        let feed = ScriptedFeed::new().with_pages(url, vec![
            page(
                vec![entry("10", true, "page one take"), entry("10", true, "same page rewrite")],
                1,
                2,
            ),
            page(vec![entry("10", true, "page two wins")], 2, 2),
        ]);

        let seeds = vec![seed("a", true, Some(url))];
        let result = aggregator(feed, EngineConfig::default())
            .aggregate(&seeds, None)
            .await;

        let aggregate = &result.reviewers["a"];
        assert_eq!(aggregate.reviews.len(), 1);
        assert_eq!(aggregate.reviews["10"].body, "page two wins");
        assert_eq!(aggregate.total_pages, Some(2));
    }

    #[tokio::test]
    async fn unusable_profile_url_short_circuits_without_fetching() {
        let feed = ScriptedFeed::new();
        let calls_probe = Arc::new(feed);
        let aggregator = Aggregator::new(calls_probe.clone(), EngineConfig::default());
        let (progress, calls) = recorder();

        let seeds = vec![
            seed("a", true, None),
            seed("b", true, Some("#")),
            seed("c", true, Some("")),
        ];
        let result = aggregator.aggregate(&seeds, Some(progress)).await;

        assert_eq!(result.reviewers.len(), 3);
        for id in ["a", "b", "c"] {
            let aggregate = &result.reviewers[id];
            assert_eq!(aggregate.error.as_deref(), Some(PROFILE_URL_UNAVAILABLE));
            assert!(aggregate.reviews.is_empty());
            assert!(aggregate.total_pages.is_none());
        }
        assert!(calls_probe.calls().is_empty(), "no fetch attempted");
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn empty_and_all_negative_seed_sets_produce_empty_results() {
        let (progress, calls) = recorder();
        let result = aggregator(ScriptedFeed::new(), EngineConfig::default())
            .aggregate(&[], Some(progress))
            .await;
        assert!(result.reviewers.is_empty());

        let (progress, more_calls) = recorder();
        let seeds = vec![seed("a", false, Some("https://steamcommunity.com/profiles/a"))];
        let result = aggregator(ScriptedFeed::new(), EngineConfig::default())
            .aggregate(&seeds, Some(progress))
            .await;
        assert!(result.reviewers.is_empty());

        assert!(calls.lock().unwrap().is_empty(), "progress never invoked");
        assert!(more_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn page_ceiling_bounds_fetches_but_keeps_discovered_total() {
        let url = "https://steamcommunity.com/profiles/a";
        let feed = ScriptedFeed::new().with_pages(url, vec![
            page(vec![entry("10", true, "one")], 1, 5),
            page(vec![entry("20", true, "two")], 2, 5),
            page(vec![entry("30", true, "three")], 3, 5),
        ]);
        let probe = Arc::new(feed);
        let aggregator = Aggregator::new(
            probe.clone(),
            EngineConfig {
                max_pages_per_reviewer: 2,
                ..EngineConfig::default()
            },
        );

        let seeds = vec![seed("a", true, Some(url))];
        let result = aggregator.aggregate(&seeds, None).await;

        let mut fetched: Vec<u32> = probe.calls().into_iter().map(|(_, page)| page).collect();
        fetched.sort_unstable();
        assert_eq!(fetched, vec![1, 2]);

        let aggregate = &result.reviewers["a"];
        assert_eq!(aggregate.total_pages, Some(5));
        assert_eq!(aggregate.reviews.len(), 2);
    }

    #[tokio::test]
    async fn excluded_title_never_enters_the_review_map() {
        let url = "https://steamcommunity.com/profiles/a";
        let feed = ScriptedFeed::new().with_pages(url, vec![page(
            vec![
                entry("440", true, "the analyzed title"),
                entry("620", true, "kept"),
                entry("", true, "missing title id"),
                entry("730", false, "negative entry skipped"),
            ],
            1,
            1,
        )]);
        let aggregator = aggregator(
            feed,
            EngineConfig {
                exclude_app_id: Some("440".to_string()),
                ..EngineConfig::default()
            },
        );

        let seeds = vec![seed("a", true, Some(url))];
        let result = aggregator.aggregate(&seeds, None).await;

        let aggregate = &result.reviewers["a"];
        assert_eq!(aggregate.reviews.len(), 1);
        assert!(aggregate.reviews.contains_key("620"));
    }

    #[tokio::test]
    async fn failing_tail_page_keeps_partial_state_and_records_the_error() {
        let url = "https://steamcommunity.com/profiles/a";
        let feed = ScriptedFeed::new()
            .with_pages(url, vec![
                page(vec![entry("10", true, "one")], 1, 3),
                page(vec![entry("20", true, "two")], 2, 3),
            ])
            .failing(url, 3);

        let seeds = vec![seed("a", true, Some(url))];
        let result = aggregator(feed, EngineConfig::default())
            .aggregate(&seeds, None)
            .await;

        let aggregate = &result.reviewers["a"];
        assert!(aggregate.error.is_some());
        assert!(aggregate.total_pages.is_none());
        assert_eq!(aggregate.reviews.len(), 2, "successful pages stay merged");
    }

    #[tokio::test]
    async fn mixed_seed_batch_splits_reachable_and_unreachable_reviewers() {
        let url_a = "https://steamcommunity.com/profiles/A";
        let feed = ScriptedFeed::new()
            .with_pages(url_a, vec![page(vec![entry("10", true, "a history")], 1, 1)]);

        let seeds = vec![
            seed("A", true, Some(url_a)),
            seed("A", false, Some(url_a)),
            seed("B", true, Some("#")),
        ];
        let result = aggregator(feed, EngineConfig::default())
            .aggregate(&seeds, None)
            .await;

        assert_eq!(result.reviewers.len(), 2);
        assert_eq!(
            result.reviewers["B"].error.as_deref(),
            Some(PROFILE_URL_UNAVAILABLE)
        );
        assert!(result.reviewers["A"].error.is_none());
        assert_eq!(result.reviewers["A"].reviews.len(), 1);
    }

    #[test]
    fn feed_page_urls_are_built_from_the_profile_url() {
        assert_eq!(
            GatewayFeedSource::page_url("https://steamcommunity.com/profiles/1/", 2),
            "https://steamcommunity.com/profiles/1/recommended/?p=2"
        );
        assert_eq!(
            GatewayFeedSource::page_url("https://steamcommunity.com/id/gale", 1),
            "https://steamcommunity.com/id/gale/recommended/?p=1"
        );
    }
}

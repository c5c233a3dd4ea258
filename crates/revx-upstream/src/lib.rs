//! Client for the upstream review-listing and player-profile JSON APIs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use revx_core::{
    EnrichedAuthor, EnrichedReview, EnrichedReviewPage, PlayerProfile, ReviewAuthor, ReviewPage,
    ReviewRecord, ReviewSummary,
};
use revx_gateway::{GatewayError, HttpFetch, RemoteFetch, TtlCache};

pub const CRATE_NAME: &str = "revx-upstream";

/// Hard ceiling on ids per profile-batch request.
pub const PROFILE_BATCH_CEILING: usize = 100;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("upstream api reported failure for {url}: {detail}")]
    Api { url: String, detail: String },
    #[error("malformed response from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
}

/// Review-listing query parameters. A missing option takes the documented
/// default; the full set forms the cache key for the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewQuery {
    pub filter: String,
    pub language: String,
    pub day_range: u32,
    pub review_type: String,
    pub purchase_type: String,
    pub num_per_page: u32,
    pub cursor: Option<String>,
}

impl Default for ReviewQuery {
    fn default() -> Self {
        Self {
            filter: "recent".to_string(),
            language: "all".to_string(),
            day_range: 0,
            review_type: "all".to_string(),
            purchase_type: "all".to_string(),
            num_per_page: 20,
            cursor: None,
        }
    }
}

impl ReviewQuery {
    pub fn cache_key(&self, app_id: &str) -> String {
        format!(
            "{app_id}|{}|{}|{}|{}|{}|{}|{}",
            self.filter,
            self.language,
            self.day_range,
            self.review_type,
            self.purchase_type,
            self.num_per_page,
            self.cursor.as_deref().unwrap_or("")
        )
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub review_api_base: String,
    pub profile_api_base: String,
    pub api_key: Option<String>,
    pub review_cache_ttl: Duration,
    pub profile_cache_ttl: Duration,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            review_api_base: "https://store.steampowered.com/appreviews".to_string(),
            profile_api_base: "https://api.steampowered.com/ISteamUser/GetPlayerSummaries/v2/"
                .to_string(),
            api_key: None,
            review_cache_ttl: Duration::from_secs(300),
            profile_cache_ttl: Duration::from_secs(1800),
            timeout: Duration::from_secs(5),
            user_agent: None,
        }
    }
}

impl UpstreamConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            review_api_base: std::env::var("REVX_REVIEW_API_BASE")
                .unwrap_or(defaults.review_api_base),
            profile_api_base: std::env::var("REVX_PROFILE_API_BASE")
                .unwrap_or(defaults.profile_api_base),
            api_key: std::env::var("REVX_API_KEY").ok(),
            review_cache_ttl: env_secs("REVX_REVIEW_CACHE_SECS", defaults.review_cache_ttl),
            profile_cache_ttl: env_secs("REVX_PROFILE_CACHE_SECS", defaults.profile_cache_ttl),
            timeout: env_secs("REVX_HTTP_TIMEOUT_SECS", defaults.timeout),
            user_agent: std::env::var("REVX_USER_AGENT").ok(),
        }
    }
}

fn env_secs(var: &str, fallback: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

// Wire shapes stay private to this crate; everything public converts into
// revx-core types.

#[derive(Debug, Deserialize)]
struct ReviewsEnvelope {
    success: i64,
    #[serde(default)]
    query_summary: Option<WireSummary>,
    #[serde(default)]
    reviews: Vec<WireReview>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireSummary {
    #[serde(default)]
    num_reviews: u64,
    #[serde(default)]
    review_score: i64,
    #[serde(default)]
    review_score_desc: String,
    #[serde(default)]
    total_positive: u64,
    #[serde(default)]
    total_negative: u64,
    #[serde(default)]
    total_reviews: u64,
}

#[derive(Debug, Deserialize)]
struct WireReview {
    recommendationid: String,
    author: WireAuthor,
    review: String,
    timestamp_created: i64,
    timestamp_updated: i64,
    voted_up: bool,
    #[serde(default)]
    votes_up: u64,
    #[serde(default)]
    votes_funny: u64,
    #[serde(default)]
    comment_count: u64,
    #[serde(default)]
    steam_purchase: bool,
    #[serde(default)]
    received_for_free: bool,
    #[serde(default)]
    written_during_early_access: bool,
}

#[derive(Debug, Deserialize)]
struct WireAuthor {
    steamid: String,
    #[serde(default)]
    profileurl: Option<String>,
    #[serde(default)]
    personaname: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlayerSummariesEnvelope {
    response: PlayerListResponse,
}

#[derive(Debug, Deserialize)]
struct PlayerListResponse {
    players: Vec<WireProfile>,
}

#[derive(Debug, Deserialize)]
struct WireProfile {
    steamid: String,
    #[serde(default)]
    communityvisibilitystate: u8,
    #[serde(default)]
    profilestate: u8,
    #[serde(default)]
    personaname: String,
    #[serde(default)]
    profileurl: String,
    #[serde(default)]
    avatar: String,
    #[serde(default)]
    avatarmedium: String,
    #[serde(default)]
    avatarfull: String,
    #[serde(default)]
    personastate: u8,
    #[serde(default)]
    realname: Option<String>,
    #[serde(default)]
    timecreated: Option<i64>,
    #[serde(default)]
    loccountrycode: Option<String>,
    #[serde(default)]
    locstatecode: Option<String>,
}

impl From<WireSummary> for ReviewSummary {
    fn from(wire: WireSummary) -> Self {
        Self {
            num_reviews: wire.num_reviews,
            review_score: wire.review_score,
            review_score_desc: wire.review_score_desc,
            total_positive: wire.total_positive,
            total_negative: wire.total_negative,
            total_reviews: wire.total_reviews,
        }
    }
}

fn timestamp_to_utc(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

impl From<WireReview> for ReviewRecord {
    fn from(wire: WireReview) -> Self {
        Self {
            recommendation_id: wire.recommendationid,
            author: ReviewAuthor {
                steam_id: wire.author.steamid,
                profile_url: wire.author.profileurl,
                persona_name: wire.author.personaname,
                avatar: wire.author.avatar,
            },
            body: wire.review,
            created_at: timestamp_to_utc(wire.timestamp_created),
            updated_at: timestamp_to_utc(wire.timestamp_updated),
            voted_up: wire.voted_up,
            votes_up: wire.votes_up,
            votes_funny: wire.votes_funny,
            comment_count: wire.comment_count,
            purchased_on_platform: wire.steam_purchase,
            received_for_free: wire.received_for_free,
            written_during_early_access: wire.written_during_early_access,
        }
    }
}

impl From<WireProfile> for PlayerProfile {
    fn from(wire: WireProfile) -> Self {
        Self {
            steam_id: wire.steamid,
            visibility: wire.communityvisibilitystate,
            profile_state: wire.profilestate,
            persona_name: wire.personaname,
            profile_url: wire.profileurl,
            avatar: wire.avatar,
            avatar_medium: wire.avatarmedium,
            avatar_full: wire.avatarfull,
            persona_state: wire.personastate,
            real_name: wire.realname,
            time_created: wire.timecreated,
            country_code: wire.loccountrycode,
            state_code: wire.locstatecode,
        }
    }
}

fn validate_review_request(app_id: &str, query: &ReviewQuery) -> Result<(), UpstreamError> {
    if app_id.is_empty() || !app_id.chars().all(|c| c.is_ascii_digit()) {
        return Err(UpstreamError::Validation(format!(
            "app id {app_id:?} must be a non-empty numeric identifier"
        )));
    }
    if query.num_per_page == 0 || query.num_per_page > 100 {
        return Err(UpstreamError::Validation(format!(
            "page size {} outside 1..=100",
            query.num_per_page
        )));
    }
    Ok(())
}

fn profile_cache_key(ids: &[String]) -> String {
    let mut sorted: Vec<&str> = ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(",")
}

/// Issues requests to the two upstream JSON APIs and exposes the unified
/// enriched-review-page abstraction. Review and profile results are cached
/// in two independently expirable TTL stores.
pub struct UpstreamClient {
    fetch: Arc<dyn RemoteFetch>,
    config: UpstreamConfig,
    review_cache: TtlCache<ReviewPage>,
    profile_cache: TtlCache<Vec<PlayerProfile>>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> anyhow::Result<Self> {
        let fetch = Arc::new(HttpFetch::new(config.timeout, config.user_agent.as_deref())?);
        Ok(Self::with_fetcher(config, fetch))
    }

    /// Builds a client over an explicit fetch implementation (test seam).
    pub fn with_fetcher(config: UpstreamConfig, fetch: Arc<dyn RemoteFetch>) -> Self {
        let review_cache = TtlCache::new(config.review_cache_ttl);
        let profile_cache = TtlCache::new(config.profile_cache_ttl);
        Self {
            fetch,
            config,
            review_cache,
            profile_cache,
        }
    }

    fn review_url(&self, app_id: &str, query: &ReviewQuery) -> Result<String, UpstreamError> {
        let base = format!(
            "{}/{app_id}",
            self.config.review_api_base.trim_end_matches('/')
        );
        let mut params: Vec<(&str, String)> = vec![
            ("json", "1".to_string()),
            ("filter", query.filter.clone()),
            ("language", query.language.clone()),
            ("day_range", query.day_range.to_string()),
            ("review_type", query.review_type.clone()),
            ("purchase_type", query.purchase_type.clone()),
            ("num_per_page", query.num_per_page.to_string()),
        ];
        if let Some(cursor) = &query.cursor {
            params.push(("cursor", cursor.clone()));
        }
        let url = Url::parse_with_params(&base, params).map_err(|_| {
            UpstreamError::Validation(format!("review api base {base:?} is not a valid URL"))
        })?;
        Ok(url.into())
    }

    fn profile_url(&self, ids: &[String]) -> Result<String, UpstreamError> {
        let params: Vec<(&str, String)> = vec![
            ("key", self.config.api_key.clone().unwrap_or_default()),
            ("steamids", ids.join(",")),
        ];
        let url = Url::parse_with_params(&self.config.profile_api_base, params).map_err(|_| {
            UpstreamError::Validation(format!(
                "profile api base {:?} is not a valid URL",
                self.config.profile_api_base
            ))
        })?;
        Ok(url.into())
    }

    /// One page of reviews for a title. A non-success status flag in the
    /// parsed body is fatal for the call, distinct from transport failure.
    pub async fn get_game_reviews(
        &self,
        app_id: &str,
        query: &ReviewQuery,
    ) -> Result<ReviewPage, UpstreamError> {
        validate_review_request(app_id, query)?;

        let key = query.cache_key(app_id);
        if let Some(page) = self.review_cache.get(&key).await {
            debug!(app_id, "review cache hit");
            return Ok(page);
        }

        let url = self.review_url(app_id, query)?;
        let fetched = self.fetch.get_text(&url).await?;
        let envelope: ReviewsEnvelope =
            serde_json::from_str(&fetched.body).map_err(|source| UpstreamError::Decode {
                url: url.clone(),
                source,
            })?;

        if envelope.success != 1 {
            return Err(UpstreamError::Api {
                url,
                detail: format!("status flag {}", envelope.success),
            });
        }

        let page = ReviewPage {
            summary: envelope.query_summary.map(Into::into).unwrap_or_default(),
            reviews: envelope.reviews.into_iter().map(Into::into).collect(),
            cursor: envelope.cursor.filter(|c| !c.is_empty()),
        };
        self.review_cache.insert(key, page.clone()).await;
        Ok(page)
    }

    /// Batch profile lookup. Empty input short-circuits with no network
    /// call; larger inputs are split into chunks of at most
    /// [`PROFILE_BATCH_CEILING`] ids, one request per chunk. A requested id
    /// absent from the upstream result is not an error.
    pub async fn get_player_profiles(
        &self,
        ids: &[String],
    ) -> Result<Vec<PlayerProfile>, UpstreamError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let key = profile_cache_key(ids);
        if let Some(profiles) = self.profile_cache.get(&key).await {
            debug!(count = ids.len(), "profile cache hit");
            return Ok(profiles);
        }

        let mut profiles = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(PROFILE_BATCH_CEILING) {
            let url = self.profile_url(chunk)?;
            let fetched = self.fetch.get_text(&url).await?;
            let envelope: PlayerSummariesEnvelope = serde_json::from_str(&fetched.body)
                .map_err(|source| UpstreamError::Decode {
                    url: url.clone(),
                    source,
                })?;
            profiles.extend(envelope.response.players.into_iter().map(PlayerProfile::from));
        }

        self.profile_cache.insert(key, profiles.clone()).await;
        Ok(profiles)
    }

    /// Fetches a review page, resolves every distinct author against the
    /// profile API, and substitutes placeholders where no profile matched.
    /// Cursor and summary pass through unchanged.
    pub async fn get_enriched_review_page(
        &self,
        app_id: &str,
        query: &ReviewQuery,
    ) -> Result<EnrichedReviewPage, UpstreamError> {
        let page = self.get_game_reviews(app_id, query).await?;

        let mut seen = HashSet::new();
        let mut author_ids = Vec::new();
        for review in &page.reviews {
            if seen.insert(review.author.steam_id.clone()) {
                author_ids.push(review.author.steam_id.clone());
            }
        }

        let profiles = self.get_player_profiles(&author_ids).await?;
        let lookup: HashMap<&str, &PlayerProfile> = profiles
            .iter()
            .map(|profile| (profile.steam_id.as_str(), profile))
            .collect();

        let reviews = page
            .reviews
            .into_iter()
            .map(|record| {
                let author = match lookup.get(record.author.steam_id.as_str()) {
                    Some(profile) => EnrichedAuthor::from_profile(profile),
                    None => EnrichedAuthor::placeholder(record.author.steam_id.clone()),
                };
                EnrichedReview::from_record(record, author)
            })
            .collect();

        Ok(EnrichedReviewPage {
            summary: page.summary,
            reviews,
            cursor: page.cursor,
        })
    }
}

//! Core domain model for revx: reviews, profiles, feed entries, aggregates.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "revx-core";

/// Display name substituted when no profile record matches an author.
pub const PLACEHOLDER_PERSONA_NAME: &str = "Unknown";
/// Profile URL substituted when no profile record matches an author.
pub const PLACEHOLDER_PROFILE_URL: &str = "#";

/// Author stub attached to a fetched review. Only `steam_id` is guaranteed;
/// the display fields are filled in during enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewAuthor {
    pub steam_id: String,
    pub profile_url: Option<String>,
    pub persona_name: Option<String>,
    pub avatar: Option<String>,
}

impl ReviewAuthor {
    pub fn bare(steam_id: impl Into<String>) -> Self {
        Self {
            steam_id: steam_id.into(),
            profile_url: None,
            persona_name: None,
            avatar: None,
        }
    }
}

/// One review as returned by the review-listing API. Immutable once fetched;
/// `recommendation_id` is globally unique upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub recommendation_id: String,
    pub author: ReviewAuthor,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub voted_up: bool,
    pub votes_up: u64,
    pub votes_funny: u64,
    pub comment_count: u64,
    pub purchased_on_platform: bool,
    pub received_for_free: bool,
    pub written_during_early_access: bool,
}

/// Query summary echoed by the review-listing API alongside each page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReviewSummary {
    pub num_reviews: u64,
    pub review_score: i64,
    pub review_score_desc: String,
    pub total_positive: u64,
    pub total_negative: u64,
    pub total_reviews: u64,
}

/// One page of reviews plus the cursor for the next page. An empty review
/// list or an absent cursor signals end of stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewPage {
    pub summary: ReviewSummary,
    pub reviews: Vec<ReviewRecord>,
    pub cursor: Option<String>,
}

/// Player profile record from the batch lookup API. Transient: only lives
/// long enough to enrich a review page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub steam_id: String,
    pub visibility: u8,
    pub profile_state: u8,
    pub persona_name: String,
    pub profile_url: String,
    pub avatar: String,
    pub avatar_medium: String,
    pub avatar_full: String,
    pub persona_state: u8,
    pub real_name: Option<String>,
    pub time_created: Option<i64>,
    pub country_code: Option<String>,
    pub state_code: Option<String>,
}

/// Author with every display field resolved, either from a matching profile
/// or from the documented placeholders. Never an error state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedAuthor {
    pub steam_id: String,
    pub persona_name: String,
    pub profile_url: String,
    pub avatar: String,
    pub avatar_medium: String,
    pub avatar_full: String,
}

impl EnrichedAuthor {
    pub fn from_profile(profile: &PlayerProfile) -> Self {
        Self {
            steam_id: profile.steam_id.clone(),
            persona_name: profile.persona_name.clone(),
            profile_url: profile.profile_url.clone(),
            avatar: profile.avatar.clone(),
            avatar_medium: profile.avatar_medium.clone(),
            avatar_full: profile.avatar_full.clone(),
        }
    }

    /// Placeholder substitution for an author with no matching profile.
    pub fn placeholder(steam_id: impl Into<String>) -> Self {
        Self {
            steam_id: steam_id.into(),
            persona_name: PLACEHOLDER_PERSONA_NAME.to_string(),
            profile_url: PLACEHOLDER_PROFILE_URL.to_string(),
            avatar: String::new(),
            avatar_medium: String::new(),
            avatar_full: String::new(),
        }
    }
}

/// A `ReviewRecord` whose author stub has been replaced with resolved
/// display fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedReview {
    pub recommendation_id: String,
    pub author: EnrichedAuthor,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub voted_up: bool,
    pub votes_up: u64,
    pub votes_funny: u64,
    pub comment_count: u64,
    pub purchased_on_platform: bool,
    pub received_for_free: bool,
    pub written_during_early_access: bool,
}

impl EnrichedReview {
    pub fn from_record(record: ReviewRecord, author: EnrichedAuthor) -> Self {
        Self {
            recommendation_id: record.recommendation_id,
            author,
            body: record.body,
            created_at: record.created_at,
            updated_at: record.updated_at,
            voted_up: record.voted_up,
            votes_up: record.votes_up,
            votes_funny: record.votes_funny,
            comment_count: record.comment_count,
            purchased_on_platform: record.purchased_on_platform,
            received_for_free: record.received_for_free,
            written_during_early_access: record.written_during_early_access,
        }
    }
}

impl EnrichedReview {
    /// Projects back to a plain record whose author stub carries the
    /// resolved display fields. Aggregation runs seed from this shape, so
    /// an unresolved author surfaces its `"#"` placeholder URL.
    pub fn as_seed_record(&self) -> ReviewRecord {
        ReviewRecord {
            recommendation_id: self.recommendation_id.clone(),
            author: ReviewAuthor {
                steam_id: self.author.steam_id.clone(),
                profile_url: Some(self.author.profile_url.clone()),
                persona_name: Some(self.author.persona_name.clone()),
                avatar: Some(self.author.avatar.clone()),
            },
            body: self.body.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            voted_up: self.voted_up,
            votes_up: self.votes_up,
            votes_funny: self.votes_funny,
            comment_count: self.comment_count,
            purchased_on_platform: self.purchased_on_platform,
            received_for_free: self.received_for_free,
            written_during_early_access: self.written_during_early_access,
        }
    }
}

/// One page of enriched reviews; summary and cursor pass through unchanged
/// from the underlying `ReviewPage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedReviewPage {
    pub summary: ReviewSummary,
    pub reviews: Vec<EnrichedReview>,
    pub cursor: Option<String>,
}

/// A reviewer as seen by the aggregation engine. Keyed strictly by `id`;
/// when the same id appears on multiple seed reviews the first-seen stub
/// wins and later duplicates are discarded, not merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerIdentity {
    pub id: String,
    pub profile_url: Option<String>,
    pub persona_name: Option<String>,
    pub avatar: Option<String>,
}

impl ReviewerIdentity {
    pub fn from_author(author: &ReviewAuthor) -> Self {
        Self {
            id: author.steam_id.clone(),
            profile_url: author.profile_url.clone(),
            persona_name: author.persona_name.clone(),
            avatar: author.avatar.clone(),
        }
    }

    /// False for a missing, empty, or placeholder (`"#"`) profile URL.
    pub fn has_usable_profile_url(&self) -> bool {
        match self.profile_url.as_deref() {
            Some(url) => !url.is_empty() && url != PLACEHOLDER_PROFILE_URL,
            None => false,
        }
    }
}

/// One review scraped from a reviewer's own public feed page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub app_id: String,
    pub title: Option<String>,
    pub cover_url: Option<String>,
    pub recommended: bool,
    pub hours_on_record: Option<f64>,
    pub hours_at_review: Option<f64>,
    pub body: String,
    /// Locale-formatted date text exactly as displayed on the page.
    pub posted_display: String,
    /// Best-effort normalization of `posted_display`; `None` when the
    /// display form does not carry enough information to normalize.
    pub posted_at: Option<NaiveDate>,
    pub permalink: Option<String>,
}

/// Pagination control state of a feed page. A single-page feed with no
/// paging markup reads as page 1 of 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPagination {
    pub current_page: u32,
    pub total_pages: u32,
}

impl Default for FeedPagination {
    fn default() -> Self {
        Self {
            current_page: 1,
            total_pages: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedPage {
    pub entries: Vec<FeedEntry>,
    pub pagination: FeedPagination,
}

/// Per-reviewer aggregation outcome. Written only by the one task that owns
/// this reviewer; read-only once that task terminates, whether by success
/// or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerAggregate {
    pub identity: ReviewerIdentity,
    /// Positive feed entries keyed by target title id; a reviewer's repeat
    /// appearances for the same title collapse to one, last write wins.
    pub reviews: BTreeMap<String, FeedEntry>,
    /// Page count discovered from the reviewer's own pagination. Set only
    /// when retrieval completed without error.
    pub total_pages: Option<u32>,
    pub error: Option<String>,
}

impl ReviewerAggregate {
    pub fn new(identity: ReviewerIdentity) -> Self {
        Self {
            identity,
            reviews: BTreeMap::new(),
            total_pages: None,
            error: None,
        }
    }
}

/// Result of one aggregation run. Key order reflects task completion order
/// and carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub reviewers: HashMap<String, ReviewerAggregate>,
}

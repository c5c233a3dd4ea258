//! Markup extractor for reviewer feed pages.
//!
//! The upstream feed page is an unversioned, semi-structured external
//! format. Every markup-specific selector lives here so upstream markup
//! changes never reach the aggregation engine.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

use revx_core::{FeedEntry, FeedPage, FeedPagination};

pub const CRATE_NAME: &str = "revx-feed";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid selector: {0}")]
    Selector(String),
}

fn sel(selector: &str) -> Result<Selector, FeedError> {
    Selector::parse(selector).map_err(|e| FeedError::Selector(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(scope: ElementRef<'_>, selector: &str) -> Result<Option<String>, FeedError> {
    let sel = sel(selector)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(
    scope: ElementRef<'_>,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, FeedError> {
    let sel = sel(selector)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

// Both hour figures come from one display phrase; the second figure is
// absent on reviews written at full playtime.
const HOURS_PATTERN: &str = r"(?P<total>\d[\d,.]*)\s*(?:hrs on record|小时)(?:\s*[（(]\s*(?:评测时\s*)?(?P<at>\d[\d,.]*)\s*(?:hrs at review time|小时)\s*[）)])?";

fn hours_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(HOURS_PATTERN).expect("hours pattern compiles"))
}

fn parse_decimal(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse::<f64>().ok()
}

/// Extracts (total hours, hours at review time) from the display phrase.
/// Both are `None` when the phrase does not match.
pub fn parse_hours(text: &str) -> (Option<f64>, Option<f64>) {
    match hours_regex().captures(text) {
        Some(caps) => {
            let total = caps.name("total").and_then(|m| parse_decimal(m.as_str()));
            let at_review = caps.name("at").and_then(|m| parse_decimal(m.as_str()));
            (total, at_review)
        }
        None => (None, None),
    }
}

/// Best-effort normalization of the posted-date display text. Forms without
/// a year do not guess one; they normalize to `None`.
pub fn parse_posted_date(display: &str) -> Option<NaiveDate> {
    let cleaned = display
        .trim()
        .trim_start_matches("Posted")
        .trim()
        .trim_end_matches('.')
        .trim();
    for format in ["%d %B, %Y", "%B %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(cleaned, format) {
            return Some(date);
        }
    }
    None
}

fn app_id_from_href(href: &str) -> Option<String> {
    let segment = href
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))?;
    Some(segment.to_string())
}

fn has_thumbs_up(block: ElementRef<'_>) -> Result<bool, FeedError> {
    let img = sel("img")?;
    Ok(block.select(&img).any(|node| {
        node.value()
            .attr("src")
            .is_some_and(|src| src.contains("icon_thumbsUp"))
    }))
}

fn page_query_param(href: &str) -> Option<u32> {
    let query = href.split_once('?')?.1;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("p="))
        .and_then(|v| v.parse().ok())
}

fn parse_entry(block: ElementRef<'_>) -> Result<FeedEntry, FeedError> {
    let capsule_href = select_first_attr(block, "div.leftcol a", "href")?;
    let app_id = capsule_href
        .as_deref()
        .and_then(app_id_from_href)
        .unwrap_or_default();

    let hours_text = select_first_text(block, "div.hours")?;
    let (hours_on_record, hours_at_review) = hours_text
        .as_deref()
        .map(parse_hours)
        .unwrap_or((None, None));

    let posted_display = select_first_text(block, "div.posted")?.unwrap_or_default();
    let posted_at = parse_posted_date(&posted_display);

    Ok(FeedEntry {
        app_id,
        title: select_first_attr(block, "div.leftcol img", "alt")?,
        cover_url: select_first_attr(block, "div.leftcol img", "src")?,
        recommended: has_thumbs_up(block)?,
        hours_on_record,
        hours_at_review,
        body: select_first_text(block, "div.content")?.unwrap_or_default(),
        posted_display,
        posted_at,
        permalink: select_first_attr(block, "div.vote_header a", "href")?,
    })
}

fn parse_pagination(doc: &Html) -> Result<FeedPagination, FeedError> {
    let container_sel = sel("div.workshopBrowsePagingControls")?;
    let Some(container) = doc.select(&container_sel).next() else {
        return Ok(FeedPagination::default());
    };

    // The current page is the bare number between the paging buttons; the
    // page links only cover the other pages.
    let mut current_page = 1;
    for child in container.children() {
        if let Some(text) = child.value().as_text() {
            if let Some(page) = text
                .trim()
                .split_whitespace()
                .next()
                .and_then(|t| t.parse::<u32>().ok())
            {
                current_page = page;
                break;
            }
        }
    }

    let link_sel = sel("a.pagelink")?;
    let total_pages = container
        .select(&link_sel)
        .last()
        .and_then(|link| link.value().attr("href"))
        .and_then(page_query_param)
        .unwrap_or(1);

    Ok(FeedPagination {
        current_page,
        total_pages: total_pages.max(current_page),
    })
}

/// Parses one page of a reviewer's public feed into structured entries plus
/// pagination metadata. Each review block is scanned independently; a
/// malformed or missing optional sub-field yields `None` for that field,
/// never an error.
pub fn parse_feed_page(html: &str) -> Result<FeedPage, FeedError> {
    let doc = Html::parse_document(html);
    let block_sel = sel("div.review_box")?;

    let mut entries = Vec::new();
    for block in doc.select(&block_sel) {
        entries.push(parse_entry(block)?);
    }

    let pagination = parse_pagination(&doc)?;
    Ok(FeedPage { entries, pagination })
}

use anyhow::Result;
use feed_rs::model::Entry;
use feed_rs::parser;
use sha2::{Digest, Sha256};

use super::{Candidate, ExtractError};
use crate::storage::Item;

/// Result of parsing one account's feed.
#[derive(Debug)]
pub struct ParsedFeed {
    /// Feed-level icon or logo, used as the account's avatar
    pub icon_url: Option<String>,
    /// Entries in newest-first order
    pub entries: Vec<Candidate>,
}

/// Parse RSS, Atom or JSON Feed bytes.
///
/// Fails only when the document as a whole is unreadable. Individual entries
/// that carry nothing stable to identify them become `Err(ExtractError)` in
/// `entries` instead of failing the parse.
///
/// Entries are returned newest first. When every entry carries a date they
/// are sorted by it; otherwise document order is kept, which for RSS and Atom
/// is newest first by convention.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed> {
    // feed-rs fills missing ids with a random UUID; leave them empty so
    // `generate_id` derives one that survives a re-fetch
    let feed = parser::Builder::new()
        .id_generator(|_, _, _| String::new())
        .build()
        .parse(bytes)?;

    let icon_url = feed
        .icon
        .map(|i| i.uri)
        .or_else(|| feed.logo.map(|l| l.uri))
        .filter(|u| !u.trim().is_empty());

    let mut entries: Vec<Candidate> = feed
        .entries
        .into_iter()
        .enumerate()
        .map(|(position, entry)| extract_item(position, entry))
        .collect();

    let all_dated = entries
        .iter()
        .all(|c| matches!(c, Ok(item) if item.published_at.is_some()));
    if all_dated {
        entries.sort_by_key(|c| {
            std::cmp::Reverse(c.as_ref().ok().and_then(|item| item.published_at))
        });
    }

    Ok(ParsedFeed { icon_url, entries })
}

fn extract_item(position: usize, entry: Entry) -> Candidate {
    let url = entry
        .links
        .first()
        .map(|l| l.href.trim().to_string())
        .filter(|h| !h.is_empty());
    let published_at = entry.published.or(entry.updated).map(|dt| dt.timestamp());
    let description = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .filter(|d| !d.trim().is_empty());
    let title = entry
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty());
    let image_url = entry.media.iter().find_map(|m| {
        m.content
            .iter()
            .find_map(|c| c.url.as_ref().map(|u| u.to_string()))
            .or_else(|| m.thumbnails.first().map(|t| t.image.uri.clone()))
    });

    if url.is_none() && title.is_none() && entry.id.trim().is_empty() {
        return Err(ExtractError {
            position,
            reason: "entry has no id, link or title".to_string(),
        });
    }

    let existing_id = if entry.id.trim().is_empty() {
        None
    } else {
        Some(entry.id.as_str())
    };
    let external_id = generate_id(existing_id, url.as_deref(), title.as_deref(), published_at);

    Ok(Item {
        external_id,
        title: title.unwrap_or_else(|| "Untitled".to_string()),
        description,
        url,
        image_url,
        published_at,
    })
}

/// Prefer the entry's own id, then its link, then a hash of what is left.
fn generate_id(
    existing: Option<&str>,
    url: Option<&str>,
    title: Option<&str>,
    published: Option<i64>,
) -> String {
    if let Some(id) = existing {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    if let Some(url) = url {
        return url.to_string();
    }

    let input = format!(
        "{}|{}",
        title.unwrap_or(""),
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

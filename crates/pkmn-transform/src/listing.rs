use pkmn_core::{EntityKind, WorkItem};
use serde::Deserialize;

use crate::{id_from_resource_url, MalformedRecordError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub count: Option<u64>,
    /// Opaque cursor for the following page, exactly as the upstream returned it.
    pub next: Option<String>,
    pub entries: Vec<ListingEntry>,
}

impl ListingPage {
    pub fn work_items(&self, kind: EntityKind) -> Vec<WorkItem> {
        self.entries
            .iter()
            .map(|entry| WorkItem::entity(kind, entry.id))
            .collect()
    }
}

#[derive(Deserialize)]
struct RawListing {
    count: Option<u64>,
    next: Option<String>,
    results: Option<Vec<RawListingEntry>>,
}

#[derive(Deserialize)]
struct RawListingEntry {
    name: Option<String>,
    url: Option<String>,
}

pub fn parse_listing_page(body: &[u8]) -> Result<ListingPage, MalformedRecordError> {
    let raw: RawListing = serde_json::from_slice(body)?;
    let results = raw
        .results
        .ok_or_else(|| MalformedRecordError::MissingField("results".into()))?;

    let mut entries = Vec::with_capacity(results.len());
    for entry in results {
        let url = entry
            .url
            .ok_or_else(|| MalformedRecordError::MissingField("results[].url".into()))?;
        let id = id_from_resource_url(&url)?;
        entries.push(ListingEntry {
            name: entry.name.unwrap_or_default(),
            id,
        });
    }

    Ok(ListingPage {
        count: raw.count,
        next: raw.next.filter(|n| !n.trim().is_empty()),
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries_and_the_next_cursor() {
        let page = parse_listing_page(include_bytes!(
            "../../../fixtures/pokeapi/listing-type-page1.json"
        ))
        .expect("valid page");

        assert_eq!(page.count, Some(3));
        assert_eq!(
            page.next.as_deref(),
            Some("https://pokeapi.co/api/v2/type?offset=2&limit=2")
        );
        assert_eq!(
            page.entries,
            vec![
                ListingEntry {
                    name: "normal".into(),
                    id: 1
                },
                ListingEntry {
                    name: "fighting".into(),
                    id: 2
                },
            ]
        );
        let items = page.work_items(EntityKind::Type);
        assert_eq!(items[1].request_path(), "type/2");
    }

    #[test]
    fn last_page_has_no_cursor() {
        let page = parse_listing_page(br#"{"count":1,"next":null,"results":[{"name":"x","url":"/api/v2/type/3/"}]}"#)
            .expect("valid page");
        assert_eq!(page.next, None);
        assert_eq!(page.entries.len(), 1);
    }

    #[test]
    fn rejects_pages_without_results_or_with_bad_urls() {
        assert_eq!(
            parse_listing_page(br#"{"count":0}"#),
            Err(MalformedRecordError::MissingField("results".into()))
        );
        assert!(matches!(
            parse_listing_page(br#"{"results":[{"name":"x","url":"https://pokeapi.co/api/v2/type/abc/"}]}"#),
            Err(MalformedRecordError::BadResourceUrl { .. })
        ));
        assert!(matches!(
            parse_listing_page(b"<html>"),
            Err(MalformedRecordError::InvalidJson(_))
        ));
    }
}

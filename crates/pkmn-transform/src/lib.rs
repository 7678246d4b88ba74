//! Pure transformations from upstream payloads to the normalized catalog.
//!
//! Nothing here touches the network, the cache or storage: every function maps bytes
//! or entities to values and can be called from any thread.

mod aggregate;
mod listing;
mod normalize;

use pkmn_core::EntityKey;
use thiserror::Error;

pub use aggregate::{derive_aggregates, effectiveness_matrix, EffectivenessMatrix};
pub use listing::{parse_listing_page, ListingEntry, ListingPage};
pub use normalize::{normalize, PREFERRED_VERSION_GROUPS};

pub const CRATE_NAME: &str = "pkmn-transform";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecordError {
    #[error("payload is not a valid record: {0}")]
    InvalidJson(String),
    #[error("missing required field `{0}`")]
    MissingField(String),
    #[error("field `{field}` out of range: {value}")]
    OutOfRange { field: String, value: i64 },
    #[error("resource url `{url}` does not end in a positive id")]
    BadResourceUrl { url: String },
    #[error("record identifies as {found}, requested {expected}")]
    IdentityMismatch { expected: EntityKey, found: EntityKey },
    #[error("work item {0} does not address a catalog entity")]
    NotAnEntity(String),
}

impl From<serde_json::Error> for MalformedRecordError {
    fn from(err: serde_json::Error) -> Self {
        MalformedRecordError::InvalidJson(err.to_string())
    }
}

/// Trailing numeric segment of an upstream resource URL (`.../type/10/` -> 10).
pub fn id_from_resource_url(url: &str) -> Result<u32, MalformedRecordError> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|segment| segment.parse::<u32>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| MalformedRecordError::BadResourceUrl {
            url: url.to_string(),
        })
}

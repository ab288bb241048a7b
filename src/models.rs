use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A listing as it comes off a search-results page, before any
/// normalization. Field contents are whatever the markup carried.
#[derive(Debug, Clone, PartialEq)]
pub struct RawListing {
    pub title: String,
    pub price_text: String,
    pub location_text: String,
    /// Absolute detail URL.
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    /// Stable key derived from the detail URL. Unique across the store.
    pub identity: String,
    pub title: String,
    /// Absent when the ad is "price on request" or the text was ambiguous.
    pub price: Option<f64>,
    pub postal_code: String,
    pub city: String,
    pub url: String,
    /// Absent until geocoded. Once set, never cleared by later upserts.
    pub coordinates: Option<Coordinates>,
    pub scraped_at: DateTime<Utc>,
}

/// What an upsert did to the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "completed" => RunStatus::Completed,
            "partial" => RunStatus::Partial,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }
}

/// One keyword-scoped execution of the pipeline, with its audit counters.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: Uuid,
    pub keyword: String,
    pub max_pages: u32,
    pub pages_fetched: u32,
    pub found: u32,
    pub new: u32,
    pub duplicate: u32,
    pub geocode_failed: u32,
    pub fetch_failed: u32,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn start(keyword: &str, max_pages: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            keyword: keyword.to_string(),
            max_pages,
            pages_fetched: 0,
            found: 0,
            new: 0,
            duplicate: 0,
            geocode_failed: 0,
            fetch_failed: 0,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("GET {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("GET {url} failed after {attempts} attempts: {reason}")]
    Exhausted {
        url: String,
        attempts: u32,
        reason: String,
    },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GeocodeError {
    #[error("empty or malformed location text")]
    InvalidInput,
    #[error("no match for location '{query}'")]
    NotFound { query: String },
    #[error("geocoding lookup failed: {reason}")]
    Lookup { reason: String },
}

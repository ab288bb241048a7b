use crate::database::Database;
use crate::extractor;
use crate::fetcher::PageFetcher;
use crate::geocoder::Geocoder;
use crate::models::{Listing, RawListing, Run, RunStatus};
use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Cooperative cancellation: checked before each page fetch, so a
/// cancelled run drains cleanly instead of stopping mid-write.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Builds the search-results URL for one keyword page.
pub fn search_url(base_url: &str, keyword: &str, page: u32) -> String {
    format!(
        "{}/s-seite:{}/{}/k0",
        base_url.trim_end_matches('/'),
        page,
        urlencoding::encode(keyword)
    )
}

/// Drives one end-to-end run for a keyword: fetch pages, extract
/// listings, deduplicate, geocode, persist. Holds no state beyond the
/// current run's progress; the shared pieces (rate limiters, geocode
/// cache, store) come in as handles.
pub struct Orchestrator {
    fetcher: Arc<dyn PageFetcher>,
    geocoder: Geocoder,
    db: Arc<Mutex<Database>>,
    base_url: String,
    fail_threshold: u32,
    cancel: CancelHandle,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        geocoder: Geocoder,
        db: Arc<Mutex<Database>>,
        base_url: &str,
        fail_threshold: u32,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            fetcher,
            geocoder,
            db,
            base_url: base_url.trim_end_matches('/').to_string(),
            fail_threshold: fail_threshold.max(1),
            cancel,
        }
    }

    pub async fn run(&self, keyword: &str, max_pages: u32) -> Result<Run> {
        let mut run = Run::start(keyword, max_pages);
        self.db.lock().await.insert_run(&run)?;
        tracing::info!(keyword, max_pages, run_id = %run.id, "starting run");

        let mut consecutive_failures = 0u32;
        let mut aborted = false;
        let mut cancelled = false;

        for page in 1..=max_pages {
            if self.cancel.is_cancelled() {
                tracing::info!(page, "run cancelled, draining");
                cancelled = true;
                break;
            }

            let url = search_url(&self.base_url, keyword, page);
            let fetched = match self.fetcher.fetch(&url).await {
                Ok(fetched) => {
                    consecutive_failures = 0;
                    fetched
                }
                Err(e) => {
                    run.fetch_failed += 1;
                    consecutive_failures += 1;
                    tracing::warn!(page, error = %e, "page fetch failed, continuing");
                    if consecutive_failures >= self.fail_threshold {
                        tracing::error!(
                            page,
                            consecutive_failures,
                            "consecutive fetch failures reached threshold, aborting run"
                        );
                        aborted = true;
                        break;
                    }
                    continue;
                }
            };

            run.pages_fetched += 1;

            // The site redirects out-of-range page numbers; that marks
            // the end of results just like an empty page does.
            if fetched.was_redirected() {
                tracing::debug!(page, final_url = %fetched.final_url, "redirected, end of results");
                break;
            }

            let raw_listings = extractor::extract(&fetched.body, &self.base_url);
            if raw_listings.is_empty() {
                tracing::debug!(page, "no listings on page, end of results");
                break;
            }
            tracing::info!(page, count = raw_listings.len(), "processing page");

            for raw in &raw_listings {
                self.process_listing(&mut run, keyword, raw).await?;
            }
            self.db.lock().await.update_run(&run)?;
        }

        run.status = if aborted {
            RunStatus::Failed
        } else if cancelled || run.fetch_failed > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };
        run.finished_at = Some(Utc::now());
        self.db.lock().await.update_run(&run)?;

        tracing::info!(
            run_id = %run.id,
            status = run.status.as_str(),
            pages = run.pages_fetched,
            found = run.found,
            new = run.new,
            duplicate = run.duplicate,
            geocode_failed = run.geocode_failed,
            fetch_failed = run.fetch_failed,
            "run finished"
        );
        Ok(run)
    }

    async fn process_listing(&self, run: &mut Run, keyword: &str, raw: &RawListing) -> Result<()> {
        run.found += 1;

        let identity = extractor::identity_from_url(&raw.url);
        let (postal_code, city) = extractor::split_location(&raw.location_text);
        let price = extractor::parse_price(&raw.price_text);

        let (is_new, coordinates_missing) = {
            let db = self.db.lock().await;
            if db.listing_exists(&identity)? {
                let missing = db
                    .get_listing(&identity)?
                    .is_none_or(|stored| stored.coordinates.is_none());
                (false, missing)
            } else {
                (true, true)
            }
        };
        if is_new {
            run.new += 1;
        } else {
            run.duplicate += 1;
        }

        // Duplicates are geocoded only to backfill: the stored row has no
        // coordinates and this observation carries location text.
        let attempt_geocode = is_new
            || (coordinates_missing
                && !(postal_code.trim().is_empty() && city.trim().is_empty()));

        let coordinates = if attempt_geocode {
            match self.geocoder.geocode(&postal_code, &city).await {
                Ok(coords) => Some(coords),
                Err(e) => {
                    run.geocode_failed += 1;
                    tracing::debug!(identity = %identity, error = %e, "geocoding failed, persisting without coordinates");
                    None
                }
            }
        } else {
            None
        };

        let listing = Listing {
            identity: identity.clone(),
            title: raw.title.trim().to_string(),
            price,
            postal_code,
            city,
            url: raw.url.clone(),
            coordinates,
            scraped_at: Utc::now(),
        };

        let mut db = self.db.lock().await;
        let outcome = db.upsert_listing(&listing)?;
        db.associate_keyword(&identity, keyword)?;
        drop(db);

        tracing::trace!(identity = %identity, new = is_new, ?outcome, "listing persisted");
        Ok(())
    }
}

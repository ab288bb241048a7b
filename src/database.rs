use crate::models::{Coordinates, Listing, Run, RunStatus, UpsertOutcome};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

/// Filters for the query surface consumed by the map/export layers.
#[derive(Debug, Default, Clone)]
pub struct ListingFilter {
    pub keyword: Option<String>,
    pub city: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Database { conn };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS listings (
                identity TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                price REAL,
                postal_code TEXT NOT NULL,
                city TEXT NOT NULL,
                url TEXT NOT NULL,
                latitude REAL,
                longitude REAL,
                scraped_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS listing_keywords (
                identity TEXT NOT NULL,
                keyword TEXT NOT NULL,
                PRIMARY KEY (identity, keyword)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                keyword TEXT NOT NULL,
                max_pages INTEGER NOT NULL,
                pages_fetched INTEGER NOT NULL,
                found INTEGER NOT NULL,
                new_count INTEGER NOT NULL,
                duplicate_count INTEGER NOT NULL,
                geocode_failed INTEGER NOT NULL,
                fetch_failed INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS geocode_cache (
                postal_code TEXT NOT NULL,
                city TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                resolved_at TEXT NOT NULL,
                PRIMARY KEY (postal_code, city)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_listings_city ON listings(city)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_keywords_keyword ON listing_keywords(keyword)",
            [],
        )?;

        Ok(())
    }

    /// Insert-or-update keyed by identity. Runs in one IMMEDIATE
    /// transaction so concurrent runs observing the same ad cannot race
    /// into duplicate rows. Coordinates are merged with COALESCE, so a
    /// value once set is never cleared; `scraped_at` is refreshed only
    /// when the price changed.
    pub fn upsert_listing(&mut self, listing: &Listing) -> Result<UpsertOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existed: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM listings WHERE identity = ?1)",
            params![listing.identity],
            |row| row.get(0),
        )?;

        let (latitude, longitude) = match listing.coordinates {
            Some(c) => (Some(c.latitude), Some(c.longitude)),
            None => (None, None),
        };

        let changed = tx.execute(
            "INSERT INTO listings (
                identity, title, price, postal_code, city, url,
                latitude, longitude, scraped_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(identity) DO UPDATE SET
                price = excluded.price,
                latitude = COALESCE(listings.latitude, excluded.latitude),
                longitude = COALESCE(listings.longitude, excluded.longitude),
                scraped_at = CASE
                    WHEN listings.price IS NOT excluded.price THEN excluded.scraped_at
                    ELSE listings.scraped_at
                END
            WHERE listings.price IS NOT excluded.price
               OR (listings.latitude IS NULL AND excluded.latitude IS NOT NULL)",
            params![
                listing.identity,
                listing.title,
                listing.price,
                listing.postal_code,
                listing.city,
                listing.url,
                latitude,
                longitude,
                listing.scraped_at,
            ],
        )?;

        tx.commit()?;

        Ok(match (existed, changed) {
            (false, _) => UpsertOutcome::Created,
            (true, 0) => UpsertOutcome::Unchanged,
            (true, _) => UpsertOutcome::Updated,
        })
    }

    pub fn listing_exists(&self, identity: &str) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM listings WHERE identity = ?1)",
            params![identity],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn get_listing(&self, identity: &str) -> Result<Option<Listing>> {
        let listing = self
            .conn
            .query_row(
                "SELECT identity, title, price, postal_code, city, url,
                        latitude, longitude, scraped_at
                 FROM listings WHERE identity = ?1",
                params![identity],
                Self::row_to_listing,
            )
            .optional()?;
        Ok(listing)
    }

    /// Records that a keyword matched this identity. A listing can be
    /// associated with any number of keywords across runs.
    pub fn associate_keyword(&self, identity: &str, keyword: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO listing_keywords (identity, keyword) VALUES (?1, ?2)",
            params![identity, keyword],
        )?;
        Ok(())
    }

    pub fn query_listings(&self, filter: &ListingFilter) -> Result<Vec<Listing>> {
        let mut sql = String::from(
            "SELECT identity, title, price, postal_code, city, url,
                    latitude, longitude, scraped_at
             FROM listings WHERE 1=1",
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(keyword) = &filter.keyword {
            sql.push_str(
                " AND EXISTS(SELECT 1 FROM listing_keywords lk
                     WHERE lk.identity = listings.identity AND lk.keyword = ?)",
            );
            values.push(Value::Text(keyword.clone()));
        }
        if let Some(city) = &filter.city {
            sql.push_str(" AND LOWER(city) = LOWER(?)");
            values.push(Value::Text(city.clone()));
        }
        if let Some(min_price) = filter.min_price {
            sql.push_str(" AND price IS NOT NULL AND price >= ?");
            values.push(Value::Real(min_price));
        }
        if let Some(max_price) = filter.max_price {
            sql.push_str(" AND price IS NOT NULL AND price <= ?");
            values.push(Value::Real(max_price));
        }
        sql.push_str(" ORDER BY scraped_at DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let listings = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_listing)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(listings)
    }

    fn row_to_listing(row: &rusqlite::Row<'_>) -> rusqlite::Result<Listing> {
        let latitude: Option<f64> = row.get(6)?;
        let longitude: Option<f64> = row.get(7)?;
        let coordinates = match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates {
                latitude,
                longitude,
            }),
            _ => None,
        };
        Ok(Listing {
            identity: row.get(0)?,
            title: row.get(1)?,
            price: row.get(2)?,
            postal_code: row.get(3)?,
            city: row.get(4)?,
            url: row.get(5)?,
            coordinates,
            scraped_at: row.get(8)?,
        })
    }

    pub fn insert_run(&self, run: &Run) -> Result<()> {
        self.conn.execute(
            "INSERT INTO runs (
                id, keyword, max_pages, pages_fetched, found, new_count,
                duplicate_count, geocode_failed, fetch_failed, status,
                started_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run.id.to_string(),
                run.keyword,
                run.max_pages,
                run.pages_fetched,
                run.found,
                run.new,
                run.duplicate,
                run.geocode_failed,
                run.fetch_failed,
                run.status.as_str(),
                run.started_at,
                run.finished_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_run(&self, run: &Run) -> Result<()> {
        self.conn.execute(
            "UPDATE runs SET
                pages_fetched = ?2, found = ?3, new_count = ?4,
                duplicate_count = ?5, geocode_failed = ?6, fetch_failed = ?7,
                status = ?8, finished_at = ?9
             WHERE id = ?1",
            params![
                run.id.to_string(),
                run.pages_fetched,
                run.found,
                run.new,
                run.duplicate,
                run.geocode_failed,
                run.fetch_failed,
                run.status.as_str(),
                run.finished_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, id: &Uuid) -> Result<Option<Run>> {
        let run = self
            .conn
            .query_row(
                "SELECT id, keyword, max_pages, pages_fetched, found, new_count,
                        duplicate_count, geocode_failed, fetch_failed, status,
                        started_at, finished_at
                 FROM runs WHERE id = ?1",
                params![id.to_string()],
                Self::row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    pub fn recent_runs(&self, limit: u32) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, keyword, max_pages, pages_fetched, found, new_count,
                    duplicate_count, geocode_failed, fetch_failed, status,
                    started_at, finished_at
             FROM runs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map(params![limit], Self::row_to_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
        let id: String = row.get(0)?;
        let status: String = row.get(9)?;
        Ok(Run {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            keyword: row.get(1)?,
            max_pages: row.get(2)?,
            pages_fetched: row.get(3)?,
            found: row.get(4)?,
            new: row.get(5)?,
            duplicate: row.get(6)?,
            geocode_failed: row.get(7)?,
            fetch_failed: row.get(8)?,
            status: RunStatus::from_str(&status),
            started_at: row.get(10)?,
            finished_at: row.get(11)?,
        })
    }

    /// Geocode cache lookup. Keys are normalized by the geocoder before
    /// they reach the store.
    pub fn cached_coordinates(
        &self,
        postal_code: &str,
        city: &str,
    ) -> Result<Option<Coordinates>> {
        let coords = self
            .conn
            .query_row(
                "SELECT latitude, longitude FROM geocode_cache
                 WHERE postal_code = ?1 AND city = ?2",
                params![postal_code, city],
                |row| {
                    Ok(Coordinates {
                        latitude: row.get(0)?,
                        longitude: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(coords)
    }

    pub fn cache_coordinates(
        &self,
        postal_code: &str,
        city: &str,
        coordinates: Coordinates,
    ) -> Result<()> {
        let resolved_at: DateTime<Utc> = Utc::now();
        self.conn.execute(
            "INSERT OR REPLACE INTO geocode_cache
                (postal_code, city, latitude, longitude, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                postal_code,
                city,
                coordinates.latitude,
                coordinates.longitude,
                resolved_at,
            ],
        )?;
        Ok(())
    }
}

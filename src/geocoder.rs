use crate::database::Database;
use crate::fetcher::RateLimiter;
use crate::models::{Coordinates, GeocodeError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Nominatim search result. Coordinates come back as strings.
#[derive(Debug, Deserialize)]
struct NominatimResponse {
    lat: String,
    lon: String,
}

/// The external lookup seam, so tests can script resolutions and count
/// calls.
#[async_trait]
pub trait GeocodeBackend: Send + Sync {
    async fn lookup(&self, postal_code: &str, city: &str) -> Result<Coordinates, GeocodeError>;
}

/// Nominatim-style lookup over HTTP, rate-limited with its own limiter
/// because the geocoding service enforces quotas independently of the
/// classifieds site.
pub struct NominatimBackend {
    client: reqwest::Client,
    endpoint: String,
    user_agent: String,
    limiter: Arc<RateLimiter>,
}

impl NominatimBackend {
    pub fn new(endpoint: &str, user_agent: &str, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            user_agent: user_agent.to_string(),
            limiter,
        }
    }
}

#[async_trait]
impl GeocodeBackend for NominatimBackend {
    async fn lookup(&self, postal_code: &str, city: &str) -> Result<Coordinates, GeocodeError> {
        let query = [postal_code, city, "Germany"]
            .iter()
            .filter(|part| !part.trim().is_empty())
            .map(|part| part.trim())
            .collect::<Vec<_>>()
            .join(", ");
        let url = format!(
            "{}?q={}&format=json&limit=1",
            self.endpoint,
            urlencoding::encode(&query)
        );

        self.limiter.wait().await;
        tracing::debug!(%query, "geocoding location");

        let results: Vec<NominatimResponse> = self
            .client
            .get(&url)
            .header("User-Agent", &self.user_agent)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| GeocodeError::Lookup {
                reason: e.to_string(),
            })?
            .json()
            .await
            .map_err(|e| GeocodeError::Lookup {
                reason: format!("parsing response: {}", e),
            })?;

        let first = results
            .first()
            .ok_or_else(|| GeocodeError::NotFound { query: query.clone() })?;

        let latitude: f64 = first.lat.parse().map_err(|_| GeocodeError::Lookup {
            reason: format!("invalid latitude '{}'", first.lat),
        })?;
        let longitude: f64 = first.lon.parse().map_err(|_| GeocodeError::Lookup {
            reason: format!("invalid longitude '{}'", first.lon),
        })?;

        Ok(Coordinates {
            latitude,
            longitude,
        })
    }
}

/// Resolves (postal code, city) pairs to coordinates. Lookup order:
/// process-local map, then the store's geocode_cache table, then the
/// backend. Successful resolutions are written through to both caches so
/// a known location costs at most one external lookup across all runs.
pub struct Geocoder {
    backend: Box<dyn GeocodeBackend>,
    memory: Mutex<HashMap<(String, String), Coordinates>>,
    db: Arc<Mutex<Database>>,
}

impl Geocoder {
    pub fn new(backend: Box<dyn GeocodeBackend>, db: Arc<Mutex<Database>>) -> Self {
        Self {
            backend,
            memory: Mutex::new(HashMap::new()),
            db,
        }
    }

    fn normalize(postal_code: &str, city: &str) -> (String, String) {
        (
            postal_code.trim().to_lowercase(),
            city.trim().to_lowercase(),
        )
    }

    pub async fn geocode(
        &self,
        postal_code: &str,
        city: &str,
    ) -> Result<Coordinates, GeocodeError> {
        let key = Self::normalize(postal_code, city);
        if key.0.is_empty() && key.1.is_empty() {
            return Err(GeocodeError::InvalidInput);
        }

        if let Some(hit) = self.memory.lock().await.get(&key) {
            return Ok(*hit);
        }

        {
            let db = self.db.lock().await;
            match db.cached_coordinates(&key.0, &key.1) {
                Ok(Some(hit)) => {
                    drop(db);
                    self.memory.lock().await.insert(key, hit);
                    return Ok(hit);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("geocode cache read failed: {}", e);
                }
            }
        }

        let coordinates = self.backend.lookup(postal_code.trim(), city.trim()).await?;

        {
            let db = self.db.lock().await;
            if let Err(e) = db.cache_coordinates(&key.0, &key.1, coordinates) {
                tracing::warn!("geocode cache write failed: {}", e);
            }
        }
        self.memory.lock().await.insert(key, coordinates);

        Ok(coordinates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct ScriptedBackend {
        coordinates: Result<Coordinates, GeocodeError>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn resolving(latitude: f64, longitude: f64) -> Self {
            Self {
                coordinates: Ok(Coordinates {
                    latitude,
                    longitude,
                }),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                coordinates: Err(GeocodeError::Lookup {
                    reason: "backend should not be reached".to_string(),
                }),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GeocodeBackend for Arc<ScriptedBackend> {
        async fn lookup(&self, _: &str, _: &str) -> Result<Coordinates, GeocodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.coordinates.clone()
        }
    }

    fn test_db() -> Arc<Mutex<Database>> {
        Arc::new(Mutex::new(Database::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn empty_location_short_circuits_without_lookup() {
        let backend = Arc::new(ScriptedBackend::failing());
        let geocoder = Geocoder::new(Box::new(backend.clone()), test_db());

        let err = geocoder.geocode("", "").await.unwrap_err();
        assert_eq!(err, GeocodeError::InvalidInput);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        let err = geocoder.geocode("  ", "  ").await.unwrap_err();
        assert_eq!(err, GeocodeError::InvalidInput);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repeated_locations_cost_one_lookup() {
        let backend = Arc::new(ScriptedBackend::resolving(52.53, 13.38));
        let geocoder = Geocoder::new(Box::new(backend.clone()), test_db());

        let first = geocoder.geocode("10115", "Berlin").await.unwrap();
        let second = geocoder.geocode("10115", "Berlin").await.unwrap();
        // Key normalization: case and whitespace variants hit the cache.
        let third = geocoder.geocode(" 10115 ", "BERLIN").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, third);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_persists_across_geocoder_instances_via_store() {
        let db = test_db();

        let backend = Arc::new(ScriptedBackend::resolving(48.13, 11.57));
        let geocoder = Geocoder::new(Box::new(backend.clone()), db.clone());
        geocoder.geocode("80331", "München").await.unwrap();

        // Fresh instance, empty in-memory map, backend that would fail.
        let offline = Arc::new(ScriptedBackend::failing());
        let geocoder = Geocoder::new(Box::new(offline.clone()), db);
        let hit = geocoder.geocode("80331", "München").await.unwrap();

        assert_eq!(hit.latitude, 48.13);
        assert_eq!(offline.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn lookup_failures_are_not_cached() {
        let backend = Arc::new(ScriptedBackend::failing());
        let geocoder = Geocoder::new(Box::new(backend.clone()), test_db());

        assert!(geocoder.geocode("99999", "Nirgendwo").await.is_err());
        assert!(geocoder.geocode("99999", "Nirgendwo").await.is_err());
        assert_eq!(
            backend.calls.load(Ordering::SeqCst),
            2,
            "failures must be retried, not remembered"
        );
    }

    #[tokio::test]
    async fn nominatim_backend_parses_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("format", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "lat": "52.5323", "lon": "13.3846", "display_name": "Berlin" }
            ])))
            .mount(&server)
            .await;

        let backend = NominatimBackend::new(
            &server.uri(),
            "kleinanzeigen-map/0.1",
            Arc::new(RateLimiter::unlimited()),
        );
        let coords = backend.lookup("10115", "Berlin").await.unwrap();
        assert!((coords.latitude - 52.5323).abs() < 1e-9);
        assert!((coords.longitude - 13.3846).abs() < 1e-9);
    }

    #[tokio::test]
    async fn nominatim_backend_maps_empty_results_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let backend = NominatimBackend::new(
            &server.uri(),
            "kleinanzeigen-map/0.1",
            Arc::new(RateLimiter::unlimited()),
        );
        let err = backend.lookup("99999", "Nirgendwo").await.unwrap_err();
        assert!(matches!(err, GeocodeError::NotFound { .. }));
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tracing::trace;

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::record::Coordinates;

static CANADA_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bcanada\b|\bquébec\b|\bqc\b|\bmontreal\b|\b,\s*ca\s*$")
        .expect("country hint pattern")
});

/// A cleaned forward-geocode request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeocodeQuery {
    pub text: String,
    pub country_code: Option<&'static str>,
}

impl GeocodeQuery {
    /// Builds the query sent to the geocoder, or `None` for blank input.
    ///
    /// Comma-separated tokens before the first token holding a digit are
    /// dropped, so "ACME Motors, 123 Main St, Springfield" is looked up as
    /// "123 Main St, Springfield".
    pub fn normalize(address: &str) -> Option<Self> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return None;
        }

        let parts: Vec<&str> = trimmed
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect();
        let text = match parts
            .iter()
            .position(|part| part.chars().any(|c| c.is_ascii_digit()))
        {
            Some(idx) if idx > 0 => parts[idx..].join(", "),
            _ => trimmed.to_string(),
        };

        Some(Self {
            text,
            country_code: CANADA_HINT.is_match(trimmed).then_some("ca"),
        })
    }
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn forward(&self, query: &GeocodeQuery) -> AppResult<Option<Coordinates>>;
    async fn reverse(&self, point: Coordinates) -> AppResult<Option<String>>;
}

/// Stateless pass-through to the geocoding backend. Debounce, staleness and
/// loop suppression live in the synchronizer.
#[derive(Clone)]
pub struct GeocodingService {
    inner: Arc<dyn Geocoder>,
}

impl GeocodingService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let client = HttpGeocoder::new(&config.geocoder_base_url, &config.geocoder_user_agent)?;
        Ok(Self {
            inner: Arc::new(client),
        })
    }

    pub fn from_geocoder(geocoder: Arc<dyn Geocoder>) -> Self {
        Self { inner: geocoder }
    }

    pub async fn forward(&self, address: &str) -> AppResult<Option<Coordinates>> {
        let Some(query) = GeocodeQuery::normalize(address) else {
            return Ok(None);
        };
        trace!(target: "geocoding", query = %query.text, country = ?query.country_code, "forward geocode");
        self.inner.forward(&query).await
    }

    pub async fn reverse(&self, point: Coordinates) -> AppResult<Option<String>> {
        if !point.is_finite() {
            return Ok(None);
        }
        self.inner.reverse(point).await
    }
}

/// Nominatim-compatible HTTP geocoder.
pub struct HttpGeocoder {
    http: Client,
    base_url: String,
}

impl HttpGeocoder {
    pub fn new(base_url: &str, user_agent: &str) -> AppResult<Self> {
        let http = Client::builder().user_agent(user_agent).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn forward(&self, query: &GeocodeQuery) -> AppResult<Option<Coordinates>> {
        #[derive(Deserialize)]
        struct Candidate {
            lat: Option<String>,
            lon: Option<String>,
        }

        let mut params = vec![("format", "json"), ("limit", "1")];
        if let Some(code) = query.country_code {
            params.push(("countrycodes", code));
        }
        params.push(("q", query.text.as_str()));

        let response = self
            .http
            .get(format!("{}/search", self.base_url))
            .query(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            trace!(target: "geocoding", status = %response.status(), "forward geocode rejected");
            return Ok(None);
        }

        let candidates: Vec<Candidate> = response.json().await?;
        let Some(first) = candidates.into_iter().next() else {
            return Ok(None);
        };
        Ok(Coordinates::parse(
            first.lat.as_deref().unwrap_or_default(),
            first.lon.as_deref().unwrap_or_default(),
        ))
    }

    async fn reverse(&self, point: Coordinates) -> AppResult<Option<String>> {
        #[derive(Deserialize)]
        struct Place {
            display_name: Option<String>,
        }

        let lat = point.lat.to_string();
        let lon = point.lng.to_string();
        let response = self
            .http
            .get(format!("{}/reverse", self.base_url))
            .query(&[("format", "json"), ("lat", lat.as_str()), ("lon", lon.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            trace!(target: "geocoding", status = %response.status(), "reverse geocode rejected");
            return Ok(None);
        }

        let place: Place = response.json().await?;
        Ok(place.display_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    #[test]
    fn strips_descriptive_prefix() {
        let query = GeocodeQuery::normalize("ACME Motors, 123 Main St, Springfield").unwrap();
        assert_eq!(query.text, "123 Main St, Springfield");
        assert_eq!(query.country_code, None);
    }

    #[test]
    fn keeps_text_when_number_leads_or_is_missing() {
        let leading = GeocodeQuery::normalize("  123 Main St, Springfield ").unwrap();
        assert_eq!(leading.text, "123 Main St, Springfield");

        let none = GeocodeQuery::normalize("Union Station, Toronto").unwrap();
        assert_eq!(none.text, "Union Station, Toronto");

        assert!(GeocodeQuery::normalize("   ").is_none());
    }

    #[test]
    fn restricts_country_for_canadian_hints() {
        for input in [
            "1 Rue Sainte-Catherine, Montreal",
            "500 Boul. René-Lévesque, QC",
            "12 King St, Québec",
            "44 Bay Road, Halifax, CA",
            "77 Front St, canada",
        ] {
            assert_eq!(
                GeocodeQuery::normalize(input).unwrap().country_code,
                Some("ca"),
                "{input}"
            );
        }
        assert_eq!(
            GeocodeQuery::normalize("12 Academy Rd, Cairo").unwrap().country_code,
            None
        );
        // The trailing country code only counts right after a word.
        assert_eq!(
            GeocodeQuery::normalize("12 King St , ca").unwrap().country_code,
            None
        );
    }

    #[tokio::test]
    async fn forward_reads_first_candidate() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/search"),
                request::query(url_decoded(contains(("q", "123 Main St, Springfield")))),
                request::query(url_decoded(contains(("limit", "1")))),
            ])
            .respond_with(json_encoded(json!([
                { "lat": "45.5", "lon": "-73.6", "display_name": "first" },
                { "lat": "1", "lon": "2" }
            ]))),
        );

        let geocoder = HttpGeocoder::new(&server.url_str(""), "intake-tests").unwrap();
        let service = GeocodingService::from_geocoder(Arc::new(geocoder));
        let coords = service
            .forward("ACME Motors, 123 Main St, Springfield")
            .await
            .unwrap();
        assert_eq!(coords, Some(Coordinates::new(45.5, -73.6)));
    }

    #[tokio::test]
    async fn forward_sends_country_restriction() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/search"),
                request::query(url_decoded(contains(("countrycodes", "ca")))),
            ])
            .respond_with(json_encoded(json!([]))),
        );

        let geocoder = HttpGeocoder::new(&server.url_str(""), "intake-tests").unwrap();
        let result = geocoder
            .forward(&GeocodeQuery::normalize("1 Rue Peel, Montreal").unwrap())
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn forward_treats_failures_as_absent() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::query(url_decoded(contains(("q", "1 Bad St")))))
                .respond_with(status_code(503)),
        );
        server.expect(
            Expectation::matching(request::query(url_decoded(contains(("q", "2 Odd St")))))
                .respond_with(json_encoded(json!([{ "lat": "north", "lon": "-73" }]))),
        );

        let geocoder = HttpGeocoder::new(&server.url_str(""), "intake-tests").unwrap();
        let service = GeocodingService::from_geocoder(Arc::new(geocoder));
        assert_eq!(service.forward("1 Bad St").await.unwrap(), None);
        assert_eq!(service.forward("2 Odd St").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reverse_returns_display_name() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/reverse"),
                request::query(url_decoded(contains(("lat", "45")))),
                request::query(url_decoded(contains(("lon", "-73")))),
            ])
            .respond_with(json_encoded(json!({ "display_name": "123 Main St" }))),
        );

        let geocoder = HttpGeocoder::new(&server.url_str("/"), "intake-tests").unwrap();
        let address = geocoder
            .reverse(Coordinates::new(45.0, -73.0))
            .await
            .unwrap();
        assert_eq!(address.as_deref(), Some("123 Main St"));
    }

    #[tokio::test]
    async fn reverse_without_display_name_is_absent() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/reverse"))
                .respond_with(json_encoded(json!({ "error": "Unable to geocode" }))),
        );

        let geocoder = HttpGeocoder::new(&server.url_str(""), "intake-tests").unwrap();
        let address = geocoder.reverse(Coordinates::new(0.5, 0.5)).await.unwrap();
        assert_eq!(address, None);
    }
}

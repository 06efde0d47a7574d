//! Forward and reverse geocoding against a Mapbox-style places API
//!
//! Forward: venue name -> `{lat, lng, placeName, accuracy}`, memoized in the
//! durable geocode cache. Reverse: coordinate -> `{city, state, country,
//! fullName, metroArea?}`, memoized in the bounded in-memory cache.
//! Empty results are returned as `None` and never cached.

use crate::cache::geocode::GeocodeCache;
use crate::cache::reverse::ReverseGeocodeCache;
use crate::domain::types::{GeocodeAccuracy, GeocodeResult, ReverseGeocodeResult};
use crate::infra::config::Config;
use crate::infra::error::GeocodingError;
use crate::io::token::AccessTokenProvider;
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PLACES_PATH: [&str; 3] = ["geocoding", "v5", "mapbox.places"];
const REVERSE_TYPES: &str = "place,locality,district,region,country";

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    /// [lng, lat]
    #[serde(default)]
    center: Option<[f64; 2]>,
    #[serde(default)]
    place_name: String,
    #[serde(default)]
    place_type: Vec<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    context: Vec<ContextEntry>,
}

impl Feature {
    fn has_type(&self, wanted: &str) -> bool {
        self.place_type.iter().any(|t| t == wanted)
    }

    fn context_text(&self, prefix: &str) -> Option<&str> {
        self.context.iter().find(|c| c.id.starts_with(prefix)).map(|c| c.text.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    id: String,
    #[serde(default)]
    text: String,
}

fn decode_features(body: &[u8]) -> Result<FeatureCollection, GeocodingError> {
    serde_json::from_slice(body).map_err(|e| GeocodingError::Decode(e.to_string()))
}

/// First feature with coordinates, accuracy inferred from its place type
pub fn parse_forward(body: &[u8]) -> Result<Option<GeocodeResult>, GeocodingError> {
    let collection = decode_features(body)?;
    let Some(feature) = collection.features.into_iter().find(|f| f.center.is_some()) else {
        return Ok(None);
    };
    let Some([lng, lat]) = feature.center else {
        return Ok(None);
    };

    let accuracy = feature
        .place_type
        .first()
        .map(|t| GeocodeAccuracy::from_place_type(t))
        .unwrap_or(GeocodeAccuracy::Locality);

    Ok(Some(GeocodeResult { lat, lng, place_name: feature.place_name, accuracy }))
}

/// Scan for a place/locality feature and pull region and country from its context
pub fn parse_reverse(body: &[u8]) -> Result<Option<ReverseGeocodeResult>, GeocodingError> {
    let collection = decode_features(body)?;
    let features = &collection.features;

    let Some(place) = features.iter().find(|f| f.has_type("place") || f.has_type("locality"))
    else {
        return Ok(None);
    };

    // Context first; fall back to top-level region/country features
    let top_level = |kind: &str| {
        features.iter().find(|f| f.has_type(kind)).map(|f| f.text.as_str())
    };
    let state = place.context_text("region.").or_else(|| top_level("region")).unwrap_or_default();
    let country =
        place.context_text("country.").or_else(|| top_level("country")).unwrap_or_default();
    let metro_area = place.context_text("district.").or_else(|| top_level("district"));

    Ok(Some(ReverseGeocodeResult {
        city: place.text.clone(),
        state: state.to_string(),
        country: country.to_string(),
        full_name: place.place_name.clone(),
        metro_area: metro_area.map(str::to_string),
    }))
}

pub struct GeocodingClient {
    base_url: Url,
    http: reqwest::Client,
    tokens: Arc<AccessTokenProvider>,
    geocode_cache: GeocodeCache,
    reverse_cache: ReverseGeocodeCache,
    /// Default proximity bias as (lng, lat)
    default_proximity: Option<(f64, f64)>,
}

impl GeocodingClient {
    pub fn new(
        config: &Config,
        tokens: Arc<AccessTokenProvider>,
        geocode_cache: GeocodeCache,
        reverse_cache: ReverseGeocodeCache,
    ) -> Result<Self, GeocodingError> {
        let base_url = Url::parse(config.geocoding_base_url())
            .map_err(|e| GeocodingError::Url(e.to_string()))?;
        let http = reqwest::Client::builder().timeout(config.geocoding_timeout()).build()?;
        Ok(Self {
            base_url,
            http,
            tokens,
            geocode_cache,
            reverse_cache,
            default_proximity: config.geocoding_proximity(),
        })
    }

    fn places_url(&self, last_segment: &str, token: &str) -> Result<Url, GeocodingError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GeocodingError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(PLACES_PATH)
            .push(last_segment);
        url.query_pairs_mut().append_pair("access_token", token);
        Ok(url)
    }

    async fn fetch(&self, url: Url) -> Result<bytes::Bytes, GeocodingError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GeocodingError::Status(status.as_u16()));
        }
        Ok(response.bytes().await?)
    }

    /// Resolve a venue name to coordinates
    ///
    /// `proximity` is (lng, lat); the configured default applies when omitted.
    pub async fn geocode_venue(
        &self,
        venue: &str,
        proximity: Option<(f64, f64)>,
    ) -> Result<Option<GeocodeResult>, GeocodingError> {
        if let Some(cached) = self.geocode_cache.get(venue) {
            debug!(venue = %venue, "geocode_cache_hit");
            return Ok(Some(cached));
        }

        let token = self.tokens.token().await?;
        let mut url = self.places_url(&format!("{venue}.json"), &token)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", "1");
            if let Some((lng, lat)) = proximity.or(self.default_proximity) {
                query.append_pair("proximity", &format!("{lng},{lat}"));
            }
        }

        let body = self.fetch(url).await?;
        let result = parse_forward(&body)?;

        match &result {
            Some(hit) => {
                self.geocode_cache.set(venue, hit);
                info!(
                    venue = %venue,
                    lat = %hit.lat,
                    lng = %hit.lng,
                    accuracy = %hit.accuracy.as_str(),
                    "venue_geocoded"
                );
            }
            None => warn!(venue = %venue, "venue_geocode_no_result"),
        }
        Ok(result)
    }

    /// Geocode venues in order, skipping the ones that fail or have no result
    pub async fn geocode_venues(&self, venues: &[String]) -> Vec<(String, GeocodeResult)> {
        let mut resolved = Vec::with_capacity(venues.len());
        for venue in venues {
            match self.geocode_venue(venue, None).await {
                Ok(Some(result)) => resolved.push((venue.clone(), result)),
                Ok(None) => {}
                Err(e) => warn!(venue = %venue, error = %e, "venue_geocode_failed"),
            }
        }
        resolved
    }

    /// Resolve a coordinate to a place name
    pub async fn reverse_geocode(
        &self,
        lat: f64,
        lng: f64,
    ) -> Result<Option<ReverseGeocodeResult>, GeocodingError> {
        if let Some(cached) = self.reverse_cache.get(lat, lng) {
            debug!(lat = %lat, lng = %lng, "reverse_cache_hit");
            return Ok(Some(cached));
        }

        let token = self.tokens.token().await?;
        let mut url = self.places_url(&format!("{lng},{lat}.json"), &token)?;
        url.query_pairs_mut().append_pair("types", REVERSE_TYPES);

        let body = self.fetch(url).await?;
        let result = parse_reverse(&body)?;
        if let Some(place) = &result {
            self.reverse_cache.set(lat, lng, place.clone());
            debug!(lat = %lat, lng = %lng, city = %place.city, "reverse_geocoded");
        }
        Ok(result)
    }

    pub fn geocode_cache(&self) -> &GeocodeCache {
        &self.geocode_cache
    }

    pub fn reverse_cache(&self) -> &ReverseGeocodeCache {
        &self.reverse_cache
    }
}

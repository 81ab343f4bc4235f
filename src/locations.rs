//! World-city directory
//!
//! Loaded once from a `worldcities.csv` style file (`id, city, city_ascii,
//! lat, lng, country, iso2, admin_name`, extra columns ignored). Used to
//! resolve subjects to coordinates for access-point templates and to offer
//! location search to the front end.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use tokio::task;
use tracing::{debug, info, warn};

use crate::error::WeatherTravelError;
use crate::models::Location;

#[derive(Debug, Deserialize)]
struct CityRow {
    id: u64,
    city: String,
    city_ascii: String,
    lat: f64,
    lng: f64,
    country: String,
    #[serde(default)]
    iso2: Option<String>,
    #[serde(default)]
    admin_name: Option<String>,
}

impl From<CityRow> for Location {
    fn from(row: CityRow) -> Self {
        Location {
            id: row.id,
            name: row.city,
            ascii_name: row.city_ascii,
            latitude: row.lat,
            longitude: row.lng,
            country: row.country,
            country_code: row.iso2.filter(|c| !c.is_empty()),
            region: row.admin_name.filter(|r| !r.is_empty()),
        }
    }
}

#[derive(Debug, Default)]
pub struct LocationDirectory {
    locations: Vec<Location>,
    by_id: HashMap<u64, usize>,
}

impl LocationDirectory {
    /// Build from already loaded locations; file order is the match order
    pub fn from_locations(locations: Vec<Location>) -> Self {
        let by_id = locations
            .iter()
            .enumerate()
            .map(|(idx, location)| (location.id, idx))
            .collect();
        Self { locations, by_id }
    }

    /// Parse CSV data; unreadable rows are skipped
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, WeatherTravelError> {
        let mut csv = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);

        let mut locations = Vec::new();
        let mut skipped = 0usize;
        for row in csv.deserialize::<CityRow>() {
            match row {
                Ok(row) => locations.push(Location::from(row)),
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable city row");
                    skipped += 1;
                }
            }
        }

        if locations.is_empty() && skipped > 0 {
            return Err(WeatherTravelError::config(format!(
                "location file has no readable rows ({skipped} skipped)"
            )));
        }
        if skipped > 0 {
            warn!(skipped, loaded = locations.len(), "Some city rows could not be read");
        }
        Ok(Self::from_locations(locations))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, WeatherTravelError> {
        let path = path.as_ref().to_path_buf();
        let directory = task::spawn_blocking(move || {
            let file = std::fs::File::open(&path).map_err(|e| {
                WeatherTravelError::config(format!(
                    "cannot open location file {}: {e}",
                    path.display()
                ))
            })?;
            Self::from_reader(std::io::BufReader::new(file))
        })
        .await
        .map_err(|e| WeatherTravelError::config(format!("location loading task failed: {e}")))??;

        info!(locations = directory.len(), "Location directory loaded");
        Ok(directory)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Case-insensitive substring match on the city or its ASCII name
    pub fn search(&self, text: &str, limit: usize) -> Vec<&Location> {
        let query = text.trim().to_lowercase();
        if query.is_empty() {
            return Vec::new();
        }
        self.locations
            .iter()
            .filter(|l| {
                l.name.to_lowercase().contains(&query) || l.ascii_name.to_lowercase().contains(&query)
            })
            .take(limit)
            .collect()
    }

    #[must_use]
    pub fn by_id(&self, id: u64) -> Option<&Location> {
        self.by_id.get(&id).map(|&idx| &self.locations[idx])
    }

    /// Exact city match for a city name and ISO country code
    #[must_use]
    pub fn find(&self, city: &str, country_code: &str) -> Option<&Location> {
        self.locations.iter().find(|l| {
            l.name.eq_ignore_ascii_case(city)
                && l
                    .country_code
                    .as_deref()
                    .is_some_and(|code| code.eq_ignore_ascii_case(country_code))
        })
    }

    /// Resolve a subject such as `riverside` or `paris, france`.
    ///
    /// The part after a comma narrows by country, country code or region.
    #[must_use]
    pub fn resolve(&self, subject: &str) -> Option<&Location> {
        let (city, qualifier) = match subject.split_once(',') {
            Some((city, qualifier)) => (city.trim(), Some(qualifier.trim())),
            None => (subject.trim(), None),
        };
        if city.is_empty() {
            return None;
        }

        self.locations.iter().find(|l| {
            let name_matches =
                l.name.eq_ignore_ascii_case(city) || l.ascii_name.eq_ignore_ascii_case(city);
            name_matches
                && qualifier.is_none_or(|q| {
                    l.country.eq_ignore_ascii_case(q)
                        || l.country_code.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(q))
                        || l.region.as_deref().is_some_and(|r| r.eq_ignore_ascii_case(q))
                })
        })
    }

    /// Closest known location to a point
    #[must_use]
    pub fn nearest(&self, latitude: f64, longitude: f64) -> Option<&Location> {
        self.locations.iter().min_by(|a, b| {
            a.distance_km(latitude, longitude)
                .total_cmp(&b.distance_km(latitude, longitude))
        })
    }
}

//! Location model for geographic coordinates and metadata

use serde::{Deserialize, Serialize};

/// A known place from the location directory
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Location {
    /// Directory identifier
    pub id: u64,
    /// Display name of the city
    pub name: String,
    /// ASCII transliteration, used in scraped page URLs
    pub ascii_name: String,
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
    /// Country name
    pub country: String,
    /// Country code (ISO 3166-1 alpha-2)
    pub country_code: Option<String>,
    /// First-level administrative region
    pub region: Option<String>,
}

impl Location {
    /// "City, Region, Country" as offered to the user when searching
    #[must_use]
    pub fn display_name(&self) -> String {
        match &self.region {
            Some(region) if !region.is_empty() => {
                format!("{}, {}, {}", self.name, region, self.country)
            }
            _ => format!("{}, {}", self.name, self.country),
        }
    }

    /// Format location as coordinates string
    #[must_use]
    pub fn format_coordinates(&self) -> String {
        format!("{:.4}, {:.4}", self.latitude, self.longitude)
    }

    /// Distance to a point in kilometers
    #[must_use]
    pub fn distance_km(&self, latitude: f64, longitude: f64) -> f64 {
        haversine::distance(
            haversine::Location {
                latitude: self.latitude,
                longitude: self.longitude,
            },
            haversine::Location {
                latitude,
                longitude,
            },
            haversine::Units::Kilometers,
        )
    }
}

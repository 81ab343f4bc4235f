//! Unit conversion and display helpers for observation values

use serde::{Deserialize, Serialize};

/// Unit system used when shaping values for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitSystem {
    #[default]
    Metric,
    Imperial,
}

#[must_use]
pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

#[must_use]
pub fn mm_to_inches(millimeters: f64) -> f64 {
    millimeters / 25.4
}

#[must_use]
pub fn kmh_to_mph(km_per_hour: f64) -> f64 {
    km_per_hour * 0.621_371
}

/// Convert wind direction from degrees to a 16-point cardinal direction
#[must_use]
pub fn wind_direction_to_cardinal(degrees: f64) -> &'static str {
    const POINTS: [&str; 16] = [
        "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE", "S", "SSW", "SW", "WSW", "W", "WNW",
        "NW", "NNW",
    ];
    if !degrees.is_finite() {
        return "Unknown";
    }
    let normalized = degrees.rem_euclid(360.0);
    let index = ((normalized + 11.25) / 22.5) as usize % 16;
    POINTS[index]
}

/// Convert a metric attribute to imperial based on its name suffix.
///
/// Returns the renamed attribute and converted value, or `None` when the
/// attribute carries no recognised metric unit.
#[must_use]
pub fn to_imperial(name: &str, value: f64) -> Option<(String, f64)> {
    if let Some(base) = name.strip_suffix("_c") {
        return Some((format!("{base}_f"), celsius_to_fahrenheit(value)));
    }
    if let Some(base) = name.strip_suffix("_mm") {
        return Some((format!("{base}_inch"), mm_to_inches(value)));
    }
    if let Some(base) = name.strip_suffix("_kmh") {
        return Some((format!("{base}_mph"), kmh_to_mph(value)));
    }
    None
}

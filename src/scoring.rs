//! Weather evaluation for travel
//!
//! Rates merged weather attributes that matter on the road (freezing level,
//! precipitation, snowfall, visibility, wind gusts) and folds them into a
//! single 0-100 score, where 100 means nothing hampers the trip.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;

use serde::Serialize;
use tracing::warn;

use crate::models::FieldValue;

const MAX_SCORE: u8 = 100;
const WORST_INTENSITY: u8 = 100;
const IMPACT_MULTIPLIER: f64 = 50.0;
const IMPACT_HORIZONTAL_SHIFT: f64 = 93.91;
const IMPACT_VERTICAL_SHIFT: f64 = 227.12;

/// Overall travel weather rating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScoreCategory {
    Excellent,
    Good,
    Bad,
    Terrible,
}

impl ScoreCategory {
    pub const ALL: [ScoreCategory; 4] = [
        ScoreCategory::Excellent,
        ScoreCategory::Good,
        ScoreCategory::Bad,
        ScoreCategory::Terrible,
    ];

    #[must_use]
    pub fn range(self) -> RangeInclusive<u8> {
        match self {
            ScoreCategory::Excellent => 76..=100,
            ScoreCategory::Good => 51..=75,
            ScoreCategory::Bad => 26..=50,
            ScoreCategory::Terrible => 0..=25,
        }
    }

    /// `None` for scores above 100
    #[must_use]
    pub fn from_score(score: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.range().contains(&score))
    }
}

/// Road-relevant weather condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    FreezingRisk,
    Precipitation,
    Snowfall,
    Visibility,
    WindGust,
}

impl Condition {
    pub const ALL: [Condition; 5] = [
        Condition::FreezingRisk,
        Condition::Precipitation,
        Condition::Snowfall,
        Condition::Visibility,
        Condition::WindGust,
    ];

    /// Attribute names read for this condition, preferred name first
    #[must_use]
    pub fn attributes(self) -> &'static [&'static str] {
        match self {
            Condition::FreezingRisk => &["freezing_level_m", "freezing_level_height"],
            Condition::Precipitation => &["precipitation_mm", "precipitation"],
            Condition::Snowfall => &["snowfall_cm", "snowfall"],
            Condition::Visibility => &["visibility_m", "visibility"],
            Condition::WindGust => &["wind_gust_kmh", "wind_gusts"],
        }
    }

    #[must_use]
    pub fn weight(self) -> f64 {
        match self {
            Condition::FreezingRisk => 1.8,
            Condition::Precipitation => 1.3,
            Condition::Snowfall => 1.5,
            Condition::Visibility | Condition::WindGust => 1.6,
        }
    }

    /// Smallest meaningful measurement
    fn minimum(self) -> f64 {
        match self {
            Condition::FreezingRisk => -500.0,
            _ => 0.0,
        }
    }

    /// Intensity 0 (harmless) to 100 (worst) of a measurement
    #[must_use]
    pub fn intensity(self, value: f64) -> u8 {
        match self {
            // Freezing level height in metres: the lower, the riskier
            Condition::FreezingRisk => match value {
                v if v >= 1500.0 => 0,
                v if v >= 1000.0 => 20,
                v if v >= 500.0 => 40,
                v if v >= 200.0 => 70,
                _ => 100,
            },
            // Millimetres
            Condition::Precipitation => match value {
                v if v >= 8.0 => 100,
                v if v >= 4.0 => 70,
                v if v >= 1.0 => 40,
                v if v >= 0.1 => 20,
                _ => 0,
            },
            // Centimetres
            Condition::Snowfall => match value {
                v if v >= 3.0 => 100,
                v if v >= 1.5 => 70,
                v if v >= 0.5 => 40,
                v if v >= 0.1 => 20,
                _ => 0,
            },
            // Metres: the shorter, the worse
            Condition::Visibility => match value {
                v if v >= 10_000.0 => 0,
                v if v >= 7_000.0 => 20,
                v if v >= 4_000.0 => 40,
                v if v >= 1_000.0 => 70,
                _ => 100,
            },
            // km/h
            Condition::WindGust => match value {
                v if v >= 40.0 => 100,
                v if v >= 30.0 => 70,
                v if v >= 20.0 => 40,
                v if v >= 10.0 => 20,
                _ => 0,
            },
        }
    }

    /// Checked measurement for this condition
    pub fn measure(self, value: f64) -> Result<ConditionScore, String> {
        if value.is_nan() {
            return Err(format!("{self} cannot be NaN"));
        }
        if value.is_infinite() {
            return Err(format!("{self} cannot be infinite"));
        }
        if value < self.minimum() {
            return Err(format!("{self} cannot be below {:.1}", self.minimum()));
        }
        Ok(ConditionScore {
            condition: self,
            value,
            intensity: self.intensity(value),
        })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::FreezingRisk => write!(f, "Freezing risk"),
            Condition::Precipitation => write!(f, "Precipitation"),
            Condition::Snowfall => write!(f, "Snowfall"),
            Condition::Visibility => write!(f, "Visibility"),
            Condition::WindGust => write!(f, "Wind gust"),
        }
    }
}

impl fmt::Display for ScoreCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreCategory::Excellent => write!(f, "EXCELLENT"),
            ScoreCategory::Good => write!(f, "GOOD"),
            ScoreCategory::Bad => write!(f, "BAD"),
            ScoreCategory::Terrible => write!(f, "TERRIBLE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionScore {
    pub condition: Condition,
    pub value: f64,
    pub intensity: u8,
}

impl ConditionScore {
    #[must_use]
    pub fn weighted(&self) -> f64 {
        f64::from(self.intensity) * self.condition.weight()
    }

    #[must_use]
    pub fn worst_weighted(&self) -> f64 {
        f64::from(WORST_INTENSITY) * self.condition.weight()
    }
}

/// Score of a set of measured conditions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherEvaluation {
    pub score: u8,
    pub category: ScoreCategory,
    pub conditions: Vec<ConditionScore>,
}

impl WeatherEvaluation {
    /// Rate `conditions`; no conditions at all rates as a perfect score
    #[must_use]
    pub fn from_conditions(conditions: Vec<ConditionScore>) -> Self {
        let score = weather_score(&conditions);
        Self {
            score,
            category: ScoreCategory::from_score(score).unwrap_or(ScoreCategory::Excellent),
            conditions,
        }
    }

    /// Evaluate merged attributes.
    ///
    /// Returns `None` when no attribute maps to a condition. Unusable values
    /// (non-numeric, NaN, below the physical minimum) are skipped with a
    /// warning.
    #[must_use]
    pub fn from_fields(fields: &BTreeMap<String, FieldValue>) -> Option<Self> {
        let mut conditions = Vec::new();
        for condition in Condition::ALL {
            let Some((name, value)) = condition
                .attributes()
                .iter()
                .find_map(|name| fields.get(*name).map(|v| (*name, v)))
            else {
                continue;
            };
            let Some(number) = value.as_number() else {
                warn!(attribute = name, "Ignoring non-numeric weather attribute");
                continue;
            };
            match condition.measure(number) {
                Ok(score) => conditions.push(score),
                Err(reason) => warn!(attribute = name, %reason, "Ignoring weather attribute"),
            }
        }

        if conditions.is_empty() {
            return None;
        }
        Some(Self::from_conditions(conditions))
    }
}

/// Logarithmic fold of the weighted intensities into 0-100
fn weather_score(conditions: &[ConditionScore]) -> u8 {
    if conditions.is_empty() {
        return MAX_SCORE;
    }
    let total_impact: f64 = conditions.iter().map(ConditionScore::weighted).sum();
    let normalized = (IMPACT_MULTIPLIER * (total_impact + IMPACT_HORIZONTAL_SHIFT).ln()
        - IMPACT_VERTICAL_SHIFT)
        .round();
    (f64::from(MAX_SCORE) - normalized).clamp(0.0, f64::from(MAX_SCORE)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn fields(values: &[(&str, f64)]) -> BTreeMap<String, FieldValue> {
        values
            .iter()
            .map(|(name, value)| ((*name).to_string(), FieldValue::Number(*value)))
            .collect()
    }

    #[rstest]
    #[case(0, ScoreCategory::Terrible)]
    #[case(12, ScoreCategory::Terrible)]
    #[case(25, ScoreCategory::Terrible)]
    #[case(26, ScoreCategory::Bad)]
    #[case(38, ScoreCategory::Bad)]
    #[case(50, ScoreCategory::Bad)]
    #[case(51, ScoreCategory::Good)]
    #[case(63, ScoreCategory::Good)]
    #[case(75, ScoreCategory::Good)]
    #[case(76, ScoreCategory::Excellent)]
    #[case(88, ScoreCategory::Excellent)]
    #[case(100, ScoreCategory::Excellent)]
    fn test_category_from_score(#[case] score: u8, #[case] expected: ScoreCategory) {
        assert_eq!(ScoreCategory::from_score(score), Some(expected));
    }

    #[test]
    fn test_category_rejects_out_of_range_score() {
        assert_eq!(ScoreCategory::from_score(101), None);
        assert_eq!(ScoreCategory::from_score(u8::MAX), None);
    }

    #[rstest]
    #[case(Condition::FreezingRisk, 2000.0, 0)]
    #[case(Condition::FreezingRisk, 1000.0, 20)]
    #[case(Condition::FreezingRisk, 600.0, 40)]
    #[case(Condition::FreezingRisk, 200.0, 70)]
    #[case(Condition::FreezingRisk, -100.0, 100)]
    #[case(Condition::Precipitation, 0.0, 0)]
    #[case(Condition::Precipitation, 0.1, 20)]
    #[case(Condition::Precipitation, 2.5, 40)]
    #[case(Condition::Precipitation, 4.0, 70)]
    #[case(Condition::Precipitation, 12.0, 100)]
    #[case(Condition::Snowfall, 0.05, 0)]
    #[case(Condition::Snowfall, 0.5, 40)]
    #[case(Condition::Snowfall, 1.5, 70)]
    #[case(Condition::Snowfall, 3.0, 100)]
    #[case(Condition::Visibility, 24_000.0, 0)]
    #[case(Condition::Visibility, 8_000.0, 20)]
    #[case(Condition::Visibility, 4_000.0, 40)]
    #[case(Condition::Visibility, 1_500.0, 70)]
    #[case(Condition::Visibility, 300.0, 100)]
    #[case(Condition::WindGust, 5.0, 0)]
    #[case(Condition::WindGust, 10.0, 20)]
    #[case(Condition::WindGust, 25.0, 40)]
    #[case(Condition::WindGust, 30.0, 70)]
    #[case(Condition::WindGust, 55.0, 100)]
    fn test_condition_intensity(#[case] condition: Condition, #[case] value: f64, #[case] expected: u8) {
        assert_eq!(condition.intensity(value), expected);
    }

    #[rstest]
    #[case(Condition::Precipitation, -0.1)]
    #[case(Condition::FreezingRisk, -600.0)]
    #[case(Condition::WindGust, f64::NAN)]
    #[case(Condition::Visibility, f64::INFINITY)]
    fn test_measure_rejects_impossible_values(#[case] condition: Condition, #[case] value: f64) {
        assert!(condition.measure(value).is_err());
    }

    #[rstest]
    #[case(&[], None)]
    #[case(&[("temperature_c", 21.0)], None)]
    #[case(&[("precipitation_mm", 0.0), ("wind_gust_kmh", 5.0)], Some((100, ScoreCategory::Excellent)))]
    #[case(&[("wind_gust_kmh", 12.0)], Some((85, ScoreCategory::Excellent)))]
    #[case(&[("precipitation_mm", 4.0)], Some((66, ScoreCategory::Good)))]
    #[case(&[("precipitation", 1.0), ("freezing_level_height", 700.0)], Some((58, ScoreCategory::Good)))]
    #[case(&[("visibility_m", 500.0)], Some((50, ScoreCategory::Bad)))]
    #[case(&[("snowfall_cm", 2.0), ("visibility_m", 800.0)], Some((33, ScoreCategory::Bad)))]
    #[case(
        &[
            ("freezing_level_m", 0.0),
            ("precipitation_mm", 9.0),
            ("snowfall_cm", 4.0),
            ("visibility_m", 100.0),
            ("wind_gust_kmh", 60.0),
        ],
        Some((0, ScoreCategory::Terrible))
    )]
    fn test_evaluation_from_fields(
        #[case] values: &[(&str, f64)],
        #[case] expected: Option<(u8, ScoreCategory)>,
    ) {
        let evaluation = WeatherEvaluation::from_fields(&fields(values));
        assert_eq!(evaluation.map(|e| (e.score, e.category)), expected);
    }

    #[test]
    fn test_unusable_values_are_skipped() {
        let mut values = fields(&[("precipitation_mm", -3.0), ("wind_gust_kmh", 12.0)]);
        values.insert("visibility_m".to_string(), FieldValue::Text("fog".to_string()));

        let evaluation = WeatherEvaluation::from_fields(&values).unwrap();
        assert_eq!(evaluation.conditions.len(), 1);
        assert_eq!(evaluation.conditions[0].condition, Condition::WindGust);
        assert_eq!(evaluation.score, 85);
    }

    #[test]
    fn test_worst_case_weights() {
        let measured = Condition::FreezingRisk.measure(100.0).unwrap();
        assert_eq!(measured.intensity, 100);
        assert!((measured.weighted() - measured.worst_weighted()).abs() < f64::EPSILON);
        assert!((measured.worst_weighted() - 180.0).abs() < 1e-9);
    }
}

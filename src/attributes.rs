//! Attribute names and the per-attribute policies shared by the fetch and
//! normalize passes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Canonical attribute names as stored in `city_attributes.attribute_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CityAttributeName {
    CostOfLiving,
    Climate,
    Safety,
    UrbanGreenery,
    Amenities,
    PublicTransit,
    AirQuality,
    InternetSpeed,
}

impl CityAttributeName {
    pub const ALL: [CityAttributeName; 8] = [
        CityAttributeName::CostOfLiving,
        CityAttributeName::Climate,
        CityAttributeName::Safety,
        CityAttributeName::UrbanGreenery,
        CityAttributeName::Amenities,
        CityAttributeName::PublicTransit,
        CityAttributeName::AirQuality,
        CityAttributeName::InternetSpeed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CityAttributeName::CostOfLiving => "cost_of_living",
            CityAttributeName::Climate => "climate",
            CityAttributeName::Safety => "safety",
            CityAttributeName::UrbanGreenery => "urban_greenery",
            CityAttributeName::Amenities => "amenities",
            CityAttributeName::PublicTransit => "public_transit",
            CityAttributeName::AirQuality => "air_quality",
            CityAttributeName::InternetSpeed => "internet_speed",
        }
    }

    pub fn normalization_policy(&self) -> NormalizationPolicy {
        match self {
            CityAttributeName::AirQuality => NormalizationPolicy {
                usable: UsableRows::NonNull,
                insufficient: InsufficientData::Abstain,
                unusable: UnusableScore::Unchanged,
                transform: ScoreTransform::Linear,
                lower_is_better: true,
            },
            CityAttributeName::InternetSpeed => NormalizationPolicy {
                usable: UsableRows::StrictlyPositive,
                insufficient: InsufficientData::ForceZero,
                unusable: UnusableScore::Zero,
                transform: ScoreTransform::Log1p,
                lower_is_better: false,
            },
            _ => NormalizationPolicy::default(),
        }
    }
}

impl fmt::Display for CityAttributeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CityAttributeName {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == wanted)
            .ok_or_else(|| AppError::Config(format!("unknown attribute name: {value}")))
    }
}

/// Which rows take part in the min/max computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsableRows {
    NonNull,
    /// Excludes zero, which some sources use for "no coverage".
    StrictlyPositive,
}

impl UsableRows {
    pub fn accepts(&self, raw: Option<f64>) -> bool {
        match (self, raw) {
            (_, None) => false,
            (_, Some(value)) if value.is_nan() => false,
            (UsableRows::NonNull, Some(_)) => true,
            (UsableRows::StrictlyPositive, Some(value)) => value > 0.0,
        }
    }
}

/// What to do when fewer than two usable rows exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsufficientData {
    Abstain,
    ForceZero,
}

/// Score assigned to a row without a usable raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusableScore {
    Unchanged,
    Zero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreTransform {
    Linear,
    /// `ln(1 + x)`, for heavy-tailed distributions such as throughput.
    Log1p,
}

impl ScoreTransform {
    pub fn apply(&self, value: f64) -> f64 {
        match self {
            ScoreTransform::Linear => value,
            ScoreTransform::Log1p => value.ln_1p(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizationPolicy {
    pub usable: UsableRows,
    pub insufficient: InsufficientData,
    pub unusable: UnusableScore,
    pub transform: ScoreTransform,
    pub lower_is_better: bool,
}

impl Default for NormalizationPolicy {
    fn default() -> Self {
        Self {
            usable: UsableRows::NonNull,
            insufficient: InsufficientData::Abstain,
            unusable: UnusableScore::Unchanged,
            transform: ScoreTransform::Linear,
            lower_is_better: false,
        }
    }
}

/// How a source reports "success, but nothing measured".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoDataPolicy {
    /// Missing data is stored as `NULL` and excluded from normalization.
    Null,
    /// Missing coverage is a true zero measurement.
    Zero,
}

impl NoDataPolicy {
    pub fn value(&self) -> Option<f64> {
        match self {
            NoDataPolicy::Null => None,
            NoDataPolicy::Zero => Some(0.0),
        }
    }
}

/// A fetch job: one source feeding one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    AirQualityHistory,
    AirQualityLatest,
    InternetSpeed,
    UrbanGreenery,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::AirQualityHistory,
        JobKind::AirQualityLatest,
        JobKind::InternetSpeed,
        JobKind::UrbanGreenery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::AirQualityHistory => "air-quality",
            JobKind::AirQualityLatest => "air-quality-latest",
            JobKind::InternetSpeed => "internet-speed",
            JobKind::UrbanGreenery => "urban-greenery",
        }
    }

    pub fn attribute(&self) -> CityAttributeName {
        match self {
            JobKind::AirQualityHistory | JobKind::AirQualityLatest => {
                CityAttributeName::AirQuality
            }
            JobKind::InternetSpeed => CityAttributeName::InternetSpeed,
            JobKind::UrbanGreenery => CityAttributeName::UrbanGreenery,
        }
    }

    pub fn no_data(&self) -> NoDataPolicy {
        match self {
            JobKind::AirQualityHistory | JobKind::AirQualityLatest => NoDataPolicy::Null,
            JobKind::InternetSpeed | JobKind::UrbanGreenery => NoDataPolicy::Zero,
        }
    }

    /// Prefix for the job's environment overrides, e.g. `URBAN_GREENERY_DELAY_MS`.
    pub fn env_prefix(&self) -> String {
        self.as_str().replace('-', "_").to_ascii_uppercase()
    }

    pub fn ledger_file_name(&self) -> String {
        format!("{}_progress.log", self.as_str().replace('-', "_"))
    }

    /// The geospatial job recomputes every city from a local dataset and
    /// keeps no ledger.
    pub fn uses_ledger(&self) -> bool {
        !matches!(self, JobKind::InternetSpeed)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|job| job.as_str() == wanted)
            .ok_or_else(|| AppError::Config(format!("unknown job: {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_attribute_names_leniently() {
        assert_eq!(
            "internet-speed".parse::<CityAttributeName>().unwrap(),
            CityAttributeName::InternetSpeed
        );
        assert_eq!(
            " AIR_QUALITY ".parse::<CityAttributeName>().unwrap(),
            CityAttributeName::AirQuality
        );
        assert!("air quality".parse::<CityAttributeName>().is_err());
    }

    #[test]
    fn jobs_map_to_attributes_and_ledgers() {
        assert_eq!(
            "urban_greenery".parse::<JobKind>().unwrap(),
            JobKind::UrbanGreenery
        );
        assert_eq!(
            JobKind::AirQualityLatest.attribute(),
            CityAttributeName::AirQuality
        );
        assert_eq!(
            JobKind::AirQualityHistory.ledger_file_name(),
            "air_quality_progress.log"
        );
        assert_eq!(JobKind::UrbanGreenery.env_prefix(), "URBAN_GREENERY");
        assert!(!JobKind::InternetSpeed.uses_ledger());
    }

    #[test]
    fn no_data_policies_differ_by_source() {
        assert_eq!(JobKind::AirQualityHistory.no_data().value(), None);
        assert_eq!(JobKind::InternetSpeed.no_data().value(), Some(0.0));
    }

    #[test]
    fn strictly_positive_rows_exclude_zero_and_null() {
        let usable = UsableRows::StrictlyPositive;
        assert!(!usable.accepts(None));
        assert!(!usable.accepts(Some(0.0)));
        assert!(usable.accepts(Some(0.1)));
        assert!(UsableRows::NonNull.accepts(Some(0.0)));
        assert!(!UsableRows::NonNull.accepts(Some(f64::NAN)));
    }
}

//! Input rows and shared value types

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One scored runner as produced by the upstream feature/model pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerObservation {
    pub event_date: NaiveDate,
    pub race_id: String,
    pub runner_id: String,
    pub selection_id: u64,
    pub track: String,
    pub race_no: u32,
    /// Model win probability in [0, 1]
    pub model_prob: Option<f64>,
    /// Decimal win odds
    pub win_odds: Option<f64>,
    /// `None` until the race is resolved
    #[serde(default)]
    pub won_flag: Option<bool>,
    #[serde(default)]
    pub distance: Option<u32>,
    #[serde(default)]
    pub racing_type: Option<String>,
    #[serde(default)]
    pub race_type: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

/// Race distance buckets used for filtering and context insights
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DistanceBand {
    #[serde(rename = "<=1200")]
    UpTo1200,
    #[serde(rename = "1201-1600")]
    From1201To1600,
    #[serde(rename = "1601-2000")]
    From1601To2000,
    #[serde(rename = "2001-2400")]
    From2001To2400,
    #[serde(rename = "2400+")]
    Over2400,
}

impl DistanceBand {
    /// Band for a distance in metres. Zero is treated as unknown.
    pub fn from_distance(distance: u32) -> Option<Self> {
        match distance {
            0 => None,
            1..=1200 => Some(Self::UpTo1200),
            1201..=1600 => Some(Self::From1201To1600),
            1601..=2000 => Some(Self::From1601To2000),
            2001..=2400 => Some(Self::From2001To2400),
            _ => Some(Self::Over2400),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::UpTo1200 => "<=1200",
            Self::From1201To1600 => "1201-1600",
            Self::From1601To2000 => "1601-2000",
            Self::From2001To2400 => "2001-2400",
            Self::Over2400 => "2400+",
        }
    }
}

impl std::fmt::Display for DistanceBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Serde helpers for metrics that are NaN when there is no data.
///
/// serde_json already writes NaN as `null`; this reads `null` back as NaN
/// instead of failing.
pub(crate) mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

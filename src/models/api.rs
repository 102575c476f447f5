//! Wire models for the sensor range API.
//!
//! Range responses are kept as untyped JSON values and validated record by
//! record in `services::filter`; only the two catalog endpoints are decoded
//! into typed structs here.

use serde::Deserialize;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

// =====================
// Measurement types
// =====================

/// Range endpoint identifier for one category of sensor reading.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MeasurementType {
    InTemp,
    InHumid,
    InCo2,
    InPm25,
    InPm10,
    InTvoc,
    InLight,
    Motion,
    Pressure,
    Current,
    OccCount,
    Battery,
}

impl MeasurementType {
    pub const ALL: [MeasurementType; 12] = [
        MeasurementType::InTemp,
        MeasurementType::InHumid,
        MeasurementType::InCo2,
        MeasurementType::InPm25,
        MeasurementType::InPm10,
        MeasurementType::InTvoc,
        MeasurementType::InLight,
        MeasurementType::Motion,
        MeasurementType::Pressure,
        MeasurementType::Current,
        MeasurementType::OccCount,
        MeasurementType::Battery,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MeasurementType::InTemp => "intemp",
            MeasurementType::InHumid => "inhumid",
            MeasurementType::InCo2 => "inco2",
            MeasurementType::InPm25 => "inpm25",
            MeasurementType::InPm10 => "inpm10",
            MeasurementType::InTvoc => "intvoc",
            MeasurementType::InLight => "inlight",
            MeasurementType::Motion => "motion",
            MeasurementType::Pressure => "pressure",
            MeasurementType::Current => "current",
            MeasurementType::OccCount => "occcount",
            MeasurementType::Battery => "battery",
        }
    }

    /// Key of this type's row in `sync_checkpoint`.
    pub fn checkpoint_key(self) -> String {
        format!("base:{}", self.as_str())
    }
}

impl Display for MeasurementType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasurementType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        MeasurementType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("unknown measurement type: {}", s.trim()))
    }
}

// =====================
// Catalog payloads
// =====================

/// One element of the `/mim` response.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelInfo {
    #[serde(default, deserialize_with = "lenient_text")]
    pub measurement_label: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub measurement_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub zone_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub device_friendly_name: Option<String>,
}

/// One element of the `/aim` response.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default, deserialize_with = "lenient_text")]
    pub device_friendly_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub building: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub floor: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub room: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub device_class: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub mac_address: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub ip_address: Option<String>,
}

/// Accepts strings, numbers and booleans as text; `null` and blank strings become `None`.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct V;
    impl<'de> serde::de::Visitor<'de> for V {
        type Value = Option<String>;

        fn expecting(&self, f: &mut Formatter) -> fmt::Result {
            write!(f, "a string, number, boolean or null")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let trimmed = value.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Some(value.to_string()))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Some(value.to_string()))
        }

        fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Some(value.to_string()))
        }

        fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Some(value.to_string()))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(V)
}

//! Sensor readings and the device → host line decoder.
//!
//! The microcontroller prints one JSON object per line:
//!
//! ```text
//! {"soil1":900,"soil2":910,"soil3":905,"soil_avg":905,"temp":24.0,"hum":55,
//!  "water_level":1,"fan_status":0,"heater_status":0}
//! ```
//!
//! The firmware is trusted for value sanity but not for framing, so the
//! decoder only rejects lines it cannot read as an object at all.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// One persisted sensor snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Wall-clock seconds since the Unix epoch.
    pub timestamp: f64,
    pub soil_1: i64,
    pub soil_2: i64,
    pub soil_3: i64,
    pub soil_avg: i64,
    pub temperature: f64,
    pub humidity: f64,
    /// `false` means the tank is empty.
    pub water_level: bool,
    pub fan_status: bool,
    pub heater_status: bool,
}

impl Reading {
    pub fn soil_values(&self) -> [i64; 3] {
        [self.soil_1, self.soil_2, self.soil_3]
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed telemetry line: {0}")]
    Malformed(String),
}

/// Decode one line, stamping it with the current wall-clock time.
pub fn decode(line: &str) -> Result<Reading, DecodeError> {
    decode_at(line, now_unix_secs())
}

/// Decode one line with an explicit timestamp.
pub fn decode_at(line: &str, timestamp: f64) -> Result<Reading, DecodeError> {
    let value: Value =
        serde_json::from_str(line.trim()).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let Value::Object(fields) = value else {
        return Err(DecodeError::Malformed("payload is not a JSON object".into()));
    };

    // soil1 and temp are load-bearing: a line with neither is noise.
    if !present(&fields, "soil1") && !present(&fields, "temp") {
        return Err(DecodeError::Malformed(
            "neither soil1 nor temp present".into(),
        ));
    }

    Ok(Reading {
        timestamp,
        soil_1: int(&fields, "soil1"),
        soil_2: int(&fields, "soil2"),
        soil_3: int(&fields, "soil3"),
        soil_avg: int(&fields, "soil_avg"),
        temperature: float(&fields, "temp"),
        humidity: float(&fields, "hum"),
        water_level: flag(&fields, "water_level"),
        fan_status: flag(&fields, "fan_status"),
        heater_status: flag(&fields, "heater_status"),
    })
}

pub fn now_unix_secs() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn present(fields: &Map<String, Value>, key: &str) -> bool {
    fields.get(key).is_some_and(|v| !v.is_null())
}

/// Integral field; floats are truncated, anything non-numeric reads as 0.
fn int(fields: &Map<String, Value>, key: &str) -> i64 {
    match fields.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

fn float(fields: &Map<String, Value>, key: &str) -> f64 {
    match fields.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Firmware sends 0/1; JSON booleans are accepted too.
fn flag(fields: &Map<String, Value>, key: &str) -> bool {
    match fields.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

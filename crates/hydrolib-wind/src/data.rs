//! Wind measurements.

use std::time::SystemTime;

use hydrolib_core::error::{Error, Result};

/// Wind-speed calibration for the 05106 sensor: meters per second per
/// count.
const SPEED_PER_COUNT: f64 = 0.04903;

/// One wind reading, from either instrument. Fields an instrument cannot
/// supply are `NaN` (floats) or `-99` (voltage inputs).
#[derive(Debug, Clone)]
pub struct WindData {
    /// Wind speed in m/s.
    pub wind_speed_ms: f64,
    /// Wind direction in degrees, compass-corrected when a compass is
    /// present.
    pub wind_dir_deg: f64,
    /// Auxiliary voltage inputs (0-4000 counts), or a tipping-bucket
    /// count on VIN4.
    pub vin1: i32,
    /// See [`vin1`](WindData::vin1).
    pub vin2: i32,
    /// See [`vin1`](WindData::vin1).
    pub vin3: i32,
    /// See [`vin1`](WindData::vin1).
    pub vin4: i32,
    /// Compass heading in degrees.
    pub compass_deg: f64,
    /// Wind direction uncorrected by the compass, in degrees.
    pub wind_dir_uncorrected_deg: f64,
    /// Air temperature in degrees C.
    pub air_temp_c: f64,
    /// Barometric pressure in bar.
    pub air_pressure_bar: f64,
    /// Capture time.
    pub timestamp: SystemTime,
}

impl WindData {
    /// Parse a Young 32500 ASCII-mode record: 8 space-separated integers.
    ///
    /// Speed arrives in sensor counts and directions in tenths of a
    /// degree.
    pub fn from_ascii_record(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 8 {
            return Err(Error::InvalidInput(format!(
                "expected 8 fields, got {}",
                fields.len()
            )));
        }

        let mut parsed = [0f64; 8];
        for (i, field) in fields.iter().enumerate() {
            parsed[i] = field.parse::<f64>().map_err(|_| {
                Error::InvalidInput(format!("non-numeric field {i}: {field}"))
            })?;
        }

        Ok(Self {
            wind_speed_ms: parsed[0] * SPEED_PER_COUNT,
            wind_dir_deg: parsed[1] / 10.0,
            vin1: parsed[2] as i32,
            vin2: parsed[3] as i32,
            vin3: parsed[4] as i32,
            vin4: parsed[5] as i32,
            compass_deg: parsed[6] / 10.0,
            wind_dir_uncorrected_deg: parsed[7] / 10.0,
            air_temp_c: f64::NAN,
            air_pressure_bar: f64::NAN,
            timestamp: SystemTime::now(),
        })
    }

    /// Build a reading from a correlated NMEA sentence triple.
    ///
    /// - `$HCHDG`: field 1 is the compass heading.
    /// - `$WIMWD`: field 1 is true wind direction, field 7 wind speed in
    ///   m/s.
    /// - `$WIMDA`: field 3 is barometric pressure in bar, field 5 air
    ///   temperature in C.
    ///
    /// Empty fields become `NaN`.
    pub fn from_nmea_sentences(hchdg: &str, wimwd: &str, wimda: &str) -> Result<Self> {
        let heading = nmea_field(hchdg, 1)?;
        let wind_dir = nmea_field(wimwd, 1)?;
        let wind_speed = nmea_field(wimwd, 7)?;
        let pressure = nmea_field(wimda, 3)?;
        let temp = nmea_field(wimda, 5)?;

        Ok(Self {
            wind_speed_ms: wind_speed,
            wind_dir_deg: wind_dir,
            vin1: -99,
            vin2: -99,
            vin3: -99,
            vin4: -99,
            compass_deg: heading,
            wind_dir_uncorrected_deg: f64::NAN,
            air_temp_c: temp,
            air_pressure_bar: pressure,
            timestamp: SystemTime::now(),
        })
    }
}

/// Numeric field `index` of an NMEA sentence; empty fields are `NaN`.
fn nmea_field(sentence: &str, index: usize) -> Result<f64> {
    let raw = sentence
        .split(',')
        .nth(index)
        .ok_or_else(|| Error::InvalidInput(format!("sentence too short: {sentence}")))?;
    // The last field may carry the checksum suffix.
    let raw = raw.split('*').next().unwrap_or(raw).trim();
    if raw.is_empty() {
        return Ok(f64::NAN);
    }
    raw.parse()
        .map_err(|_| Error::InvalidInput(format!("non-numeric NMEA field: {raw}")))
}

//! EXO2 run-mode data records.
//!
//! The sonde's `para` command reports which parameter identifiers are in
//! the data stream; each run-mode record then carries a date, a time, and
//! one value per identifier, in that order. Identifier 240 (unfiltered
//! vertical position) is folded into 22 (depth in meters) so `depth_m`
//! always refers to the unfiltered value.

use std::time::SystemTime;

use hydrolib_core::error::{Error, Result};

/// Identifier folded into `22`/depth_m when present.
pub const VERTICAL_POSITION_ID: &str = "240";

/// EXO DCP parameter identifiers to field names.
static PARAMETER_NAMES: &[(&str, &str)] = &[
    ("1", "temp_c"),
    ("2", "temp_f"),
    ("3", "temp_k"),
    ("4", "cond_ms_cm"),
    ("5", "cond_us_cm"),
    ("6", "spcond_ms_cm"),
    ("7", "spcond_us_cm"),
    ("10", "tds_g_l"),
    ("12", "sal_ppt"),
    ("17", "ph_mv"),
    ("18", "ph"),
    ("19", "orp_mv"),
    ("20", "press_psia"),
    ("21", "press_psig"),
    ("22", "depth_m"),
    ("23", "depth_ft"),
    ("28", "battery_v"),
    ("37", "turbidity_ntu"),
    ("47", "nh4_n_mg_l"),
    ("48", "no3_n_mg_l"),
    ("51", "chloride_mg_l"),
    ("95", "do_pct_sat"),
    ("96", "do_mg_l"),
    ("230", "wiper_position_v"),
    ("231", "wiper_peak_ma"),
];

/// Field name for an EXO parameter identifier, if known.
pub fn parameter_name(id: &str) -> Option<&'static str> {
    PARAMETER_NAMES
        .iter()
        .find(|(pid, _)| *pid == id)
        .map(|(_, name)| *name)
}

/// One run-mode record: named values with the sonde's own date/time stamp
/// and the capture time. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Exo2Data {
    /// Sonde-reported date, `MM/DD/YY`.
    pub date: String,
    /// Sonde-reported time, `HH:MM:SS`.
    pub time: String,
    /// Values in stream order: `(field name, value)`. Unknown identifiers
    /// keep their numeric id as the name.
    pub values: Vec<(String, f64)>,
    /// Capture time on this machine.
    pub timestamp: SystemTime,
}

impl Exo2Data {
    /// Parse a run-mode record line against the identifier list from
    /// `para`.
    ///
    /// Record shape: optional prompt/star prefix, a `MMDDYY` date token, an
    /// `HHMMSS` time token, then one numeric value per identifier.
    pub fn parse(line: &str, identifiers: &[String]) -> Result<Self> {
        if identifiers.is_empty() {
            return Err(Error::InvalidInput(
                "parameter identifiers not yet known".into(),
            ));
        }

        let stripped = line.trim_start_matches(['#', '*']).trim();
        let fields: Vec<&str> = stripped.split_whitespace().collect();
        if fields.len() < identifiers.len() + 2 {
            return Err(Error::InvalidInput(format!(
                "expected {} fields, got {}",
                identifiers.len() + 2,
                fields.len()
            )));
        }

        let date = format_date(fields[0])?;
        let time = format_time(fields[1])?;

        let mut values = Vec::with_capacity(identifiers.len());
        for (id, raw) in identifiers.iter().zip(&fields[2..]) {
            let value: f64 = raw.parse().map_err(|_| {
                Error::InvalidInput(format!("unparseable value for parameter {id}: {raw}"))
            })?;
            let name = parameter_name(id).map(str::to_string).unwrap_or_else(|| id.clone());
            values.push((name, value));
        }

        Ok(Self {
            date,
            time,
            values,
            timestamp: SystemTime::now(),
        })
    }

    /// Value of a named field, if present in this record.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }
}

fn format_date(token: &str) -> Result<String> {
    if token.len() != 6 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidInput(format!("bad date token: {token}")));
    }
    Ok(format!("{}/{}/{}", &token[0..2], &token[2..4], &token[4..6]))
}

fn format_time(token: &str) -> Result<String> {
    if token.len() != 6 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidInput(format!("bad time token: {token}")));
    }
    Ok(format!("{}:{}:{}", &token[0..2], &token[2..4], &token[4..6]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_prompt_prefixed_record() {
        let identifiers = ids(&["1", "12", "22"]);
        let data = Exo2Data::parse("# 091715 093649 22.54 18.3 1.207", &identifiers).unwrap();

        assert_eq!(data.date, "09/17/15");
        assert_eq!(data.time, "09:36:49");
        assert_eq!(data.value("temp_c"), Some(22.54));
        assert_eq!(data.value("sal_ppt"), Some(18.3));
        assert_eq!(data.value("depth_m"), Some(1.207));
    }

    #[test]
    fn unknown_identifier_keeps_numeric_name() {
        let identifiers = ids(&["1", "999"]);
        let data = Exo2Data::parse("091715 093649 20.0 5.5", &identifiers).unwrap();
        assert_eq!(data.value("999"), Some(5.5));
    }

    #[test]
    fn short_record_is_invalid_input() {
        let identifiers = ids(&["1", "12", "22"]);
        let result = Exo2Data::parse("# 091715 093649 22.54", &identifiers);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn garbled_value_is_invalid_input() {
        let identifiers = ids(&["1"]);
        let result = Exo2Data::parse("091715 093649 n/a", &identifiers);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn no_identifiers_is_invalid_input() {
        let result = Exo2Data::parse("091715 093649 20.0", &[]);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn parameter_name_lookup() {
        assert_eq!(parameter_name("22"), Some("depth_m"));
        assert_eq!(parameter_name("96"), Some("do_mg_l"));
        assert_eq!(parameter_name("31415"), None);
    }
}

//! Sampler identity and status records.

use std::time::SystemTime;

use hydrolib_core::error::{Error, Result};

/// Sample status code meaning a sample is currently being drawn.
pub const SAMPLE_IN_PROGRESS: i32 = 12;

/// Everything known about the sampler: banner identity plus the fields of
/// the most recent status reply.
#[derive(Debug, Clone, Default)]
pub struct IscoData {
    /// Model number from the banner (e.g. `6712`).
    pub model: Option<String>,
    /// Hardware revision from the banner.
    pub hardware_revision: Option<String>,
    /// Software revision from the banner.
    pub software_revision: Option<String>,
    /// Unit ID from the banner.
    pub id: Option<String>,
    /// When the last status reply was parsed.
    pub status_timestamp: Option<SystemTime>,
    /// Instrument-reported clock in the status reply.
    pub status_time: Option<f64>,
    /// Sampler status code.
    pub status: Option<i32>,
    /// Instrument-reported time of the last sample.
    pub sample_time: Option<f64>,
    /// Bottle number of the last sample.
    pub bottle: Option<i32>,
    /// Volume of the last sample in milliliters.
    pub sample_volume: Option<i32>,
    /// Status code of the last sample.
    pub sample_status: Option<i32>,
}

impl IscoData {
    /// Whether a sample is currently being drawn.
    pub fn sample_in_progress(&self) -> bool {
        self.sample_status == Some(SAMPLE_IN_PROGRESS)
    }

    /// Parse the power-on banner into the identity fields.
    ///
    /// Banner shape (11 whitespace tokens):
    /// `ISCO Model 6712 HW Rev A Software Rev 1.20 ID 42`
    pub fn parse_banner(&mut self, banner: &str) {
        let tokens: Vec<&str> = banner.split_whitespace().collect();
        if tokens.len() == 11 {
            self.model = Some(tokens[2].to_string());
            self.hardware_revision = Some(tokens[5].to_string());
            self.software_revision = Some(tokens[8].to_string());
            self.id = Some(tokens[10].to_string());
        }
    }

    /// Parse a status reply into the status fields.
    ///
    /// Two shapes exist: 10 comma-separated tokens when no sample
    /// information is available, 18 when it is:
    ///
    /// ```text
    /// MO,6712,ID,42,TI,123.456,STS,1,MM,0
    /// MO,6712,ID,42,TI,123.456,STS,1,STI,120.1,BTL,3,SVO,1000,SST,12,CS,3F
    /// ```
    pub fn parse_status(&mut self, reply: &str) -> Result<()> {
        let tokens: Vec<&str> = reply.split(',').map(str::trim).collect();
        if tokens.len() != 10 && tokens.len() != 18 {
            return Err(Error::InvalidInput(format!(
                "status reply has {} tokens",
                tokens.len()
            )));
        }

        self.status_timestamp = Some(SystemTime::now());
        self.model = Some(tokens[1].to_string());
        self.id = Some(tokens[3].to_string());
        self.status_time = tokens[5].parse().ok();
        self.status = tokens[7].parse().ok();

        // Defaults until a fuller reply says otherwise.
        self.sample_time = Some(0.0);
        self.bottle = Some(0);
        self.sample_volume = Some(0);
        self.sample_status = Some(0);

        if tokens.len() == 18 {
            self.sample_time = tokens[9].parse().ok();
            self.bottle = tokens[11].parse().ok();
            self.sample_volume = tokens[13].parse().ok();
            self.sample_status = tokens[15].parse().ok();
        }
        Ok(())
    }
}

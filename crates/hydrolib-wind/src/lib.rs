//! hydrolib-wind: wind instrument drivers.
//!
//! Two very different instruments produce the same [`WindData`]
//! measurement:
//!
//! - [`Young32500`](young::Young32500) -- a compass/anemometer interface
//!   with a menu- or command-line-driven ASCII protocol and 8-integer data
//!   records at a configurable output rate.
//! - [`AirmarWind`](nmea::AirmarWind) -- a weather station streaming NMEA
//!   sentences; a reading is emitted once a heading, wind, and
//!   meteorological sentence have all arrived.
//!
//! Both stream continuously once sampling: each classified record is
//! dispatched to listeners straight from the reader task.

pub mod data;
pub mod nmea;
pub mod young;

pub use data::WindData;
pub use nmea::{nmea_checksum, AirmarBuilder, AirmarWind};
pub use young::{Damping, OutputRate, Young32500, YoungBuilder, YoungState};

//! # hydrolib -- Instrument Control for Hydrographic Field Platforms
//!
//! `hydrolib` is an asynchronous Rust library for driving the dissimilar
//! field instruments of an autonomous profiling platform: a winch motor
//! controller, a multi-parameter water-quality sonde, wind sensors, a
//! depth sounder, and an automated water sampler. Every instrument is a
//! byte stream over a TCP socket (usually a serial bridge), and every one
//! speaks its own wire protocol -- binary and checksummed, line-oriented
//! ASCII with heuristic prompts, or streaming NMEA sentences.
//!
//! What they share is the hard part, and what this library provides:
//! correlating asynchronous byte arrival with synchronous command/response
//! semantics, under unreliable links, while tracking each instrument's
//! operating mode as a state machine and recovering automatically from
//! faults.
//!
//! ## Quick Start
//!
//! ```no_run
//! use hydrolib::Instrument;
//! use hydrolib::motionmind::Mm3Builder;
//!
//! #[tokio::main]
//! async fn main() -> hydrolib::Result<()> {
//!     let motor = Mm3Builder::new()
//!         .endpoint("profiler.example.org:55232")
//!         .build()?;
//!     motor.connect().await?;
//!
//!     motor.move_at(250).await?;
//!     let snapshot = motor.read(&["position", "velocity", "amps"]).await?;
//!     println!("position: {}", snapshot.values["position"]);
//!
//!     motor.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized as a workspace of focused crates:
//!
//! | Crate                   | Purpose                                      |
//! |-------------------------|----------------------------------------------|
//! | `hydrolib-core`         | Traits ([`Instrument`], [`Transport`]), expect engine, reader loop, errors |
//! | `hydrolib-transport`    | TCP transport and connector                  |
//! | `hydrolib-motionmind`   | MotionMind 3 motor controller (binary frames)|
//! | `hydrolib-exo`          | YSI EXO2 sonde (line protocol)               |
//! | `hydrolib-wind`         | Young 32500 and Airmar NMEA wind drivers     |
//! | `hydrolib-seatalk`      | SeaTalk depth sounder (binary packets)       |
//! | `hydrolib-isco`         | Isco water sampler (line protocol)           |
//! | **`hydrolib`**          | This facade crate -- re-exports everything   |
//!
//! All drivers implement the [`Instrument`] trait, so supervisory code can
//! hold a fleet of `dyn Instrument` and drive connection lifecycle,
//! sampling, and soft resets uniformly.
//!
//! ## Feature Flags
//!
//! Each driver is gated behind a feature flag, all enabled by default:
//! `motionmind`, `exo`, `wind`, `seatalk`, `isco`.
//!
//! ## Listeners and the collecting gate
//!
//! Streaming drivers deliver each parsed measurement to registered
//! listeners straight from the reader task; request/response drivers
//! return measurements from the command call. Delivery is suppressed
//! while the platform's shared
//! [`CollectingGate`](hydrolib_core::CollectingGate) is disarmed -- the
//! gate is owned by the supervising broker, not by this library.

pub use hydrolib_core::*;

/// TCP transport and connector.
pub mod transport {
    pub use hydrolib_transport::*;
}

/// MotionMind 3 motor controller backend.
///
/// Binary request/response frames with an additive checksum and a
/// 32-register file, fronted by a poll-period register cache.
#[cfg(feature = "motionmind")]
pub mod motionmind {
    pub use hydrolib_motionmind::*;
}

/// YSI EXO2 sonde backend.
///
/// Line protocol behind a `#` prompt; expect-based commands and streaming
/// run-mode records.
#[cfg(feature = "exo")]
pub mod exo {
    pub use hydrolib_exo::*;
}

/// Wind instrument backends: Young 32500 (menu/command-line ASCII) and
/// Airmar NMEA.
#[cfg(feature = "wind")]
pub mod wind {
    pub use hydrolib_wind::*;
}

/// SeaTalk depth sounder backend (binary packets, always streaming).
#[cfg(feature = "seatalk")]
pub mod seatalk {
    pub use hydrolib_seatalk::*;
}

/// Isco water sampler backend (line protocol with status polling).
#[cfg(feature = "isco")]
pub mod isco {
    pub use hydrolib_isco::*;
}

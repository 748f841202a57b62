//! hydrolib-exo: YSI EXO2 multi-parameter sonde driver.
//!
//! The EXO2 speaks a line-oriented command protocol over its DCP adapter:
//! commands are short words terminated by CR, replies are free-form text
//! lines, and the `#` prompt marks the end of every reply. In run mode the
//! sonde streams one record per sample interval, each a timestamp followed
//! by one value per configured parameter.
//!
//! The driver keeps the sonde's state (`Unknown` / `MenuMain` /
//! `Operating`) from observed traffic and correlates every command through
//! the expect engine: send, then wait for the prompt to land in the line
//! buffer.
//!
//! # Example
//!
//! ```no_run
//! use hydrolib_core::Instrument;
//! use hydrolib_exo::Exo2Builder;
//!
//! # async fn example() -> hydrolib_core::Result<()> {
//! let sonde = Exo2Builder::new()
//!     .endpoint("profiler.example.org:55233")
//!     .build()?;
//! sonde.connect().await?;
//!
//! let sn = sonde.serial_number().await?;
//! sonde.start_sampling().await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod data;
pub mod driver;

pub use builder::Exo2Builder;
pub use data::{parameter_name, Exo2Data};
pub use driver::{Exo2, ExoState};

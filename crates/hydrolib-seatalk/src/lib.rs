//! hydrolib-seatalk: SeaTalk depth sounder driver.
//!
//! The sounder (tested against a Raymarine ST40) transmits binary packets
//! in bursts and accepts no commands at all: it is always sampling. Only
//! the depth packet is decoded; other packet types resynchronize the
//! stream by discarding buffered bytes until a silence gap.
//!
//! # Example
//!
//! ```no_run
//! use hydrolib_core::Instrument;
//! use hydrolib_seatalk::SeaTalkBuilder;
//!
//! # async fn example() -> hydrolib_core::Result<()> {
//! let sounder = SeaTalkBuilder::new()
//!     .endpoint("profiler.example.org:55231")
//!     .build()?;
//! sounder.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod data;
pub mod driver;

pub use data::SounderData;
pub use driver::{SeaTalkBuilder, SeaTalkSounder, SounderState};

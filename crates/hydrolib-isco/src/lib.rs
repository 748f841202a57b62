//! hydrolib-isco: Isco automated water sampler driver.
//!
//! The sampler (a 6712-class unit behind a serial/TCP bridge) speaks a
//! terse line protocol: `???` wakes it and produces a banner, a bare CRLF
//! produces the `>` prompt once the banner is known, and the `STS`/`BTL`
//! commands return comma-separated status strings. Request/response only,
//! plus a background watcher that polls status once a second while a
//! sample is being drawn and notifies listeners when it completes.
//!
//! # Example
//!
//! ```no_run
//! use hydrolib_core::Instrument;
//! use hydrolib_isco::IscoBuilder;
//!
//! # async fn example() -> hydrolib_core::Result<()> {
//! let sampler = IscoBuilder::new()
//!     .endpoint("profiler.example.org:55235")
//!     .build()?;
//! sampler.connect().await?;
//!
//! sampler.take_sample(3, 1000).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod data;
pub mod driver;

pub use builder::IscoBuilder;
pub use data::{IscoData, SAMPLE_IN_PROGRESS};
pub use driver::Isco;

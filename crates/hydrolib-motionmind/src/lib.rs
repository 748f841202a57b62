//! hydrolib-motionmind: MotionMind 3 motor controller driver.
//!
//! The MotionMind 3 is the winch motor controller. It speaks a binary
//! request/response protocol: fixed-layout frames with a trailing additive
//! checksum, a device address for multi-drop buses, and a register file of
//! 32 named values (position, velocity, PID terms, status flags) addressed
//! by position and fixed width.
//!
//! The driver is strictly request/response -- the controller never speaks
//! unsolicited -- so there is no background reader task; replies are read
//! as byte bursts directly after each send, with bounded retries and
//! checksum verification.
//!
//! # Example
//!
//! ```no_run
//! use hydrolib_core::Instrument;
//! use hydrolib_motionmind::Mm3Builder;
//!
//! # async fn example() -> hydrolib_core::Result<()> {
//! let motor = Mm3Builder::new()
//!     .endpoint("profiler.example.org:55232")
//!     .build()?;
//! motor.connect().await?;
//!
//! motor.move_at(250).await?;
//! let snapshot = motor.read(&["position", "amps"]).await?;
//! motor.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod cache;
pub mod driver;
pub mod frame;
pub mod registers;

pub use builder::Mm3Builder;
pub use cache::RegisterCache;
pub use driver::{MotionMind3, RegisterSnapshot};
pub use registers::{register, RegisterDescriptor, REGISTERS};

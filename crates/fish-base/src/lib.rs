//! Shared primitives used by every Aquarium Fish crate: a time-ordered
//! unique identifier, timestamp helpers, a coarse error-kind marker, and
//! a small cancellation token used to thread shutdown through the
//! per-Application and per-peer worker tasks.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod cancel;
pub mod error;
pub mod time;
pub mod uid;

pub mod prelude {
    //! Convenience re-exports for downstream crates.
    pub use crate::cancel::CancellationToken;
    pub use crate::error::ErrorKind;
    pub use crate::time::now;
    pub use crate::uid::Uid;
}

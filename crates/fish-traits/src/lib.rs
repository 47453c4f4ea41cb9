//! Domain model and capability traits shared by every Aquarium Fish
//! crate. Everything in [`model`] is a plain, serializable value type
//! owned exclusively by `fish-storage`; everything in [`driver`] is the
//! small capability interface drivers implement to plug into the
//! lifecycle engine.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod driver;
pub mod model;

pub mod prelude {
    //! Convenience re-exports for downstream crates.
    pub use crate::driver::{Driver, DriverError, Task};
    pub use crate::model::*;
}

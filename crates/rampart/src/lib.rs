//! Rampart is an embeddable HTTP/1.1 and HTTP/2 server library with its own
//! wire protocol engine.
//!
//! This crate re-exports [`rampart_core`]; see that crate for the full
//! documentation.

pub use rampart_core as core;
#[doc(no_inline)]
pub use rampart_core::*;

/// A list of things that every application handler needs.
pub mod prelude {
    pub use rampart_core::prelude::*;
}

//! Testing helpers for use writing unit and integration tests of the `ossdirect` crate
//!
//! This is internal to `ossdirect` and is not intended for use by any other crates.  Breaking
//! changes can be made at any time.  The only reason this is published at all is that `cargo
//! publish` requires that all `dev-dependencies` be resolvable in the public registry.
pub mod fake_store;
pub mod logging;
pub mod test_data;

pub use fake_store::{FakeObjectStore, PartFault};

/// Test code that reports errors can just cheat and use `eyre`
pub type Result<T> = color_eyre::Result<T>;

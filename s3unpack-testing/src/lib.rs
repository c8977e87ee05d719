//! Testing helpers for use writing unit and integration tests of the `s3unpack` crate
//!
//! This is internal to `s3unpack` and is not intended for use by any other crates.  Breaking
//! changes can be made at any time.  The only reason this is published at all is that `cargo
//! publish` requires that all `dev-dependencies` be resolvable in the public registry.
pub mod archives;
pub mod logging;
pub mod memory;
pub mod minio;

/// Test code that reports errors can just cheat and use `eyre`
pub type Result<T> = color_eyre::Result<T>;

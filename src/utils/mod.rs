//! The `utils` module holds the pieces shared by every other module: the
//! error types each layer returns and the `tracing` subscriber setup.

pub mod error;
pub mod logging;

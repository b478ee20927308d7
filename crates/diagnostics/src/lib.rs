//! Error reporting and tracing setup shared by the knit crates.

mod local_tracing;

pub use local_tracing::enable_tracing_by_env;
pub use miette;
pub use tracing;

/// Error report of a failed operation, rendered with its diagnostic code and help.
pub type Report = miette::Report;
pub type Result<T> = miette::Result<T>;

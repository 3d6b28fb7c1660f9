//! service-core: Shared infrastructure for the auth-core workspace.
pub mod config;
pub mod error;
pub mod observability;

pub use error::AppError;
pub use tracing;

//! Script gateway domain logic.
//!
//! Pure engine code with no HTTP concerns: configuration, error types, and
//! the [`scripting`] module tree that discovers units, installs their
//! dependency sets, extracts parameter schemas and supervises execution.

pub mod config;
pub mod error;
pub mod hashing;
pub mod scripting;
pub mod types;

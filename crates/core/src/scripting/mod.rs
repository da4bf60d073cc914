//! Script registration and execution engine.
//!
//! Discovery of runnable units, schema introspection, content-addressed
//! dependency installation, per-unit environments and supervised execution.
//! Everything here is free of HTTP concerns; the API crate wires it up.

pub mod cache;
pub mod deps;
pub mod environment;
pub mod extractor;
pub mod ignore;
pub mod installer;
pub mod result;
pub mod runtime;
pub mod scanner;
pub mod schema;
pub mod subprocess;
pub mod supervisor;
pub mod unit;

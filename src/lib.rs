//! Neighborhood watch library
//!
//! Exposes modules for integration testing and binary reuse.

pub mod cache;
pub mod domain;
pub mod infra;
pub mod io;
pub mod services;

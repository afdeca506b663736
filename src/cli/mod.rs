//! CLI command implementations.

pub mod openapi;
pub mod parsers;
pub mod policy;
pub mod serve;

//! Application-level error reporting shared by every HTTP surface.

pub mod error;

//! Strategy-driven read-through caching, tag invalidation and cache-header
//! synthesis, with AEAD sealing for direct messages.

pub mod application;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod infra;

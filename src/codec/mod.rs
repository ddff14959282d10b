//! Codec module - conversion between Rust types and message values.
//!
//! - [`JsonCodec`] - `serde_json` conversion for params and results
//!
//! # Design
//!
//! Codecs are marker structs with static methods rather than trait objects,
//! so the conversion is resolved at compile time at each call site.

mod json;

pub use json::JsonCodec;

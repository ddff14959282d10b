//! Handler module - method registration and dispatch.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps method names to handlers
//! - [`TypedHandler`] / [`RawHandler`] - adapters from async functions
//!
//! A handler's `Ok` value becomes the call result. Its `Err` becomes an RPC
//! error whose message is the error's `Display` text.
//!
//! # Example
//!
//! ```
//! use nodelink::handler::{BoxError, HandlerRegistry};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! // Typed params and result
//! registry.register("echo", |params: serde_json::Value| async move {
//!     Ok::<_, BoxError>(params)
//! });
//!
//! // Raw params
//! registry.register_raw("inspect", |params| async move {
//!     Ok::<_, BoxError>(serde_json::json!({ "had_params": params.is_some() }))
//! });
//! ```

mod registry;

pub use registry::{
    BoxError, BoxFuture, Handler, HandlerRegistry, HandlerResult, RawHandler, TypedHandler,
};

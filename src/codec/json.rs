//! JSON codec between call-site types and the wire value model.
//!
//! # Example
//!
//! ```
//! use nodelink::codec::JsonCodec;
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct Add {
//!     a: i32,
//!     b: i32,
//! }
//!
//! let params = JsonCodec::to_params(&Add { a: 1, b: 2 }).unwrap().unwrap();
//! assert_eq!(params["a"], 1);
//!
//! // Unit means "no params".
//! assert!(JsonCodec::to_params(&()).unwrap().is_none());
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{NodelinkError, Result};
use crate::protocol::Params;

/// JSON codec for call params and results.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value into the value model.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
        Ok(serde_json::to_value(value)?)
    }

    /// Decode a value into `T`.
    ///
    /// # Errors
    ///
    /// Returns error if the value does not match `T`.
    #[inline]
    pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
        Ok(serde_json::from_value(value)?)
    }

    /// Convert call params into a params object.
    ///
    /// Objects become `Some`. Null (and `()`) becomes `None`. Anything
    /// else is rejected, since params are always named.
    pub fn to_params<T: Serialize + ?Sized>(params: &T) -> Result<Option<Params>> {
        match Self::encode(params)? {
            Value::Object(map) => Ok(Some(map)),
            Value::Null => Ok(None),
            other => Err(NodelinkError::InvalidParams(format!(
                "expected an object, got {}",
                kind(&other)
            ))),
        }
    }

    /// Convert received params into `T`. Missing params decode from null.
    pub fn from_params<T: DeserializeOwned>(params: Option<Params>) -> Result<T> {
        let value = params.map(Value::Object).unwrap_or(Value::Null);
        Self::decode(value)
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

//! Protocol module - framing and message types.
//!
//! This module implements the wire protocol:
//! - `[START: n]` / `[END: n]` frame encoding
//! - Frame buffer for reassembling frames from partial reads
//! - Request, notify and response messages

mod frame;
mod frame_buffer;
mod message;

pub use frame::{
    encode_frame, encode_frame_with_tag, random_tag, Frame, END_PREFIX, MARKER_SUFFIX,
    START_PREFIX, TAG_LIMIT,
};
pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_BUFFERED};
pub use message::{
    Message, Params, Request, RequestId, Response, RpcError, HANDLER_CAPACITY, HANDLER_ERROR,
    INTERNAL_ERROR, METHOD_NOT_FOUND,
};

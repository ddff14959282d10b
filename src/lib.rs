//! # nodelink
//!
//! Bidirectional JSON-RPC between a host application and an embedded script
//! runtime over a local socket.
//!
//! ## Architecture
//!
//! - **Transport**: Unix domain socket (named pipe on Windows), written in
//!   chunks of at most 4096 bytes
//! - **Framing**: every message is wrapped as `[START: n]<json>[END: n]`
//! - **Messages**: requests, notifies (requests without an id) and responses
//! - **Communicator**: queues outbound frames, matches responses to
//!   outstanding requests, and runs handlers for incoming calls
//!
//! Either side may call the other. A call made before the peer has
//! connected is queued and sent once it does.
//!
//! ## Example
//!
//! ```ignore
//! use nodelink::Communicator;
//! use tokio::process::Command;
//!
//! #[tokio::main]
//! async fn main() -> nodelink::Result<()> {
//!     let mut node = Command::new("node");
//!     node.arg("bridge.js");
//!
//!     let host = Communicator::builder()
//!         .method("log", |entry: serde_json::Value| async move {
//!             println!("{}", entry);
//!             Ok::<_, nodelink::handler::BoxError>(())
//!         })
//!         .launch(node)
//!         .await?;
//!
//!     let version: String = host.request("version", &()).await?;
//!     println!("runtime {}", version);
//!
//!     host.terminate().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod runtime;
pub mod transport;
pub mod writer;

mod communicator;
mod pending;

pub use communicator::{
    Communicator, CommunicatorBuilder, DEFAULT_MAX_CONCURRENT_HANDLERS, DEFAULT_SOCKET_PREFIX,
};
pub use error::{NodelinkError, Result};
pub use protocol::{Message, Params, Request, RequestId, Response, RpcError};
pub use runtime::PeerProcess;
pub use transport::ConnectionState;

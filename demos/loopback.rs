//! Loopback - host and peer in one process.
//!
//! This example demonstrates:
//! - Listening on a generated socket path
//! - Queueing calls before the peer has connected
//! - Calls in both directions over one connection
//!
//! ```sh
//! RUST_LOG=nodelink=debug cargo run --example loopback
//! ```

use nodelink::handler::BoxError;
use nodelink::Communicator;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Deserialize, Debug)]
struct Greet {
    name: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct Greeting {
    text: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let host = Communicator::builder()
        .method("log", |entry: serde_json::Value| async move {
            println!("[peer] {}", entry["line"]);
            Ok::<_, BoxError>(())
        })
        .listen()?;

    let path = host
        .socket_path()
        .map(|p| p.to_path_buf())
        .ok_or("host has no socket path")?;
    println!("listening on {}", path.display());

    // Sent once the peer shows up.
    host.notify("status", &json!({ "state": "ready" })).await?;
    let pending = {
        let host = host.clone();
        tokio::spawn(async move { host.request::<_, Greeting>("greet", &json!({"name": "host"})).await })
    };

    let peer = Communicator::builder()
        .method("status", |p: serde_json::Value| async move {
            println!("[host] status {}", p["state"]);
            Ok::<_, BoxError>(())
        })
        .method("greet", |p: Greet| async move {
            Ok::<_, BoxError>(Greeting {
                text: format!("hello, {}", p.name),
            })
        })
        .connect(&path)
        .await?;

    let greeting = pending.await??;
    println!("[host] {}", greeting.text);

    // A request, so the line is printed before shutdown.
    peer.request::<_, ()>("log", &json!({ "line": "peer is up" })).await?;

    host.terminate().await;
    peer.wait_closed().await;
    Ok(())
}

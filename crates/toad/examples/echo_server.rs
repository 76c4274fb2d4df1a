//! An echo server: every text message is answered with "You said: ...".
//!
//! Connect with any WebSocket client to ws://127.0.0.1:1701/.

use toad::{Server, ServerConfig};

#[tokio::main]
async fn main() -> toad::Result<()> {
    tracing_subscriber::fmt::init();

    let server: Server = Server::new(ServerConfig::new("127.0.0.1", 1701));
    server.hub().on_message(|target, message| {
        let client = target.client();
        let reply = match message.as_text() {
            Some(text) => client.send(format!("You said: {text}")),
            None => client.send(message.as_bytes().to_vec()),
        };
        if let Err(e) = reply {
            tracing::error!("Error replying to client {}: {e}", client.id());
        }
        None
    });

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

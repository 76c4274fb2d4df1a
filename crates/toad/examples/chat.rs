//! A chat room. Every client gets a nickname when it connects, every message
//! is broadcast to the room, and the room announces who is online every ten
//! seconds.
//!
//! Send `/quit` to leave.

use std::time::Duration;

use toad::{Server, ServerConfig, Stop};

#[tokio::main]
async fn main() -> toad::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::new("127.0.0.1", 1702).with_tick(Duration::from_secs(10));
    let server: Server<String> = Server::new(config);

    server
        .hub()
        .on_open(|client| Some(format!("toad-{}", client.id())))
        .on_message({
            let hub = server.hub().clone();
            move |target, message| {
                let nick = target.session().map_or("anonymous", String::as_str);
                match message.as_text() {
                    Some("/quit") => Some(Stop),
                    Some(text) => {
                        hub.send_all(format!("{nick}: {text}"));
                        None
                    }
                    None => None,
                }
            }
        })
        .on_close({
            let hub = server.hub().clone();
            move |target| {
                if let Some(nick) = target.session() {
                    hub.send_all(format!("{nick} left"));
                }
            }
        })
        .on_tick(|hub| {
            let online = hub.open_clients().len();
            hub.send_all(format!("{online} online"));
        });

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

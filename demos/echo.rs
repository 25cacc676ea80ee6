use anyhow::{Context, Result};
use tokio::net::TcpListener;

#[derive(argh::FromArgs)]
#[argh(description = "websocket echo server")]
struct Args {
    #[argh(
        option,
        description = "address to bind to",
        default = "String::from(\"127.0.0.1:9001\")"
    )]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args: Args = argh::from_env();

    let listener = TcpListener::bind(&args.bind).await.context("bind")?;
    tracing::info!(addr = %args.bind, "listening");

    loop {
        let (stream, peer_addr) = listener.accept().await.context("accept")?;

        tokio::spawn(async move {
            let mut ws = scheelite::WebSocket::server(stream);
            if let Err(err) = ws.accept().await {
                tracing::warn!(%peer_addr, error = %err, "handshake failed");
                return;
            }

            tracing::info!(%peer_addr, "client connected");
            match ws.serve(Some).await {
                Ok(()) => tracing::info!(%peer_addr, "client disconnected"),
                Err(err) => tracing::warn!(%peer_addr, error = %err, "connection error"),
            }
        });
    }
}

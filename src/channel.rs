use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use log::{debug, error, info};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::ChannelConfig;
use crate::messages::ChannelEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Owns the single push channel to the backend. Reconnects after a fixed
/// delay on every close, keeps the connection alive with periodic pings, and
/// fans inbound frames out to subscribers. Constructed once per session and
/// passed around explicitly.
pub struct ChannelManager {
    config: ChannelConfig,
    tx: broadcast::Sender<ChannelEvent>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ChannelManager {
    pub fn new(config: ChannelConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        let (tx, _) = broadcast::channel(64);
        let (ready_tx, ready_rx) = watch::channel(false);
        ChannelManager {
            config,
            tx,
            ready_tx,
            ready_rx,
            shutdown_rx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.tx.subscribe()
    }

    /// Current connection readiness, for callers that defer work until the
    /// channel is open.
    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    /// Connect, serve, reconnect. Returns only on shutdown.
    pub async fn run(mut self) {
        let delay = Duration::from_secs(self.config.reconnect_delay_seconds());
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
                Ok((ws, _)) => {
                    info!("Channel open to {}", self.config.url);
                    let _ = self.ready_tx.send(true);
                    let _ = self.tx.send(ChannelEvent::Open);

                    let shutting_down = self.serve(ws).await;

                    let _ = self.ready_tx.send(false);
                    let _ = self.tx.send(ChannelEvent::Closed);
                    if shutting_down {
                        break;
                    }
                }
                Err(err) => {
                    error!("Channel connect to {} failed: {:?}", self.config.url, err);
                }
            }

            // One reconnect per close, fixed delay, no backoff.
            debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                res = self.shutdown_rx.changed() => {
                    if res.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Channel manager stopped");
    }

    /// Serve one connection until it closes. Returns true if we are shutting
    /// down and must not reconnect.
    async fn serve(&mut self, ws: WsStream) -> bool {
        let (mut sink, mut stream) = ws.split();

        // Scoped to this connection, so it dies with it on close.
        let period = Duration::from_secs(self.config.keep_alive_seconds());
        let mut keep_alive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = keep_alive.tick() => {
                    if let Err(err) = sink.send(Message::Text("ping".into())).await {
                        error!("Keep-alive send failed: {:?}", err);
                        return false;
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if self.tx.send(ChannelEvent::Frame(text.to_string())).is_err() {
                            debug!("No subscribers for inbound frame");
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Channel closed by backend");
                        return false;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        // Errors take the same path as a clean close.
                        error!("Channel error: {:?}", err);
                        return false;
                    }
                    None => {
                        info!("Channel stream ended");
                        return false;
                    }
                },
                res = self.shutdown_rx.changed() => {
                    if res.is_err() || *self.shutdown_rx.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        return true;
                    }
                }
            }
        }
    }
}

//! WebSocket market data client
//!
//! Connection state machine: Connecting → Handshaking → Connected ↔
//! Reconnecting → Closed. Reconnects use full-jitter exponential backoff
//! capped at 30s. Heartbeats ping every 30s; a missed pong within 10s
//! forces a reconnect. After (re)connecting, the decoder's sync state
//! decides which symbols need a snapshot+replay handshake.

use crate::decoder::FeedDecoder;
use common::retry::{Backoff, RetryPolicy};
use common::{MarketEvent, Symbol, Ts};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, interval};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// TCP/TLS connect in progress
    Connecting,
    /// Connected, replaying snapshots
    Handshaking,
    /// Streaming
    Connected,
    /// Backing off before another connect
    Reconnecting,
    /// Shut down
    Closed,
}

/// Client tuning knobs
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// Outbound ping cadence
    pub ping_interval: Duration,
    /// Pong deadline after a ping
    pub pong_timeout: Duration,
    /// Reconnect backoff policy
    pub backoff: RetryPolicy,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            backoff: RetryPolicy {
                base_delay_ms: 250,
                max_delay_ms: 30_000,
                max_retries: u32::MAX,
            },
        }
    }
}

/// Messages the client emits toward the engine
#[derive(Debug)]
pub enum FeedMessage {
    /// A normalized market event
    Event(MarketEvent),
    /// Connection state change
    State(ConnState),
    /// Count of frames that failed to decode
    ParseErrors(u64),
}

/// WebSocket client generic over a venue decoder
pub struct WsClient<D: FeedDecoder> {
    decoder: D,
    config: WsClientConfig,
    tx: mpsc::Sender<FeedMessage>,
    shutdown: watch::Receiver<bool>,
    http: reqwest::Client,
}

impl<D: FeedDecoder> WsClient<D> {
    /// Create a client; `shutdown` flips true to stop the run loop
    #[must_use]
    pub fn new(
        decoder: D,
        config: WsClientConfig,
        tx: mpsc::Sender<FeedMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            decoder,
            config,
            tx,
            shutdown,
            http: reqwest::Client::new(),
        }
    }

    /// Run until shutdown; owns reconnection
    pub async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.backoff);
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.emit_state(ConnState::Connecting).await;

            match self.run_connection().await {
                Ok(()) => break, // clean shutdown
                Err(e) => {
                    warn!(error = %e, "websocket connection lost");
                    self.decoder.on_disconnect();
                    self.emit_state(ConnState::Reconnecting).await;
                    let delay = backoff.next_delay();
                    debug!(attempt = backoff.attempt(), ?delay, "reconnect backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => break,
                    }
                }
            }
        }
        self.emit_state(ConnState::Closed).await;
    }

    async fn run_connection(&mut self) -> anyhow::Result<()> {
        let url = self.decoder.stream_url();
        info!(url = %url, "connecting market stream");
        let (ws, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws.split();

        self.emit_state(ConnState::Handshaking).await;
        // Snapshot+replay handshake for symbols that need seeding.
        for symbol in self.decoder.initial_snapshots() {
            self.fetch_and_apply_snapshot(symbol).await;
        }
        self.emit_state(ConnState::Connected).await;

        let mut ping_timer = interval(self.config.ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;
        let mut shutdown = self.shutdown.clone();

        loop {
            // Copied out so the select arm bodies can update the deadline.
            let armed_deadline = pong_deadline;
            let pong_check = async move {
                match armed_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping_timer.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                    }
                }
                () = pong_check => {
                    anyhow::bail!("pong timeout after {:?}", self.config.pong_timeout);
                }
                frame = read.next() => {
                    let Some(frame) = frame else {
                        anyhow::bail!("stream closed by peer");
                    };
                    match frame? {
                        Message::Text(text) => {
                            let ts_recv = recv_ts();
                            let out = self.decoder.decode(&text, ts_recv);
                            if out.parse_errors > 0 {
                                let _ = self.tx.send(FeedMessage::ParseErrors(out.parse_errors)).await;
                            }
                            for event in out.events {
                                if self.tx.send(FeedMessage::Event(event)).await.is_err() {
                                    return Ok(()); // engine gone
                                }
                            }
                            for symbol in out.need_snapshot {
                                self.fetch_and_apply_snapshot(symbol).await;
                            }
                        }
                        Message::Ping(payload) => {
                            write.send(Message::Pong(payload)).await?;
                        }
                        Message::Pong(_) => {
                            pong_deadline = None;
                        }
                        Message::Close(reason) => {
                            anyhow::bail!("server closed stream: {reason:?}");
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn fetch_and_apply_snapshot(&mut self, symbol: Symbol) {
        let Some(url) = self.decoder.snapshot_url(symbol) else {
            return;
        };
        match self.fetch_snapshot_body(&url).await {
            Ok(body) => {
                match self.decoder.apply_snapshot(symbol, &body, recv_ts()) {
                    Ok(event) => {
                        let _ = self.tx.send(FeedMessage::Event(event)).await;
                    }
                    Err(e) => {
                        error!(symbol = %symbol, error = %e, "snapshot decode failed");
                    }
                }
            }
            Err(e) => {
                // The next delta for this symbol re-requests the snapshot.
                warn!(symbol = %symbol, error = %e, "snapshot fetch failed");
                self.decoder.on_disconnect();
            }
        }
    }

    async fn fetch_snapshot_body(&self, url: &str) -> anyhow::Result<String> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("snapshot request failed: {}", response.status());
        }
        Ok(response.text().await?)
    }

    async fn emit_state(&self, state: ConnState) {
        let _ = self.tx.send(FeedMessage::State(state)).await;
    }
}

fn recv_ts() -> Ts {
    Ts::from_nanos(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0),
    )
}

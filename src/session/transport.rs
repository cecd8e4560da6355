//! Transport seam and the WebSocket implementation.
//!
//! [`Transport::open`] performs the connect + setup handshake and resolves
//! only once the server has acknowledged the session; that resolution is
//! the "opened" signal. Afterwards the [`TransportLink`] carries outbound
//! frames one way and [`TransportEvent`]s the other. Cancelling the link's
//! close token ends the session ahead of any frames still queued.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::audio::capture::AudioFrame;
use crate::config::SessionConfig;
use crate::error::{LiveError, Result};
use crate::session::protocol::{ClientMessage, ServerEvent, Setup, parse_server_message};

/// Everything needed to open one session.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub connect_timeout: Duration,
    pub outbound_capacity: usize,
}

impl SessionSetup {
    /// Build from configuration, resolving the API key.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::SessionOpenFailed`] when no API key is configured.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            LiveError::SessionOpenFailed(format!(
                "no API key: set session.api_key or ${}",
                config.api_key_env
            ))
        })?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            api_key,
            model: config.model.clone(),
            voice_name: config.voice_name.clone(),
            system_instruction: config.system_instruction.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
            outbound_capacity: config.outbound_capacity.max(1),
        })
    }

    /// The first message sent on a new connection.
    pub fn setup_message(&self) -> ClientMessage {
        ClientMessage::Setup(Setup::audio_reply(
            &self.model,
            &self.voice_name,
            &self.system_instruction,
        ))
    }

    /// Endpoint URL with the API key attached.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::SessionOpenFailed`] for an unparseable endpoint.
    pub fn url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| LiveError::SessionOpenFailed(format!("bad endpoint: {e}")))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }
}

/// Asynchronous notifications from an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One event extracted from a server message.
    Message(ServerEvent),
    /// The connection closed (either side).
    Closed,
    /// The connection failed.
    Error(String),
}

/// The two halves of an open session, plus its close signal.
pub struct TransportLink {
    /// Best-effort outbound sink; use `try_send`.
    pub outbound: mpsc::Sender<AudioFrame>,
    /// Inbound events in arrival order.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Cancel to close the session. Frames still queued are discarded.
    pub close: CancellationToken,
}

/// Opens bidirectional streaming sessions.
#[async_trait]
pub trait Transport: Send {
    /// Connect and negotiate. Resolves once the session is usable.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::SessionOpenFailed`] if the connection or the
    /// handshake fails.
    async fn open(&mut self, setup: &SessionSetup) -> Result<TransportLink>;
}

/// Ping interval while a session is open.
const PING_INTERVAL: Duration = Duration::from_secs(20);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Transport over a WebSocket connection (TLS via rustls).
#[derive(Debug, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        // Another component may already have installed a provider.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&mut self, setup: &SessionSetup) -> Result<TransportLink> {
        let url = setup.url()?;
        let ws = tokio::time::timeout(setup.connect_timeout, handshake(url, setup))
            .await
            .map_err(|_| {
                LiveError::SessionOpenFailed(format!(
                    "handshake timed out after {}s",
                    setup.connect_timeout.as_secs()
                ))
            })??;

        let (out_tx, out_rx) = mpsc::channel(setup.outbound_capacity);
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();
        let loop_close = close.clone();
        tokio::spawn(async move {
            connection_loop(ws, out_rx, ev_tx, loop_close).await;
        });

        Ok(TransportLink {
            outbound: out_tx,
            events: ev_rx,
            close,
        })
    }
}

/// Connect, send setup, and wait for `setupComplete`.
async fn handshake(url: Url, setup: &SessionSetup) -> Result<WsStream> {
    let (mut ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| LiveError::SessionOpenFailed(format!("connect: {e}")))?;

    let json = serde_json::to_string(&setup.setup_message())
        .map_err(|e| LiveError::SessionOpenFailed(format!("encode setup: {e}")))?;
    ws.send(Message::Text(json))
        .await
        .map_err(|e| LiveError::SessionOpenFailed(format!("send setup: {e}")))?;

    loop {
        let text = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "no reason given".into());
                return Err(LiveError::SessionOpenFailed(format!(
                    "closed during setup: {reason}"
                )));
            }
            None => {
                return Err(LiveError::SessionOpenFailed(
                    "connection closed during setup".into(),
                ));
            }
            Some(Err(e)) => {
                return Err(LiveError::SessionOpenFailed(format!("read during setup: {e}")));
            }
            Some(Ok(_)) => continue,
        };

        match parse_server_message(&text) {
            Ok(events) if events.contains(&ServerEvent::SetupComplete) => {
                info!("live session setup complete");
                return Ok(ws);
            }
            Ok(_) => debug!("ignoring pre-setup message"),
            Err(e) => debug!("ignoring unparseable pre-setup message: {e}"),
        }
    }
}

/// Pump the socket until either side closes.
async fn connection_loop(
    ws: WsStream,
    mut outbound_rx: mpsc::Receiver<AudioFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
    close: CancellationToken,
) {
    let (mut write, mut read) = ws.split();

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // Skip the first immediate tick.
    ping_interval.tick().await;

    let outcome = loop {
        tokio::select! {
            biased;

            () = close.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break TransportEvent::Closed;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => forward_server_message(&text, &events),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => forward_server_message(text, &events),
                        Err(_) => debug!("ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break TransportEvent::Closed,
                    Some(Err(e)) => break TransportEvent::Error(format!("read error: {e}")),
                    Some(Ok(_)) => {} // Ping/Pong handled by tungstenite.
                }
            }
            out = outbound_rx.recv() => {
                let Some(frame) = out else {
                    let _ = write.send(Message::Close(None)).await;
                    break TransportEvent::Closed;
                };
                let json = match serde_json::to_string(&ClientMessage::audio(&frame)) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    break TransportEvent::Error(format!("send error: {e}"));
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    break TransportEvent::Error(format!("ping error: {e}"));
                }
            }
        }
    };

    match &outcome {
        TransportEvent::Error(cause) => error!("live transport failed: {cause}"),
        _ => info!("live transport closed"),
    }
    let _ = events.send(outcome);
}

fn forward_server_message(text: &str, events: &mpsc::UnboundedSender<TransportEvent>) {
    match parse_server_message(text) {
        Ok(parsed) => {
            for event in parsed {
                let _ = events.send(TransportEvent::Message(event));
            }
        }
        Err(e) => debug!("ignoring unparseable server message: {e}"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn config_with_key(key: Option<&str>) -> SessionConfig {
        SessionConfig {
            api_key: key.map(str::to_owned),
            api_key_env: "KAIROS_TEST_KEY_THAT_IS_NOT_SET".into(),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn missing_key_fails_open() {
        match SessionSetup::from_config(&config_with_key(None)) {
            Err(LiveError::SessionOpenFailed(msg)) => {
                assert!(msg.contains("KAIROS_TEST_KEY_THAT_IS_NOT_SET"));
            }
            other => panic!("expected SessionOpenFailed, got {other:?}"),
        }
    }

    #[test]
    fn url_carries_key() {
        let setup = SessionSetup::from_config(&config_with_key(Some("abc 123"))).unwrap();
        let url = setup.url().unwrap();
        assert_eq!(url.scheme(), "wss");
        let key = url
            .query_pairs()
            .find(|(k, _)| k == "key")
            .map(|(_, v)| v.into_owned());
        assert_eq!(key.as_deref(), Some("abc 123"));
    }

    #[test]
    fn bad_endpoint_is_open_failure() {
        let mut config = config_with_key(Some("k"));
        config.endpoint = "not a url".into();
        let setup = SessionSetup::from_config(&config).unwrap();
        assert!(matches!(setup.url(), Err(LiveError::SessionOpenFailed(_))));
    }

    #[test]
    fn setup_message_uses_configured_voice() {
        let mut config = config_with_key(Some("k"));
        config.voice_name = "Kore".into();
        let setup = SessionSetup::from_config(&config).unwrap();
        let json = serde_json::to_value(setup.setup_message()).unwrap();
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Kore"
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_open() {
        let mut config = config_with_key(Some("k"));
        // Port 9 on loopback: connection refused.
        config.endpoint = "ws://127.0.0.1:9/live".into();
        config.connect_timeout_secs = 2;
        let setup = SessionSetup::from_config(&config).unwrap();
        let mut transport = WebSocketTransport::new();
        match transport.open(&setup).await {
            Err(LiveError::SessionOpenFailed(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected open to fail"),
        }
    }

    type ServerWs = WebSocketStream<tokio::net::TcpStream>;

    /// Accept one WebSocket client on loopback and hand it to `serve`.
    async fn local_server<F, Fut>(serve: F) -> String
    where
        F: FnOnce(ServerWs) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            serve(ws).await;
        });
        format!("ws://{addr}/live")
    }

    async fn expect_setup(ws: &mut ServerWs) -> serde_json::Value {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected setup message, got {other:?}"),
        }
    }

    async fn send_text(ws: &mut ServerWs, json: &str) {
        ws.send(Message::Text(json.to_owned())).await.unwrap();
    }

    /// Keep the connection open until the client goes away.
    async fn drain(ws: &mut ServerWs) {
        while let Some(Ok(_)) = ws.next().await {}
    }

    fn local_setup(endpoint: String) -> SessionSetup {
        let mut config = config_with_key(Some("k"));
        config.endpoint = endpoint;
        config.connect_timeout_secs = 5;
        SessionSetup::from_config(&config).unwrap()
    }

    const SETUP_COMPLETE: &str = r#"{"setupComplete":{}}"#;

    #[tokio::test]
    async fn open_waits_for_setup_complete() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let url = local_server(move |mut ws| async move {
            let setup = expect_setup(&mut ws).await;
            assert_eq!(
                setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                    ["prebuiltVoiceConfig"]["voiceName"],
                "Zephyr"
            );
            // Not an acknowledgement; must not open the session.
            send_text(&mut ws, r#"{"serverContent":{"turnComplete":true}}"#).await;
            let _ = release_rx.await;
            send_text(&mut ws, SETUP_COMPLETE).await;
            drain(&mut ws).await;
        })
        .await;

        let setup = local_setup(url);
        let opening = tokio::spawn(async move { WebSocketTransport::new().open(&setup).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!opening.is_finished());

        release_tx.send(()).unwrap();
        let mut link = opening.await.unwrap().unwrap();
        // The pre-acknowledgement message was consumed by the handshake.
        assert!(link.events.try_recv().is_err());
        link.close.cancel();
    }

    #[tokio::test]
    async fn close_before_setup_complete_fails_open() {
        let url = local_server(move |mut ws| async move {
            expect_setup(&mut ws).await;
            let _ = ws.close(None).await;
        })
        .await;

        match WebSocketTransport::new().open(&local_setup(url)).await {
            Err(LiveError::SessionOpenFailed(msg)) => assert!(msg.contains("setup"), "{msg}"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected open to fail"),
        }
    }

    #[tokio::test]
    async fn binary_frames_are_forwarded_in_order() {
        let url = local_server(move |mut ws| async move {
            expect_setup(&mut ws).await;
            send_text(&mut ws, SETUP_COMPLETE).await;
            let body = concat!(
                r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":"#,
                r#"{"mimeType":"audio/pcm;rate=24000","data":"AAA="}}]},"#,
                r#""interrupted":true}}"#,
            );
            ws.send(Message::Binary(body.as_bytes().to_vec())).await.unwrap();
            drain(&mut ws).await;
        })
        .await;

        let mut link = WebSocketTransport::new().open(&local_setup(url)).await.unwrap();
        let wait = Duration::from_secs(2);
        let first = tokio::time::timeout(wait, link.events.recv()).await.unwrap();
        let second = tokio::time::timeout(wait, link.events.recv()).await.unwrap();
        assert_eq!(
            first,
            Some(TransportEvent::Message(ServerEvent::AudioChunk {
                mime_type: "audio/pcm;rate=24000".into(),
                data: "AAA=".into(),
            }))
        );
        assert_eq!(second, Some(TransportEvent::Message(ServerEvent::Interrupted)));
        link.close.cancel();
    }

    #[tokio::test]
    async fn remote_close_reports_closed() {
        let url = local_server(move |mut ws| async move {
            expect_setup(&mut ws).await;
            send_text(&mut ws, SETUP_COMPLETE).await;
            let _ = ws.close(None).await;
            drain(&mut ws).await;
        })
        .await;

        let mut link = WebSocketTransport::new().open(&local_setup(url)).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), link.events.recv()).await.unwrap();
        assert_eq!(event, Some(TransportEvent::Closed));
    }

    #[tokio::test]
    async fn frames_reach_server_as_realtime_input() {
        let (got_tx, got_rx) = tokio::sync::oneshot::channel::<serde_json::Value>();
        let url = local_server(move |mut ws| async move {
            expect_setup(&mut ws).await;
            send_text(&mut ws, SETUP_COMPLETE).await;
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let _ = got_tx.send(serde_json::from_str(&text).unwrap());
            }
            drain(&mut ws).await;
        })
        .await;

        let link = WebSocketTransport::new().open(&local_setup(url)).await.unwrap();
        link.outbound
            .try_send(AudioFrame::from_samples(0, &[0.5], 16_000))
            .unwrap();
        let json = tokio::time::timeout(Duration::from_secs(2), got_rx).await.unwrap().unwrap();
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AEA=");
        link.close.cancel();
    }

    #[tokio::test]
    async fn close_discards_queued_frames() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<Vec<Message>>();
        let url = local_server(move |mut ws| async move {
            expect_setup(&mut ws).await;
            send_text(&mut ws, SETUP_COMPLETE).await;
            let mut seen = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                let done = msg.is_close();
                seen.push(msg);
                if done {
                    break;
                }
            }
            let _ = seen_tx.send(seen);
        })
        .await;

        let mut link = WebSocketTransport::new().open(&local_setup(url)).await.unwrap();
        // Queue and close without yielding, so the writer sees both at once.
        for seq in 0..3 {
            link.outbound
                .try_send(AudioFrame::from_samples(seq, &[0.1; 8], 16_000))
                .unwrap();
        }
        link.close.cancel();

        let seen = tokio::time::timeout(Duration::from_secs(2), seen_rx).await.unwrap().unwrap();
        assert!(seen.iter().all(|m| !m.is_text()), "stale frames sent: {seen:?}");
        assert!(seen.last().is_some_and(Message::is_close));
        let event = tokio::time::timeout(Duration::from_secs(2), link.events.recv()).await.unwrap();
        assert_eq!(event, Some(TransportEvent::Closed));
    }
}

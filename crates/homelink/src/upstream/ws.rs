//! WebSocket [`Connector`] built on tokio-tungstenite.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use futures_util::StreamExt;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::client::danger::ServerCertVerified;
use rustls::client::danger::ServerCertVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::ServerName;
use rustls::pki_types::UnixTime;
use rustls::DigitallySignedStruct;
use rustls::SignatureScheme;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use super::transport::CloseInfo;
use super::transport::ConnectRequest;
use super::transport::Connection;
use super::transport::Connector;
use super::transport::EventSink;
use super::transport::Frame;
use super::transport::LinkEvent;
use super::transport::TransportError;
use super::transport::ABNORMAL_CLOSURE;

/// Close code reported when the server closed without giving one.
const NO_STATUS_RECEIVED: u16 = 1005;

/// How often an open connection is pinged.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A connection with no inbound traffic for this long is considered dead.
const IDLE_TIMEOUT: Duration = Duration::from_secs(75);

#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Connection>, TransportError> {
        let mut http_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", request.credential))
            .map_err(|e| TransportError::Handshake(format!("invalid credential: {}", e)))?;
        http_request.headers_mut().insert(AUTHORIZATION, bearer);

        let tls = if request.accept_invalid_certs {
            Some(tokio_tungstenite::Connector::Rustls(Arc::new(
                insecure_tls_config()?,
            )))
        } else {
            None
        };

        let (stream, _response) =
            tokio_tungstenite::connect_async_tls_with_config(http_request, None, false, tls)
                .await
                .map_err(classify)?;
        Ok(Box::new(WsConnection { stream }))
    }
}

/// Map a handshake failure onto the errors the reconnect policy cares about.
fn classify(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::Http(response) => match response.status().as_u16() {
            status @ (401 | 403) => TransportError::Unauthorized(status),
            429 => TransportError::RateLimited,
            status => TransportError::Handshake(format!("HTTP {}", status)),
        },
        tungstenite::Error::Url(e) => TransportError::InvalidUrl(e.to_string()),
        tungstenite::Error::Tls(e) => TransportError::Handshake(e.to_string()),
        other => TransportError::Io(other.to_string()),
    }
}

struct WsConnection<S> {
    stream: WebSocketStream<S>,
}

#[async_trait]
impl<S> Connection for WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(self: Box<Self>, mut outbound: mpsc::UnboundedReceiver<Frame>, events: EventSink) {
        let (mut sink, mut stream) = self.stream.split();

        let mut heartbeat = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() >= IDLE_TIMEOUT {
                        let error = TransportError::TimedOut(IDLE_TIMEOUT);
                        let reason = error.to_string();
                        events.emit(LinkEvent::Error(error));
                        events.emit(LinkEvent::Closed(CloseInfo::new(ABNORMAL_CLOSURE, reason)));
                        return;
                    }
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        events.emit(LinkEvent::Error(TransportError::Io(e.to_string())));
                        events.emit(LinkEvent::Closed(CloseInfo::new(ABNORMAL_CLOSURE, e.to_string())));
                        return;
                    }
                }
                frame = outbound.recv() => match frame {
                    Some(Frame::Text(text)) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            events.emit(LinkEvent::Error(TransportError::Io(e.to_string())));
                            events.emit(LinkEvent::Closed(CloseInfo::new(ABNORMAL_CLOSURE, e.to_string())));
                            return;
                        }
                    }
                    Some(Frame::Close) | None => {
                        let close = Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        }));
                        if let Err(e) = sink.send(close).await {
                            debug!("[upstream] Close handshake failed: {}", e);
                        }
                        events.emit(LinkEvent::Closed(CloseInfo::new(1000, "closed by client")));
                        return;
                    }
                },
                message = stream.next() => {
                    if matches!(message, Some(Ok(_))) {
                        last_seen = Instant::now();
                    }
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            events.emit(LinkEvent::Message(text));
                        }
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => {
                                events.emit(LinkEvent::Message(text));
                            }
                            Err(_) => debug!("[upstream] Ignoring non UTF-8 binary frame"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            let info = frame
                                .map(|f| CloseInfo::new(u16::from(f.code), f.reason.into_owned()))
                                .unwrap_or_else(|| CloseInfo::new(NO_STATUS_RECEIVED, ""));
                            events.emit(LinkEvent::Closed(info));
                            return;
                        }
                        // Pings are answered by tungstenite, pongs only refresh last_seen
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            events.emit(LinkEvent::Error(TransportError::Io(e.to_string())));
                            events.emit(LinkEvent::Closed(CloseInfo::new(ABNORMAL_CLOSURE, e.to_string())));
                            return;
                        }
                        None => {
                            events.emit(LinkEvent::Closed(CloseInfo::new(ABNORMAL_CLOSURE, "stream ended")));
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// TLS settings for development servers with self-signed certificates.
fn insecure_tls_config() -> Result<rustls::ClientConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Handshake(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    Ok(config)
}

/// Skips certificate validation but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

//! Kubernetes port-forward over WebSocket.
//!
//! The API server upgrades `GET /api/v1/namespaces/{ns}/pods/{pod}/portforward?ports={port}`
//! to a WebSocket speaking the `v4.channel.k8s.io` subprotocol. Every
//! binary message starts with a channel byte:
//!
//! ```text
//! +---------+----------------------------------------+
//! | channel | payload                                |
//! +---------+----------------------------------------+
//!   0 = data, 1 = error (for the first requested port)
//! ```
//!
//! The first server message on each channel starts with the port number as
//! two little-endian bytes. Client data is sent on channel 0 without a
//! prefix. Each WebSocket carries exactly one forwarded connection.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Result, TunnelError};
use crate::forwarder::{BoxedStream, ForwardSession, PortForwarder};
use crate::target::PodTarget;
use crate::tunnel::FaultReporter;

/// Subprotocol negotiated with the API server.
pub const PORT_FORWARD_PROTOCOL: &str = "v4.channel.k8s.io";

const DATA_CHANNEL: u8 = 0;
const ERROR_CHANNEL: u8 = 1;
const PORT_PREFIX_LEN: usize = 2;
const STREAM_BUFFER: usize = 65_536;

/// Port forwarder using the cluster API server's WebSocket endpoint.
///
/// Credentials are opaque to the forwarder: whatever headers the caller
/// supplies (for example `Authorization`) are sent verbatim on every
/// upgrade request. Pointing `api_server` at `kubectl proxy` needs none.
#[derive(Debug, Clone)]
pub struct WebSocketForwarder {
    api_server: Url,
    headers: Vec<(String, String)>,
}

impl WebSocketForwarder {
    /// Create a forwarder for the API server at `api_server`.
    pub const fn new(api_server: Url) -> Self {
        Self {
            api_server,
            headers: Vec::new(),
        }
    }

    /// Add a header to every upgrade request.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

}

#[async_trait]
impl PortForwarder for WebSocketForwarder {
    fn endpoint(&self, target: &PodTarget, remote_port: u16) -> Result<Url> {
        let mut url = self.api_server.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TunnelError::endpoint(format!(
                    "unsupported API server scheme '{other}'"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| TunnelError::endpoint(format!("cannot use scheme '{scheme}'")))?;

        // Keep any path prefix the API server is mounted under.
        let path = format!(
            "{}{}",
            url.path().trim_end_matches('/'),
            target.portforward_path()
        );
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("ports", &remote_port.to_string());

        handshake_request(&url, &self.headers)?;
        Ok(url)
    }

    async fn dial(&self, endpoint: &Url, faults: FaultReporter) -> Result<Box<dyn ForwardSession>> {
        let port = requested_port(endpoint)?;
        let warm = open_channel(endpoint, &self.headers, port, faults.clone()).await?;
        debug!(%endpoint, port, "Port-forward upgrade complete");

        Ok(Box::new(WebSocketSession {
            endpoint: endpoint.clone(),
            headers: self.headers.clone(),
            port,
            faults,
            warm: Some(warm),
        }))
    }
}

struct WebSocketSession {
    endpoint: Url,
    headers: Vec<(String, String)>,
    port: u16,
    faults: FaultReporter,
    warm: Option<(BoxedStream, JoinHandle<()>)>,
}

#[async_trait]
impl ForwardSession for WebSocketSession {
    async fn open_stream(&mut self) -> Result<BoxedStream> {
        if let Some((stream, pump)) = self.warm.take() {
            if !pump.is_finished() {
                return Ok(stream);
            }
            debug!(port = self.port, "Warm port-forward stream already ended, redialing");
        }

        let (stream, _pump) =
            open_channel(&self.endpoint, &self.headers, self.port, self.faults.clone()).await?;
        Ok(stream)
    }
}

fn requested_port(endpoint: &Url) -> Result<u16> {
    endpoint
        .query_pairs()
        .find(|(key, _)| key == "ports")
        .and_then(|(_, value)| value.parse().ok())
        .ok_or_else(|| TunnelError::endpoint(format!("no port requested in '{endpoint}'")))
}

fn handshake_request(endpoint: &Url, headers: &[(String, String)]) -> Result<Request> {
    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| TunnelError::endpoint(e.to_string()))?;

    let request_headers = request.headers_mut();
    request_headers.insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(PORT_FORWARD_PROTOCOL),
    );
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TunnelError::endpoint(format!("invalid header name '{name}': {e}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| TunnelError::endpoint(format!("invalid value for header '{name}': {e}")))?;
        request_headers.insert(header_name, header_value);
    }

    Ok(request)
}

async fn open_channel(
    endpoint: &Url,
    headers: &[(String, String)],
    port: u16,
    faults: FaultReporter,
) -> Result<(BoxedStream, JoinHandle<()>)> {
    let request = handshake_request(endpoint, headers)?;
    let (socket, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| TunnelError::dial(e.to_string()))?;

    let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
    let pump = tokio::spawn(async move {
        match pump(socket, remote, port, &faults).await {
            Ok(()) => debug!(port, "Port-forward stream finished"),
            Err(e) => warn!(port, error = %e, "Port-forward stream ended with error"),
        }
    });

    Ok((Box::new(local), pump))
}

/// Shuttle bytes between `local` and the WebSocket until either side ends.
///
/// A broken WebSocket fails the tunnel through `faults` before `local` is
/// released. An error-channel message only ends this connection, and so
/// does the local side going away.
async fn pump<S>(
    socket: WebSocketStream<S>,
    local: DuplexStream,
    port: u16,
    faults: &FaultReporter,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut local_rx, mut local_tx) = tokio::io::split(local);

    let upstream = async {
        let mut buf = vec![0u8; STREAM_BUFFER];
        loop {
            let read = match local_rx.read(&mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    debug!(port, error = %e, "Local side of forwarded stream failed");
                    0
                }
            };
            let Some(chunk) = buf.get(..read).filter(|chunk| !chunk.is_empty()) else {
                break;
            };
            ws_tx
                .send(Message::Binary(data_frame(chunk).into()))
                .await
                .map_err(|e| TunnelError::stream(e.to_string()))?;
        }
        // The remote side may already be gone.
        let _ = ws_tx.close().await;
        Ok::<(), TunnelError>(())
    };

    let downstream = async {
        let mut demux = ChannelDemux::new(port);
        while let Some(message) = ws_rx.next().await {
            let message = message.map_err(|e| TunnelError::stream(e.to_string()))?;
            match message {
                Message::Binary(frame) => match demux.accept(&frame)? {
                    Frame::Data(payload) => {
                        if let Err(e) = local_tx.write_all(payload).await {
                            debug!(port, error = %e, "Local side of forwarded stream went away");
                            return Ok(());
                        }
                    }
                    Frame::Error(text) => return Err(TunnelError::remote(port, text)),
                    Frame::Skip => {}
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        // Nothing left to deliver if the local side is already gone.
        let _ = local_tx.shutdown().await;
        Ok(())
    };

    let outcome = tokio::try_join!(upstream, downstream).map(|_| ());
    if let Some(fault) = outcome.as_ref().err().filter(|e| is_transport_fault(e)) {
        faults.report(fault.clone());
    }
    outcome
}

/// Whether `error` means the WebSocket itself is unusable, as opposed to
/// the remote port refusing one connection.
const fn is_transport_fault(error: &TunnelError) -> bool {
    !matches!(error, TunnelError::Remote { .. })
}

fn data_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len().saturating_add(1));
    frame.push(DATA_CHANNEL);
    frame.extend_from_slice(payload);
    frame
}

#[derive(Debug, PartialEq, Eq)]
enum Frame<'a> {
    Data(&'a [u8]),
    Error(String),
    Skip,
}

/// Splits server frames into data and error payloads, stripping the port
/// prefix from the first frame of each channel.
#[derive(Debug)]
struct ChannelDemux {
    port: u16,
    data_prefixed: bool,
    error_prefixed: bool,
}

impl ChannelDemux {
    const fn new(port: u16) -> Self {
        Self {
            port,
            data_prefixed: false,
            error_prefixed: false,
        }
    }

    fn accept<'a>(&mut self, frame: &'a [u8]) -> Result<Frame<'a>> {
        let (&channel, payload) = frame
            .split_first()
            .ok_or_else(|| TunnelError::stream("empty port-forward frame"))?;

        let prefixed = match channel {
            DATA_CHANNEL => &mut self.data_prefixed,
            ERROR_CHANNEL => &mut self.error_prefixed,
            other => {
                return Err(TunnelError::stream(format!(
                    "unexpected port-forward channel {other}"
                )));
            }
        };

        let payload = if *prefixed {
            payload
        } else {
            let (prefix, rest) = payload
                .split_at_checked(PORT_PREFIX_LEN)
                .ok_or_else(|| TunnelError::stream("truncated port prefix"))?;
            let announced = prefix
                .try_into()
                .map(u16::from_le_bytes)
                .map_err(|_| TunnelError::stream("truncated port prefix"))?;
            if announced != self.port {
                return Err(TunnelError::stream(format!(
                    "server announced port {announced}, expected {}",
                    self.port
                )));
            }
            *prefixed = true;
            rest
        };

        if payload.is_empty() {
            return Ok(Frame::Skip);
        }
        if channel == DATA_CHANNEL {
            Ok(Frame::Data(payload))
        } else {
            Ok(Frame::Error(String::from_utf8_lossy(payload).into_owned()))
        }
    }
}

//! End-to-end tests for the WebSocket port-forward transport against a
//! fake API server speaking `v4.channel.k8s.io`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use podprof_tunnel::{
    PORT_FORWARD_PROTOCOL, PodTarget, TunnelConfig, TunnelError, TunnelState, WebSocketForwarder,
    connect,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use url::Url;

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

const WAIT: Duration = Duration::from_secs(5);
const REMOTE_PORT: u16 = 8008;

/// What the fake API server saw during the upgrade.
#[derive(Debug)]
struct Upgrade {
    uri: String,
    protocol: Option<String>,
    authorization: Option<String>,
}

/// How the fake pod behaves once a WebSocket is established.
#[derive(Debug, Clone, Copy)]
enum PodBehavior {
    /// Echo every data frame back, upper-cased.
    Echo,
    /// Report a forwarding error on the error channel.
    Refuse,
    /// Answer the first request with part of a response, then drop the
    /// connection without a close frame.
    Truncate,
}

const TRUNCATED_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial";

async fn fake_api_server(
    behavior: PodBehavior,
) -> std::io::Result<(SocketAddr, mpsc::UnboundedReceiver<Upgrade>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let (upgrade_tx, upgrade_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_port_forward(socket, behavior, upgrade_tx.clone()));
        }
    });

    Ok((address, upgrade_rx))
}

async fn serve_port_forward(
    socket: TcpStream,
    behavior: PodBehavior,
    upgrades: mpsc::UnboundedSender<Upgrade>,
) {
    let callback = move |request: &Request, mut response: Response| {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let _ = upgrades.send(Upgrade {
            uri: request.uri().to_string(),
            protocol: header("sec-websocket-protocol"),
            authorization: header("authorization"),
        });
        response.headers_mut().insert(
            "sec-websocket-protocol",
            HeaderValue::from_static(PORT_FORWARD_PROTOCOL),
        );
        Ok::<Response, ErrorResponse>(response)
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(socket, callback).await else {
        return;
    };

    let [lo, hi] = REMOTE_PORT.to_le_bytes();
    let _ = ws.send(Message::Binary(vec![0, lo, hi].into())).await;
    let _ = ws.send(Message::Binary(vec![1, lo, hi].into())).await;

    match behavior {
        PodBehavior::Echo => {
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Binary(frame) = message {
                    let reply: Vec<u8> = frame.iter().map(u8::to_ascii_uppercase).collect();
                    if ws.send(Message::Binary(reply.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        PodBehavior::Refuse => {
            let mut frame = vec![1];
            frame.extend_from_slice(b"connection refused");
            let _ = ws.send(Message::Binary(frame.into())).await;
            let _ = ws.close(None).await;
        }
        PodBehavior::Truncate => {
            while let Some(Ok(message)) = ws.next().await {
                if matches!(message, Message::Binary(_)) {
                    let mut frame = vec![0];
                    frame.extend_from_slice(TRUNCATED_RESPONSE);
                    let _ = ws.send(Message::Binary(frame.into())).await;
                    break;
                }
            }
            drop(ws);
        }
    }
}

fn forwarder(address: SocketAddr) -> std::result::Result<WebSocketForwarder, url::ParseError> {
    Ok(WebSocketForwarder::new(Url::parse(&format!("http://{address}"))?)
        .with_header("Authorization", "Bearer opaque-token"))
}

#[tokio::test]
async fn test_forwards_through_websocket_channels() -> TestResult {
    let (address, mut upgrades) = fake_api_server(PodBehavior::Echo).await?;
    let stop = CancellationToken::new();
    let target = PodTarget::new("knative-serving", "activator-1")?;
    let tunnel = connect(
        Arc::new(forwarder(address)?),
        target,
        TunnelConfig::default(),
        stop.clone(),
    )?;

    let local = timeout(WAIT, tunnel.ready()).await??;
    let upgrade = timeout(WAIT, upgrades.recv())
        .await?
        .ok_or("fake API server saw no upgrade")?;
    assert_eq!(
        upgrade.uri,
        "/api/v1/namespaces/knative-serving/pods/activator-1/portforward?ports=8008"
    );
    assert_eq!(upgrade.protocol.as_deref(), Some(PORT_FORWARD_PROTOCOL));
    assert_eq!(upgrade.authorization.as_deref(), Some("Bearer opaque-token"));

    let mut client = TcpStream::connect(local).await?;
    client.write_all(b"ping").await?;
    let mut buf = [0u8; 4];
    timeout(WAIT, client.read_exact(&mut buf)).await??;
    // The fake pod upper-cases the whole frame, channel byte included (0 stays 0).
    assert_eq!(&buf, b"PING");

    stop.cancel();
    assert_eq!(timeout(WAIT, tunnel.terminated()).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_error_channel_ends_stream_but_not_tunnel() -> TestResult {
    let (address, _upgrades) = fake_api_server(PodBehavior::Refuse).await?;
    let stop = CancellationToken::new();
    let tunnel = connect(
        Arc::new(forwarder(address)?),
        PodTarget::new("ns", "pod-1")?,
        TunnelConfig::default(),
        stop.clone(),
    )?;

    let local = timeout(WAIT, tunnel.ready()).await??;
    let mut client = TcpStream::connect(local).await?;
    let mut received = Vec::new();
    timeout(WAIT, client.read_to_end(&mut received)).await??;
    assert!(received.is_empty());
    assert!(matches!(tunnel.state(), TunnelState::Ready(_)));

    stop.cancel();
    assert_eq!(timeout(WAIT, tunnel.terminated()).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_api_server_fails_dial() -> TestResult {
    let address = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?
    };
    let stop = CancellationToken::new();
    let tunnel = connect(
        Arc::new(forwarder(address)?),
        PodTarget::new("ns", "pod-1")?,
        TunnelConfig::default(),
        stop.clone(),
    )?;

    let terminated = timeout(WAIT, tunnel.terminated()).await?;
    assert!(matches!(terminated, Some(TunnelError::Dial { .. })));
    assert!(matches!(tunnel.ready().await, Err(TunnelError::Dial { .. })));
    Ok(())
}

#[tokio::test]
async fn test_dropped_websocket_mid_response_fails_tunnel() -> TestResult {
    let (address, _upgrades) = fake_api_server(PodBehavior::Truncate).await?;
    let stop = CancellationToken::new();
    let tunnel = connect(
        Arc::new(forwarder(address)?),
        PodTarget::new("knative-serving", "activator-1")?,
        TunnelConfig::default(),
        stop.clone(),
    )?;

    let local = timeout(WAIT, tunnel.ready()).await??;
    let mut client = TcpStream::connect(local).await?;
    client
        .write_all(b"GET /debug/pprof/heap HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await?;

    let terminated = timeout(WAIT, tunnel.terminated()).await?;
    assert!(matches!(terminated, Some(TunnelError::Stream { .. })));
    assert!(matches!(tunnel.state(), TunnelState::Failed(TunnelError::Stream { .. })));

    // Whatever reached the client is a prefix of the truncated response.
    let mut received = Vec::new();
    let _ = timeout(WAIT, client.read_to_end(&mut received)).await?;
    assert!(TRUNCATED_RESPONSE.starts_with(&received));

    // A new connection is not forwarded once the tunnel has failed.
    assert!(matches!(tunnel.ready().await, Err(TunnelError::Stream { .. })));
    stop.cancel();
    Ok(())
}

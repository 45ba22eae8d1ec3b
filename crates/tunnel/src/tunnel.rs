//! Tunnel lifecycle: background forwarding loop plus readiness and
//! termination signals.
//!
//! The state of a tunnel lives in a single `watch` channel that only moves
//! forward:
//!
//! ```text
//! Connecting ──► Ready(addr) ──► Failed(err) | Closed
//!      └───────────────────────► Failed(err) | Closed
//! ```
//!
//! "Ready" is observed at most once and "terminated" is permanent. If the
//! background task ends without recording a terminal state the channel
//! closes, which observers read as [`TunnelError::TaskExited`]. A
//! transport that breaks mid-use fails the tunnel through its
//! [`FaultReporter`].

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::forwarder::{BoxedStream, PortForwarder};
use crate::target::PodTarget;

/// Lifecycle state of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    /// Dialing the remote target.
    Connecting,
    /// Listening locally and forwarding.
    Ready(SocketAddr),
    /// Terminated by a setup or transport failure.
    Failed(TunnelError),
    /// Stopped by the owner.
    Closed,
}

impl TunnelState {
    /// True once the tunnel can no longer be used.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Closed)
    }

    /// Short name of the state.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Ready(_) => "ready",
            Self::Failed(_) => "failed",
            Self::Closed => "closed",
        }
    }
}

/// Handle to a tunnel started by [`connect`].
///
/// The tunnel runs until the stop token passed to [`connect`] is cancelled
/// or the transport fails; dropping the handle does not stop it.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    target: PodTarget,
    state: watch::Receiver<TunnelState>,
}

impl TunnelHandle {
    /// Target the tunnel forwards to.
    pub fn target(&self) -> &PodTarget {
        &self.target
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    /// Local listening address, once ready and while not terminated.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self.state.borrow() {
            TunnelState::Ready(addr) => Some(addr),
            _ => None,
        }
    }

    /// Wait for the first of "ready" and "terminated".
    ///
    /// # Errors
    ///
    /// Returns the terminal error if the tunnel failed, or
    /// `TunnelError::Closed` if it was stopped cleanly.
    pub async fn ready(&self) -> Result<SocketAddr> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| !matches!(s, TunnelState::Connecting))
            .await
            .map(|s| (*s).clone());

        match settled {
            Ok(TunnelState::Ready(addr)) => Ok(addr),
            Ok(TunnelState::Failed(err)) => Err(err),
            Ok(TunnelState::Closed) => Err(TunnelError::Closed),
            Ok(TunnelState::Connecting) | Err(_) => Err(TunnelError::TaskExited),
        }
    }

    /// Wait until the tunnel terminates.
    ///
    /// Resolves to `None` for a clean stop and to the causing error otherwise.
    pub async fn terminated(&self) -> Option<TunnelError> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(TunnelState::is_terminal)
            .await
            .map(|s| (*s).clone());

        match settled {
            Ok(TunnelState::Failed(err)) => Some(err),
            Ok(_) => None,
            Err(_) => Some(TunnelError::TaskExited),
        }
    }
}

/// Start a tunnel to `target` without waiting for it to become ready.
///
/// Returns once the upgrade endpoint is built and the background task is
/// spawned; dial failures surface later through [`TunnelHandle::ready`] and
/// [`TunnelHandle::terminated`].
///
/// # Errors
///
/// Fails when no tokio runtime is running or the forwarder cannot build an
/// endpoint for the target.
pub fn connect(
    forwarder: Arc<dyn PortForwarder>,
    target: PodTarget,
    config: TunnelConfig,
    stop: CancellationToken,
) -> Result<TunnelHandle> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|e| TunnelError::NoRuntime {
        reason: e.to_string(),
    })?;
    let endpoint = forwarder.endpoint(&target, config.remote_port)?;
    let (state_tx, state_rx) = watch::channel(TunnelState::Connecting);

    debug!(pod = %target, %endpoint, local_port = config.local_port, "Opening tunnel");
    runtime.spawn(run(forwarder, endpoint, config, stop, Arc::new(state_tx)));

    Ok(TunnelHandle {
        target,
        state: state_rx,
    })
}

async fn run(
    forwarder: Arc<dyn PortForwarder>,
    endpoint: Url,
    config: TunnelConfig,
    stop: CancellationToken,
    state: Arc<watch::Sender<TunnelState>>,
) {
    let faults = FaultReporter::new(&state);
    let outcome = forward(forwarder.as_ref(), &endpoint, config, &stop, &state, &faults).await;

    match &outcome {
        Ok(()) => info!(%endpoint, "Tunnel closed"),
        Err(e) => warn!(%endpoint, error = %e, "Tunnel failed"),
    }
    mark_terminated(&state, outcome);
}

async fn forward(
    forwarder: &dyn PortForwarder,
    endpoint: &Url,
    config: TunnelConfig,
    stop: &CancellationToken,
    state: &watch::Sender<TunnelState>,
    faults: &FaultReporter,
) -> Result<()> {
    let mut session = tokio::select! {
        biased;
        () = stop.cancelled() => return Ok(()),
        session = forwarder.dial(endpoint, faults.clone()) => session?,
    };

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.local_port))
        .await
        .map_err(|e| TunnelError::bind(config.local_port, e.to_string()))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| TunnelError::bind(config.local_port, e.to_string()))?;

    if !mark_ready(state, local_addr) {
        return reported_fault(state);
    }
    info!(%local_addr, remote_port = config.remote_port, "Tunnel ready");

    // Forwarded connections end together with the loop.
    let connections = CancellationToken::new();
    let _connections_guard = connections.clone().drop_guard();

    loop {
        let (socket, peer) = tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(()),
            () = faults.tripped() => return reported_fault(state),
            accepted = listener.accept() => accepted.map_err(|e| TunnelError::accept(e.to_string()))?,
        };

        let stream = tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(()),
            () = faults.tripped() => return reported_fault(state),
            stream = session.open_stream() => stream?,
        };

        debug!(%peer, "Forwarding local connection");
        tokio::spawn(pipe(socket, stream, connections.child_token()));
    }
}

async fn pipe(mut local: TcpStream, mut remote: BoxedStream, shutdown: CancellationToken) {
    tokio::select! {
        () = shutdown.cancelled() => debug!("Forwarded connection dropped with tunnel"),
        copied = tokio::io::copy_bidirectional(&mut local, &mut remote) => match copied {
            Ok((sent, received)) => debug!(sent, received, "Forwarded connection finished"),
            Err(e) => warn!(error = %e, "Forwarded connection failed"),
        },
    }
}

/// Lets a transport fail the tunnel it serves.
///
/// Handed to [`PortForwarder::dial`]. A report moves the tunnel to
/// `Failed` at once, so a transport that reports before releasing a broken
/// stream guarantees the stream's reader already sees the terminal state.
#[derive(Debug, Clone)]
pub struct FaultReporter {
    state: Weak<watch::Sender<TunnelState>>,
    tripped: CancellationToken,
}

impl FaultReporter {
    fn new(state: &Arc<watch::Sender<TunnelState>>) -> Self {
        Self {
            state: Arc::downgrade(state),
            tripped: CancellationToken::new(),
        }
    }

    /// A reporter not attached to any tunnel.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            state: Weak::new(),
            tripped: CancellationToken::new(),
        }
    }

    /// Fail the tunnel with `error`.
    ///
    /// Ignored once the tunnel has terminated, so the first outcome wins.
    pub fn report(&self, error: TunnelError) {
        let failed = self
            .state
            .upgrade()
            .is_some_and(|state| mark_terminated(&state, Err(error.clone())));
        if failed {
            debug!(error = %error, "Transport failed, stopping tunnel");
        }
        self.tripped.cancel();
    }

    async fn tripped(&self) {
        self.tripped.cancelled().await;
    }
}

/// Outcome of a tunnel whose state was already settled by a fault.
fn reported_fault(state: &watch::Sender<TunnelState>) -> Result<()> {
    let current = state.borrow().clone();
    match current {
        TunnelState::Failed(err) => Err(err),
        TunnelState::Connecting | TunnelState::Ready(_) | TunnelState::Closed => Ok(()),
    }
}

fn mark_ready(state: &watch::Sender<TunnelState>, addr: SocketAddr) -> bool {
    state.send_if_modified(|current| {
        if matches!(current, TunnelState::Connecting) {
            *current = TunnelState::Ready(addr);
            true
        } else {
            false
        }
    })
}

fn mark_terminated(state: &watch::Sender<TunnelState>, outcome: Result<()>) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() {
            return false;
        }
        *current = match outcome {
            Ok(()) => TunnelState::Closed,
            Err(err) => TunnelState::Failed(err),
        };
        true
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 18008))
    }

    #[test]
    fn test_ready_fires_at_most_once() {
        let (tx, rx) = watch::channel(TunnelState::Connecting);
        assert!(mark_ready(&tx, addr()));
        assert!(!mark_ready(&tx, SocketAddr::from((Ipv4Addr::LOCALHOST, 1))));
        assert_eq!(*rx.borrow(), TunnelState::Ready(addr()));
    }

    #[test]
    fn test_terminal_state_is_permanent() {
        let (tx, rx) = watch::channel(TunnelState::Connecting);
        assert!(mark_terminated(&tx, Err(TunnelError::dial("refused"))));
        assert!(!mark_ready(&tx, addr()));
        assert!(!mark_terminated(&tx, Ok(())));
        assert_eq!(
            *rx.borrow(),
            TunnelState::Failed(TunnelError::dial("refused"))
        );
    }

    #[test]
    fn test_ready_then_closed() {
        let (tx, rx) = watch::channel(TunnelState::Connecting);
        mark_ready(&tx, addr());
        mark_terminated(&tx, Ok(()));
        assert_eq!(*rx.borrow(), TunnelState::Closed);
        assert_eq!(rx.borrow().as_str(), "closed");
    }

    #[tokio::test]
    async fn test_first_fault_wins_and_trips_loop() {
        let state = Arc::new(watch::channel(TunnelState::Connecting).0);
        let rx = state.subscribe();
        mark_ready(&state, addr());

        let faults = FaultReporter::new(&state);
        faults.clone().report(TunnelError::stream("reset"));
        faults.report(TunnelError::stream("second"));

        faults.tripped().await;
        assert_eq!(*rx.borrow(), TunnelState::Failed(TunnelError::stream("reset")));
        assert_eq!(reported_fault(&state), Err(TunnelError::stream("reset")));
    }

    #[test]
    fn test_fault_after_close_is_ignored() {
        let state = Arc::new(watch::channel(TunnelState::Connecting).0);
        mark_terminated(&state, Ok(()));

        FaultReporter::new(&state).report(TunnelError::stream("late"));
        assert_eq!(*state.borrow(), TunnelState::Closed);
        assert_eq!(reported_fault(&state), Ok(()));
    }

    #[tokio::test]
    async fn test_dropped_sender_reads_as_task_exit() -> Result<()> {
        let (tx, rx) = watch::channel(TunnelState::Connecting);
        let handle = TunnelHandle {
            target: PodTarget::new("ns", "pod-1")?,
            state: rx,
        };
        drop(tx);

        assert_eq!(handle.ready().await, Err(TunnelError::TaskExited));
        assert_eq!(handle.terminated().await, Some(TunnelError::TaskExited));
        Ok(())
    }
}

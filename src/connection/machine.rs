//! Per-transport connection driver
//!
//! Wraps the pure state machine from `bridgelink-shared` in a command-loop
//! task. The loop is the single writer of the state value, so observers
//! always see a consistent, ordered sequence of transitions.

use crate::transport::{BridgeSession, TransportConnector};
use bridgelink_shared::state_machine::{LinkEvent, LinkStateMachine, TransitionResult};
use bridgelink_shared::{
    timing, ConnectError, ConnectionState, Endpoint, FailureReason, TransportKind,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Configuration for one connection driver
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Connection attempt timeout
    pub connect_timeout: Duration,
    /// Bound on graceful teardown before the state is forced to Idle
    pub disconnect_timeout: Duration,
    /// Delay between a failed attempt and discovery re-arming
    pub retry_backoff: Duration,
    /// Longer delay used when the transport itself is unavailable
    pub unavailable_backoff: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(timing::CONNECT_TIMEOUT_MS),
            disconnect_timeout: Duration::from_millis(timing::DISCONNECT_TIMEOUT_MS),
            retry_backoff: Duration::from_millis(timing::RETRY_BACKOFF_MS),
            unavailable_backoff: Duration::from_millis(timing::UNAVAILABLE_BACKOFF_MS),
        }
    }
}

enum Command {
    Connect {
        endpoint: Endpoint,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    MarkDiscovering,
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<ConnectionState>>>>;

/// Handle to one transport's connection driver
pub struct ConnectionMachine {
    kind: TransportKind,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    subscribers: Subscribers,
}

impl ConnectionMachine {
    /// Create the driver and spawn its command loop
    pub fn new(connector: Arc<dyn TransportConnector>, config: MachineConfig) -> Self {
        let kind = connector.kind();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));

        let loop_subscribers = Arc::clone(&subscribers);
        tokio::spawn(machine_loop(
            connector,
            config,
            command_rx,
            state_tx,
            loop_subscribers,
        ));

        Self {
            kind,
            commands: command_tx,
            state: state_rx,
            subscribers,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Request a connection attempt.
    ///
    /// Resolves once the attempt is accepted (state `Connecting`) or
    /// rejected; the handshake outcome arrives on the state stream. A
    /// request for the endpoint already being dialed, or any request while
    /// connected, is rejected with `AlreadyConnecting`. A request for a
    /// different endpoint during an attempt supersedes that attempt.
    pub async fn connect(&self, endpoint: Endpoint) -> Result<(), ConnectError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Connect {
                endpoint,
                reply: reply_tx,
            })
            .map_err(|_| ConnectError::DriverGone)?;
        reply_rx.await.map_err(|_| ConnectError::DriverGone)?
    }

    /// Tear down whatever is in flight; resolves once the state is `Idle`.
    /// Bounded by the disconnect timeout, never errors.
    pub async fn disconnect(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Disconnect { reply: reply_tx })
            .is_err()
        {
            return;
        }
        let _ = reply_rx.await;
    }

    /// Signal that discovery is active for this transport
    pub fn mark_discovering(&self) {
        let _ = self.commands.send(Command::MarkDiscovering);
    }

    /// Register an observer receiving every state transition, in order
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionState> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }
}

/// Apply an event to the machine, publishing the new state on success
fn apply(
    kind: TransportKind,
    fsm: &mut LinkStateMachine,
    event: LinkEvent,
    state: &watch::Sender<ConnectionState>,
    subscribers: &Subscribers,
) {
    match fsm.process_event(event) {
        TransitionResult::Success(new_state) => {
            debug!(transport = %kind, state = %new_state, "state changed");
            let _ = state.send(new_state.clone());
            if let Ok(mut subs) = subscribers.lock() {
                subs.retain(|sub| sub.send(new_state.clone()).is_ok());
            }
        }
        TransitionResult::Invalid { from, event } => {
            debug!(transport = %kind, ?from, ?event, "ignoring invalid transition");
        }
    }
}

enum AttemptOutcome {
    Resolved(Result<Box<dyn BridgeSession>, FailureReason>),
    Cancelled(oneshot::Sender<()>),
    Superseded(Endpoint, oneshot::Sender<Result<(), ConnectError>>),
    CommandsClosed,
}

enum ConnectedExit {
    Lost(String),
    Disconnect(oneshot::Sender<()>),
    CommandsClosed,
}

/// Command loop: the single writer of this transport's connection state
async fn machine_loop(
    connector: Arc<dyn TransportConnector>,
    config: MachineConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    subscribers: Subscribers,
) {
    let kind = connector.kind();
    let mut fsm = LinkStateMachine::new();

    loop {
        match fsm.state().clone() {
            ConnectionState::Idle | ConnectionState::Discovering => {
                match commands.recv().await {
                    None => return,
                    Some(Command::Connect { endpoint, reply }) => {
                        apply(
                            kind,
                            &mut fsm,
                            LinkEvent::ConnectRequested(endpoint),
                            &state,
                            &subscribers,
                        );
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Disconnect { reply }) => {
                        apply(kind, &mut fsm, LinkEvent::Disconnected, &state, &subscribers);
                        let _ = reply.send(());
                    }
                    Some(Command::MarkDiscovering) => {
                        apply(
                            kind,
                            &mut fsm,
                            LinkEvent::DiscoveryStarted,
                            &state,
                            &subscribers,
                        );
                    }
                }
            }

            ConnectionState::Connecting(endpoint) => {
                let outcome = {
                    let attempt = timeout(config.connect_timeout, connector.connect(&endpoint));
                    tokio::pin!(attempt);
                    loop {
                        tokio::select! {
                            result = &mut attempt => {
                                break match result {
                                    Ok(result) => AttemptOutcome::Resolved(result),
                                    Err(_) => AttemptOutcome::Resolved(Err(FailureReason::Timeout)),
                                };
                            }
                            command = commands.recv() => match command {
                                None => break AttemptOutcome::CommandsClosed,
                                Some(Command::Disconnect { reply }) => {
                                    break AttemptOutcome::Cancelled(reply);
                                }
                                Some(Command::Connect { endpoint: next, reply }) => {
                                    if next == endpoint {
                                        let _ = reply.send(Err(ConnectError::AlreadyConnecting));
                                    } else {
                                        break AttemptOutcome::Superseded(next, reply);
                                    }
                                }
                                Some(Command::MarkDiscovering) => {}
                            },
                        }
                    }
                    // the block ends here: an unresolved attempt is dropped,
                    // releasing its socket or peripheral handle before the
                    // state leaves Connecting
                };

                match outcome {
                    AttemptOutcome::Resolved(Ok(mut session)) => {
                        info!(transport = %kind, endpoint = %endpoint, "connected");
                        apply(
                            kind,
                            &mut fsm,
                            LinkEvent::HandshakeSucceeded,
                            &state,
                            &subscribers,
                        );

                        let exit = loop {
                            tokio::select! {
                                reason = session.wait_closed() => break ConnectedExit::Lost(reason),
                                command = commands.recv() => match command {
                                    None => break ConnectedExit::CommandsClosed,
                                    Some(Command::Disconnect { reply }) => {
                                        break ConnectedExit::Disconnect(reply);
                                    }
                                    Some(Command::Connect { reply, .. }) => {
                                        let _ = reply.send(Err(ConnectError::AlreadyConnecting));
                                    }
                                    Some(Command::MarkDiscovering) => {}
                                },
                            }
                        };

                        match exit {
                            ConnectedExit::Lost(reason) => {
                                warn!(transport = %kind, reason = %reason, "connection lost");
                                apply(
                                    kind,
                                    &mut fsm,
                                    LinkEvent::Disconnected,
                                    &state,
                                    &subscribers,
                                );
                                apply(
                                    kind,
                                    &mut fsm,
                                    LinkEvent::DiscoveryStarted,
                                    &state,
                                    &subscribers,
                                );
                            }
                            ConnectedExit::Disconnect(reply) => {
                                match timeout(config.disconnect_timeout, session.close()).await {
                                    Ok(Ok(())) => {}
                                    Ok(Err(e)) => {
                                        debug!(transport = %kind, error = %e, "close error")
                                    }
                                    Err(_) => {
                                        warn!(transport = %kind, "graceful close timed out, forcing idle")
                                    }
                                }
                                apply(
                                    kind,
                                    &mut fsm,
                                    LinkEvent::Disconnected,
                                    &state,
                                    &subscribers,
                                );
                                let _ = reply.send(());
                            }
                            ConnectedExit::CommandsClosed => return,
                        }
                    }
                    AttemptOutcome::Resolved(Err(reason)) => {
                        warn!(
                            transport = %kind,
                            endpoint = %endpoint,
                            error = %reason,
                            "connection attempt failed"
                        );
                        apply(
                            kind,
                            &mut fsm,
                            LinkEvent::HandshakeFailed(reason),
                            &state,
                            &subscribers,
                        );
                    }
                    AttemptOutcome::Cancelled(reply) => {
                        info!(transport = %kind, endpoint = %endpoint, "connection attempt cancelled");
                        apply(kind, &mut fsm, LinkEvent::Disconnected, &state, &subscribers);
                        let _ = reply.send(());
                    }
                    AttemptOutcome::Superseded(next, reply) => {
                        info!(transport = %kind, from = %endpoint, to = %next, "superseding in-flight attempt");
                        apply(
                            kind,
                            &mut fsm,
                            LinkEvent::ConnectRequested(next),
                            &state,
                            &subscribers,
                        );
                        let _ = reply.send(Ok(()));
                    }
                    AttemptOutcome::CommandsClosed => return,
                }
            }

            ConnectionState::Failed(reason) => {
                let backoff = if reason.is_transport_unavailable() {
                    config.unavailable_backoff
                } else {
                    config.retry_backoff
                };
                let retry = tokio::time::sleep(backoff);
                tokio::pin!(retry);
                loop {
                    tokio::select! {
                        _ = &mut retry => {
                            apply(kind, &mut fsm, LinkEvent::RetryElapsed, &state, &subscribers);
                            break;
                        }
                        command = commands.recv() => match command {
                            None => return,
                            Some(Command::Connect { endpoint, reply }) => {
                                apply(
                                    kind,
                                    &mut fsm,
                                    LinkEvent::ConnectRequested(endpoint),
                                    &state,
                                    &subscribers,
                                );
                                let _ = reply.send(Ok(()));
                                break;
                            }
                            Some(Command::Disconnect { reply }) => {
                                apply(kind, &mut fsm, LinkEvent::Disconnected, &state, &subscribers);
                                let _ = reply.send(());
                                break;
                            }
                            Some(Command::MarkDiscovering) => {}
                        },
                    }
                }
            }

            ConnectionState::Connected(_) => {
                // Connected is driven inline after a successful attempt;
                // reaching here means the session is gone, so reset.
                apply(kind, &mut fsm, LinkEvent::Disconnected, &state, &subscribers);
            }
        }
    }
}

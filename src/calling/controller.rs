//! Single-task driver for the call machine.
//!
//! UI commands, relay messages, peer events and the one-second tick all
//! land in one `select!` loop, so transitions never interleave. After each
//! event the current [`CallSnapshot`] is published on a watch channel.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use super::machine::{CallDeps, CallMachine};
use super::peer::{PeerEvent, RemoteMediaSink, RemoteStream};
use super::{CallError, CallSnapshot, CallState};
use crate::signaling::{CallType, Inbound, UserId};

const TICK: Duration = Duration::from_secs(1);

enum CallCommand {
    Start {
        target: UserId,
        call_type: CallType,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject,
    End,
    ToggleMute,
    ToggleCamera,
}

/// Clonable UI-side handle to a running [`CallController`].
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<CallCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
    remote: watch::Receiver<Option<RemoteStream>>,
}

impl CallHandle {
    /// Start an outgoing call. Resolves once the offer is out (or failed).
    pub async fn start_call(&self, target: UserId, call_type: CallType) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(CallCommand::Start {
            target,
            call_type,
            reply,
        })?;
        rx.await.map_err(|_| CallError::ControllerGone)?
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(CallCommand::Accept { reply })?;
        rx.await.map_err(|_| CallError::ControllerGone)?
    }

    pub fn reject_call(&self) -> Result<(), CallError> {
        self.send(CallCommand::Reject)
    }

    pub fn end_call(&self) -> Result<(), CallError> {
        self.send(CallCommand::End)
    }

    pub fn toggle_mute(&self) -> Result<(), CallError> {
        self.send(CallCommand::ToggleMute)
    }

    pub fn toggle_camera(&self) -> Result<(), CallError> {
        self.send(CallCommand::ToggleCamera)
    }

    /// Latest published state.
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// The remote stream of the current call, if any track arrived.
    pub fn remote_stream(&self) -> watch::Receiver<Option<RemoteStream>> {
        self.remote.clone()
    }

    fn send(&self, command: CallCommand) -> Result<(), CallError> {
        self.commands
            .send(command)
            .map_err(|_| CallError::ControllerGone)
    }
}

pub struct CallController {
    machine: CallMachine,
    commands: mpsc::UnboundedReceiver<CallCommand>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    snapshot: watch::Sender<CallSnapshot>,
}

impl CallController {
    /// `inbound` is the one and only consumer of relay messages.
    pub fn new(
        local_user: UserId,
        deps: CallDeps,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        ring_timeout_secs: u64,
    ) -> (Self, CallHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (sink, remote) = RemoteMediaSink::new();
        let machine = CallMachine::new(local_user, deps, peer_tx, sink, ring_timeout_secs);
        let (snap_tx, snap_rx) = watch::channel(machine.snapshot());

        let controller = Self {
            machine,
            commands: cmd_rx,
            inbound,
            peer_events: peer_rx,
            snapshot: snap_tx,
        };
        let handle = CallHandle {
            commands: cmd_tx,
            snapshot: snap_rx,
            remote,
        };
        (controller, handle)
    }

    /// Run until every [`CallHandle`] is dropped. A call still in progress
    /// at that point is hung up.
    pub async fn run(mut self) {
        let mut tick = time::interval_at(Instant::now() + TICK, TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!("Call controller for {} started", self.machine.local_user());
        loop {
            let before = self.machine.state();
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                Some(inbound) = self.inbound.recv() => {
                    tracing::debug!("Relay {} from {}", inbound.message.kind(), inbound.from);
                    self.machine.handle_signal(inbound).await;
                    self.publish();
                }
                Some(event) = self.peer_events.recv() => {
                    self.machine.on_peer_event(event).await;
                    self.publish();
                }
                _ = tick.tick() => {
                    self.machine.on_tick().await;
                    self.publish();
                }
            }
            // Ring and duration seconds count from the moment the state is entered.
            let after = self.machine.state();
            if after != before && matches!(after, CallState::Calling | CallState::Connected) {
                tick.reset();
            }
        }

        self.machine.end_call().await;
        self.publish();
        tracing::debug!("Call controller stopped");
    }

    async fn handle_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::Start {
                target,
                call_type,
                reply,
            } => {
                let result = self.machine.start_call(target, call_type).await;
                self.publish();
                let _ = reply.send(result);
            }
            CallCommand::Accept { reply } => {
                let result = self.machine.accept_call().await;
                self.publish();
                let _ = reply.send(result);
            }
            CallCommand::Reject => {
                self.machine.reject_call().await;
                self.publish();
            }
            CallCommand::End => {
                self.machine.end_call().await;
                self.publish();
            }
            CallCommand::ToggleMute => {
                let muted = self.machine.toggle_mute();
                tracing::info!("Microphone {}", if muted { "muted" } else { "on" });
                self.publish();
            }
            CallCommand::ToggleCamera => {
                let off = self.machine.toggle_camera();
                tracing::info!("Camera {}", if off { "off" } else { "on" });
                self.publish();
            }
        }
    }

    fn publish(&self) {
        let snapshot = self.machine.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

//! Interactive call sessions for the CLI.
//!
//! A [`Session`] wires one relay client, one call controller and the
//! configured collaborators together. `place_call` and `listen` then follow
//! the published call state on stdout and map single-letter stdin commands
//! onto the call handle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::calling::media::SyntheticDevices;
use crate::calling::records::{CallRecordStore, HttpCallRecords, NoopCallRecords};
use crate::calling::rtc::RtcConnector;
use crate::calling::{CallController, CallDeps, CallHandle, CallSnapshot, CallState};
use crate::config::Config;
use crate::signaling::{CallType, RelayClient, RelayHandle, UserId};

/// How long to wait for the first relay registration.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for a final `end` to reach the relay on shutdown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Session {
    pub user: UserId,
    pub calls: CallHandle,
    relay: RelayHandle,
    controller: JoinHandle<()>,
    relay_task: JoinHandle<()>,
}

impl Session {
    /// Connect to the relay and start the call controller.
    pub async fn start(config: &Config, user: &str) -> Result<Self> {
        let user = UserId::new(user);
        let (client, relay, inbound) = RelayClient::new(config.relay_url.clone(), user.clone());
        let relay_task = tokio::spawn(client.run());

        let deps = CallDeps {
            media: Arc::new(SyntheticDevices {
                microphone: config.media.microphone,
                camera: config.media.camera,
            }),
            connector: Arc::new(RtcConnector::new(config.ice_servers.clone())),
            signals: Arc::new(relay.clone()),
            records: record_store(config),
        };
        let (controller, calls) =
            CallController::new(user.clone(), deps, inbound, config.ring_timeout_secs);
        let controller = tokio::spawn(controller.run());

        time::timeout(CONNECT_TIMEOUT, relay.wait_connected())
            .await
            .with_context(|| format!("Relay at {} not reachable", config.relay_url))??;

        Ok(Self {
            user,
            calls,
            relay,
            controller,
            relay_task,
        })
    }

    /// Hang up anything in progress and let the relay client flush.
    pub async fn shutdown(self) {
        let Session {
            calls,
            relay,
            controller,
            relay_task,
            ..
        } = self;
        drop(calls);
        drop(relay);
        if let Err(e) = controller.await {
            tracing::warn!("Call controller task failed: {}", e);
        }
        if time::timeout(FLUSH_TIMEOUT, relay_task).await.is_err() {
            tracing::debug!("Relay client did not stop in time");
        }
    }
}

fn record_store(config: &Config) -> Arc<dyn CallRecordStore> {
    match config.records_url.as_deref() {
        Some(url) if !url.is_empty() => {
            tracing::debug!("Call records go to {}", url);
            Arc::new(HttpCallRecords::new(url))
        }
        _ => Arc::new(NoopCallRecords),
    }
}

/// Single-letter commands read from stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    Accept,
    Reject,
    HangUp,
    Mute,
    Camera,
    Quit,
}

fn parse_key(line: &str) -> Option<Key> {
    match line.trim().to_ascii_lowercase().as_str() {
        "a" => Some(Key::Accept),
        "r" => Some(Key::Reject),
        "h" => Some(Key::HangUp),
        "m" => Some(Key::Mute),
        "c" => Some(Key::Camera),
        "q" => Some(Key::Quit),
        _ => None,
    }
}

/// What the user should be told about the step from `prev` to `snap`.
fn transition_lines(prev: &CallSnapshot, snap: &CallSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    if snap.last_end != prev.last_end {
        if let Some(end) = &snap.last_end {
            lines.push(format!(
                "Call with {} ended: {} ({}s)",
                end.peer, end.cause, end.duration_secs
            ));
        }
    }
    if snap.state == prev.state && snap.call_id == prev.call_id {
        return lines;
    }
    let peer = snap
        .peer
        .as_ref()
        .map(|p| p.to_string())
        .unwrap_or_default();
    match snap.state {
        CallState::Calling => {
            let call_type = snap.call_type.unwrap_or(CallType::Voice);
            lines.push(format!("Calling {} ({} call)...", peer, call_type));
        }
        CallState::Ringing => {
            if let Some(incoming) = &snap.incoming {
                lines.push(format!(
                    "Incoming {} call from {}. Press a to accept, r to reject.",
                    incoming.call_type, incoming.caller_id
                ));
            }
        }
        CallState::Connected => {
            lines.push(format!(
                "Connected with {}. Keys: m mute, c camera, h hang up.",
                peer
            ));
        }
        CallState::Idle | CallState::Ended => {}
    }
    lines
}

/// True once a call ended and nothing replaced it.
///
/// Losing a simultaneous-call race ends our own attempt but leaves us
/// connected on the other side's call, so `last_end` alone is not enough.
fn call_finished(prev: &CallSnapshot, snap: &CallSnapshot) -> bool {
    snap.last_end != prev.last_end && snap.state == CallState::Idle
}

enum Mode {
    /// Follow one outgoing call; hang up `hangup_after` seconds after connect.
    Call { hangup_after: Option<u64> },
    /// Wait for incoming calls until the user quits.
    Listen { auto_accept: bool },
}

/// Place a call to `target` and follow it until it ends.
pub async fn place_call(
    config: &Config,
    user: &str,
    target: &str,
    video: bool,
    hangup_after: Option<u64>,
) -> Result<()> {
    let session = Session::start(config, user).await?;
    let call_type = if video {
        CallType::Video
    } else {
        CallType::Voice
    };

    let before = session.calls.snapshot();
    let started = session
        .calls
        .start_call(UserId::new(target), call_type)
        .await;
    let result = match started {
        Ok(()) => interact(&session, before, Mode::Call { hangup_after }).await,
        Err(e) => Err(e.into()),
    };
    session.shutdown().await;
    result
}

/// Register and wait for incoming calls.
pub async fn listen(config: &Config, user: &str, auto_accept: bool) -> Result<()> {
    let session = Session::start(config, user).await?;
    println!("Listening for calls as {}. Press q to quit.", session.user);
    let before = session.calls.snapshot();
    let result = interact(&session, before, Mode::Listen { auto_accept }).await;
    session.shutdown().await;
    result
}

async fn interact(session: &Session, mut prev: CallSnapshot, mode: Mode) -> Result<()> {
    let calls = &session.calls;
    let mut updates = WatchStream::new(calls.subscribe());
    let mut remote = WatchStream::new(calls.remote_stream());
    let mut keys = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut hangup_at: Option<Instant> = None;

    loop {
        tokio::select! {
            Some(snap) = updates.next() => {
                for line in transition_lines(&prev, &snap) {
                    println!("{}", line);
                }
                let entered = snap.state != prev.state;
                let finished = call_finished(&prev, &snap);
                prev = snap;

                match &mode {
                    Mode::Call { hangup_after } => {
                        if finished {
                            break;
                        }
                        if entered && prev.state == CallState::Connected {
                            hangup_at = hangup_after
                                .map(|secs| Instant::now() + Duration::from_secs(secs));
                        }
                    }
                    Mode::Listen { auto_accept: true } if entered && prev.state == CallState::Ringing => {
                        if let Err(e) = calls.accept_call().await {
                            println!("Could not accept call: {}", e);
                        }
                    }
                    Mode::Listen { .. } => {}
                }
            }
            Some(Some(stream)) = remote.next() => {
                let kinds: Vec<String> = stream.tracks.iter().map(|t| t.kind.to_string()).collect();
                println!("Receiving {} from the other side.", kinds.join(" + "));
            }
            line = keys.next_line(), if stdin_open => {
                let key = match line {
                    Ok(Some(line)) => parse_key(&line),
                    Ok(None) | Err(_) => {
                        stdin_open = false;
                        None
                    }
                };
                match key {
                    Some(Key::Accept) => {
                        if let Err(e) = calls.accept_call().await {
                            println!("Could not accept call: {}", e);
                        }
                    }
                    Some(Key::Reject) => calls.reject_call()?,
                    Some(Key::HangUp) => calls.end_call()?,
                    Some(Key::Mute) => calls.toggle_mute()?,
                    Some(Key::Camera) => calls.toggle_camera()?,
                    Some(Key::Quit) => {
                        calls.end_call()?;
                        break;
                    }
                    None => {}
                }
            }
            _ = time::sleep_until(hangup_at.unwrap_or_else(Instant::now)), if hangup_at.is_some() => {
                hangup_at = None;
                println!("Hanging up.");
                calls.end_call()?;
            }
            _ = tokio::signal::ctrl_c() => {
                calls.end_call()?;
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::{CallEnded, EndCause, IncomingCall};
    use crate::signaling::CallId;

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("a\n"), Some(Key::Accept));
        assert_eq!(parse_key(" M "), Some(Key::Mute));
        assert_eq!(parse_key("q"), Some(Key::Quit));
        assert_eq!(parse_key("hello"), None);
        assert_eq!(parse_key(""), None);
    }

    #[test]
    fn test_incoming_call_banner() {
        let prev = CallSnapshot::default();
        let snap = CallSnapshot {
            state: CallState::Ringing,
            call_id: Some(CallId::new("c1")),
            peer: Some(UserId::new("alice")),
            call_type: Some(CallType::Video),
            incoming: Some(IncomingCall {
                call_id: CallId::new("c1"),
                caller_id: UserId::new("alice"),
                call_type: CallType::Video,
            }),
            ..Default::default()
        };
        assert_eq!(
            transition_lines(&prev, &snap),
            vec!["Incoming video call from alice. Press a to accept, r to reject.".to_string()]
        );
        assert!(transition_lines(&snap, &snap).is_empty());
    }

    #[test]
    fn test_yielded_call_does_not_finish_session() {
        let calling = CallSnapshot {
            state: CallState::Calling,
            call_id: Some(CallId::new("mine")),
            peer: Some(UserId::new("alice")),
            call_type: Some(CallType::Voice),
            ..Default::default()
        };
        let yielded = CallSnapshot {
            state: CallState::Connected,
            call_id: Some(CallId::new("theirs")),
            last_end: Some(CallEnded {
                call_id: CallId::new("mine"),
                peer: UserId::new("alice"),
                cause: EndCause::Yielded,
                duration_secs: 0,
            }),
            ..calling.clone()
        };
        assert!(!call_finished(&calling, &yielded));

        let hung_up = CallSnapshot {
            last_end: Some(CallEnded {
                call_id: CallId::new("theirs"),
                peer: UserId::new("alice"),
                cause: EndCause::RemoteHungUp,
                duration_secs: 12,
            }),
            ..CallSnapshot::default()
        };
        assert!(call_finished(&yielded, &hung_up));
        assert!(!call_finished(&hung_up, &hung_up));
    }

    #[test]
    fn test_end_reported_before_next_call() {
        let prev = CallSnapshot {
            state: CallState::Calling,
            call_id: Some(CallId::new("mine")),
            peer: Some(UserId::new("bob")),
            call_type: Some(CallType::Voice),
            ..Default::default()
        };
        let snap = CallSnapshot {
            state: CallState::Connected,
            call_id: Some(CallId::new("theirs")),
            peer: Some(UserId::new("bob")),
            call_type: Some(CallType::Voice),
            last_end: Some(CallEnded {
                call_id: CallId::new("mine"),
                peer: UserId::new("bob"),
                cause: EndCause::Yielded,
                duration_secs: 0,
            }),
            ..Default::default()
        };
        assert_eq!(
            transition_lines(&prev, &snap),
            vec![
                "Call with bob ended: yielded to incoming call (0s)".to_string(),
                "Connected with bob. Keys: m mute, c camera, h hang up.".to_string(),
            ]
        );
    }
}

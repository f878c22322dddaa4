use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::api::CommandApi;
use crate::config::RelayDevice;
use crate::messages::{ChannelEvent, InboundEvent, PresenceUpdate, Status};

/// Exact greeting a live device answers (and announces) with.
const AFFIRM_TOKEN: &str = "hi!";
/// Exact goodbye a device announces when disconnecting cleanly.
const NEGATE_TOKEN: &str = "byebye";
/// Reserved last-will payload published by the backend on behalf of a device
/// that dropped without saying goodbye.
const NEGATE_LWT_TOKEN: &str = "offline";

#[derive(Debug, PartialEq)]
enum Signal {
    Affirm,
    Negate,
}

fn normalize_payload(payload: &serde_json::Value) -> String {
    match payload.as_str() {
        Some(s) => s.trim().to_lowercase(),
        None => payload.to_string().trim().to_lowercase(),
    }
}

fn classify_payload(payload: &serde_json::Value) -> Option<Signal> {
    match normalize_payload(payload).as_str() {
        AFFIRM_TOKEN => Some(Signal::Affirm),
        NEGATE_TOKEN | NEGATE_LWT_TOKEN => Some(Signal::Negate),
        _ => None,
    }
}

/// Split a `<model>/<deviceId>/<subpath>` topic.
fn split_topic(topic: &str) -> Option<(&str, &str, &str)> {
    let mut parts = topic.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(model), Some(id), Some(sub)) if !model.is_empty() && !id.is_empty() => {
            Some((model, id, sub))
        }
        _ => None,
    }
}

#[derive(Debug)]
pub enum Command {
    Track(RelayDevice),
    Untrack(String),
    Recheck(String),
}

struct DeviceState {
    model: String,
    status: Status,
    // Bumped on every arm/cancel so a timeout that already left its task
    // cannot act after being superseded.
    generation: u64,
    timeout: Option<JoinHandle<()>>,
    // Liveness request waiting for the channel to open. Cleared when fired,
    // so a later reopen does not fire it again.
    deferred: bool,
}

impl DeviceState {
    fn cancel_timeout(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
    }
}

/// Per-device presence state machine. Runs as a single task; every
/// transition happens in `run`'s loop in event-arrival order, so the single
/// pending timeout per device needs no locking.
pub struct PresenceTracker {
    devices: HashMap<String, DeviceState>,
    api: CommandApi,
    answer_timeout: Duration,
    channel_open: bool,
    commands: mpsc::Receiver<Command>,
    channel_rx: broadcast::Receiver<ChannelEvent>,
    events_rx: broadcast::Receiver<InboundEvent>,
    expired_tx: mpsc::Sender<(String, u64)>,
    expired_rx: mpsc::Receiver<(String, u64)>,
    updates: broadcast::Sender<PresenceUpdate>,
}

impl PresenceTracker {
    pub fn new(
        api: CommandApi,
        answer_timeout: Duration,
        channel_rx: broadcast::Receiver<ChannelEvent>,
        events_rx: broadcast::Receiver<InboundEvent>,
    ) -> (Self, mpsc::Sender<Command>) {
        let (cmd_tx, commands) = mpsc::channel(16);
        let (expired_tx, expired_rx) = mpsc::channel(16);
        let (updates, _) = broadcast::channel(64);
        (
            PresenceTracker {
                devices: HashMap::new(),
                api,
                answer_timeout,
                channel_open: false,
                commands,
                channel_rx,
                events_rx,
                expired_tx,
                expired_rx,
                updates,
            },
            cmd_tx,
        )
    }

    pub fn updates(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.updates.subscribe()
    }

    /// Drive the state machine until all command senders are dropped or the
    /// channel manager goes away. Pending timeouts are cancelled on exit.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Track(device)) => self.track(device),
                    Some(Command::Recheck(id)) => self.recheck(&id),
                    Some(Command::Untrack(id)) => self.untrack(&id),
                    None => break,
                },
                Some((id, generation)) = self.expired_rx.recv() => {
                    self.on_timeout(&id, generation);
                }
                ev = self.channel_rx.recv() => match ev {
                    Ok(ChannelEvent::Open) => self.on_channel_open(),
                    Ok(ChannelEvent::Closed) => self.channel_open = false,
                    Ok(ChannelEvent::Frame(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Presence tracker lagged, {} channel events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                ev = self.events_rx.recv() => match ev {
                    Ok(event) => self.on_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Presence tracker lagged, {} events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        for state in self.devices.values_mut() {
            state.cancel_timeout();
        }
        debug!("Presence tracker stopped");
    }

    fn track(&mut self, device: RelayDevice) {
        info!("Tracking device {} ({})", device.id, device.model);
        let id = device.id.clone();
        self.devices.insert(
            id.clone(),
            DeviceState {
                model: device.model,
                status: Status::Checking,
                generation: 0,
                timeout: None,
                deferred: false,
            },
        );
        self.publish(&id, Status::Checking);
        self.start_check(&id);
    }

    fn untrack(&mut self, id: &str) {
        if let Some(mut state) = self.devices.remove(id) {
            state.cancel_timeout();
            info!("Stopped tracking device {}", id);
        }
    }

    fn recheck(&mut self, id: &str) {
        let Some(state) = self.devices.get_mut(id) else {
            warn!("Recheck requested for untracked device {}", id);
            return;
        };
        state.cancel_timeout();
        self.set_status(id, Status::Checking);
        self.start_check(id);
    }

    fn start_check(&mut self, id: &str) {
        if !self.channel_open {
            if let Some(state) = self.devices.get_mut(id) {
                debug!("Channel not open, deferring liveness check for {}", id);
                state.deferred = true;
            }
            return;
        }
        self.fire_check(id);
    }

    /// Send the liveness request and arm the answer timeout. The previous
    /// timeout, if any, is cancelled first so at most one is ever pending.
    fn fire_check(&mut self, id: &str) {
        let Some(state) = self.devices.get_mut(id) else {
            return;
        };
        state.cancel_timeout();

        let api = self.api.clone();
        let device = id.to_string();
        tokio::spawn(async move {
            // A failed request never changes state by itself. The timeout
            // stays authoritative.
            if let Err(err) = api.ask_info(&device).await {
                warn!("Liveness request for {} failed: {:?}", device, err);
            }
        });

        let generation = state.generation;
        let expired_tx = self.expired_tx.clone();
        let device = id.to_string();
        let timeout = self.answer_timeout;
        state.timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = expired_tx.send((device, generation)).await;
        }));
    }

    fn on_channel_open(&mut self) {
        self.channel_open = true;
        let deferred: Vec<String> = self
            .devices
            .iter_mut()
            .filter_map(|(id, state)| std::mem::take(&mut state.deferred).then(|| id.clone()))
            .collect();
        for id in deferred {
            debug!("Channel open, firing deferred liveness check for {}", id);
            self.fire_check(&id);
        }
    }

    fn on_timeout(&mut self, id: &str, generation: u64) {
        let Some(state) = self.devices.get_mut(id) else {
            return;
        };
        if generation != state.generation {
            debug!("Ignoring stale timeout for {}", id);
            return;
        }
        state.timeout = None;
        if state.status == Status::Checking {
            info!("No answer from {} in {:?}", id, self.answer_timeout);
            self.set_status(id, Status::Offline);
        }
    }

    fn on_event(&mut self, event: &InboundEvent) {
        let Some((model, id, sub)) = split_topic(&event.topic) else {
            return;
        };
        let Some(state) = self.devices.get(id) else {
            return;
        };
        if state.model != model {
            return;
        }
        let Some(signal) = classify_payload(&event.payload) else {
            debug!("Unrecognized payload on {}: {}", event.topic, event.payload);
            return;
        };

        let next = match (sub, signal) {
            // A device answering the liveness question is online no matter
            // what we thought before.
            ("answerInfo", Signal::Affirm) => Status::Online,
            // Unsolicited announcements; "status" is the reserved last-will
            // topic and reads the same way.
            ("will" | "status", Signal::Affirm) => Status::Online,
            ("will" | "status", Signal::Negate) => Status::Offline,
            _ => return,
        };

        let id = id.to_string();
        if let Some(state) = self.devices.get_mut(&id) {
            state.cancel_timeout();
        }
        self.set_status(&id, next);
    }

    fn set_status(&mut self, id: &str, status: Status) {
        let Some(state) = self.devices.get_mut(id) else {
            return;
        };
        if state.status == status {
            return;
        }
        info!("Device {} is now {:?}", id, status);
        state.status = status;
        self.publish(id, status);
    }

    fn publish(&self, id: &str, status: Status) {
        let update = PresenceUpdate {
            device_id: id.to_string(),
            status,
        };
        if self.updates.send(update).is_err() {
            debug!("No subscribers for presence updates");
        }
    }
}

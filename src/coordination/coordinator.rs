// Fleet coordinator.
//
// Owns the authoritative engine and mirrors every committed transition to
// the subordinate nodes. Fan-outs are driven by the engine's state-changed
// hook, so completion-driven advances (STARTING to EXECUTE and the like)
// reach the fleet the same way commanded transitions do. Status is
// broadcast only after a gather settles, so subordinates never observe a
// state the fleet has not been asked to follow.

use crate::engine::{Engine, EngineBuilder};
use crate::errors::{CommandError, CoordinationError, TransportError};
use crate::observability::{coordination_metrics, create_fan_out_span};
use crate::state::{ModeProfile, ModeType, State, Status, TransitionCmd};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::transport::{Transport, TransitionAck};

const DEFAULT_FAN_OUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Settled result of one fan-out round, keyed by the state that triggered it.
#[derive(Debug, Clone)]
struct FanOutNotice {
    state: State,
    outcome: Result<(), CoordinationError>,
}

/// Roster and timing knobs for a [`Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub nodes: Vec<String>,
    pub fan_out_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            fan_out_timeout: DEFAULT_FAN_OUT_TIMEOUT,
        }
    }
}

impl CoordinatorSettings {
    pub fn with_nodes<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn fan_out_timeout(mut self, timeout: Duration) -> Self {
        self.fan_out_timeout = timeout;
        self
    }
}

/// Drives the local engine and keeps the subordinate fleet in lockstep.
pub struct Coordinator {
    engine: Arc<Engine>,
    transport: Arc<dyn Transport>,
    nodes: Arc<Vec<String>>,
    fan_out_timeout: Duration,
    mode_profiles: HashMap<i8, ModeProfile>,
    results: broadcast::Sender<FanOutNotice>,
    settled: Arc<std::sync::Mutex<Status>>,
    op_lock: Mutex<()>,
    driver: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Coordinator {
    /// Wire a coordinator around an engine under construction. The engine's
    /// state-changed hook is claimed by the coordinator; the caller keeps
    /// any work bindings and cycle settings already on the builder. Must be
    /// called from within a Tokio runtime.
    pub fn new(
        builder: EngineBuilder,
        transport: Arc<dyn Transport>,
        settings: CoordinatorSettings,
    ) -> Self {
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(
            builder
                .on_state_changed(Arc::new(move |state| {
                    let _ = state_tx.send(state);
                }))
                .build(),
        );
        let (results, _) = broadcast::channel(64);
        let settled = Arc::new(std::sync::Mutex::new(Status::new(
            State::Undefined,
            ModeType::UNDEFINED,
        )));
        let coordinator = Self {
            engine,
            transport: Arc::clone(&transport),
            nodes: Arc::new(settings.nodes),
            fan_out_timeout: settings.fan_out_timeout,
            mode_profiles: HashMap::new(),
            results: results.clone(),
            settled: Arc::clone(&settled),
            op_lock: Mutex::new(()),
            driver: std::sync::Mutex::new(None),
        };
        let driver = tokio::spawn(drive_fan_outs(
            state_rx,
            transport,
            Arc::clone(&coordinator.nodes),
            coordinator.fan_out_timeout,
            settled,
            results,
        ));
        *coordinator
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(driver);
        coordinator
    }

    /// Install externally configured availability masks, keyed by mode wire
    /// value. Modes without an entry fall back to the built-in profile.
    pub fn set_mode_profiles(&mut self, profiles: HashMap<i8, ModeProfile>) {
        self.mode_profiles = profiles;
    }

    pub fn activate(&self) -> Result<(), CommandError> {
        self.engine.activate()
    }

    pub fn shutdown(&self) {
        self.engine.deactivate();
        let handle = {
            let mut guard = self.driver.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Last settled status: the state of the most recent fan-out round the
    /// fleet acknowledged and the mode of the last fleet mode switch. This
    /// is the value subordinates saw published; UNDEFINED until a first
    /// round settles. The live engine view stays behind [`Self::engine`].
    pub fn status(&self) -> Status {
        *self.settled.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one transition command locally, then wait for the resulting
    /// fan-out round to settle across the fleet. A fleet failure does not
    /// roll the local engine back; the local transition committed before
    /// the first request left.
    pub async fn change_state(&self, cmd: TransitionCmd) -> Result<(), CoordinationError> {
        let _guard = self.op_lock.lock().await;
        let mut rx = self.results.subscribe();
        let outcome = self.engine.send_command(cmd).await;
        // Key the wait on the state the command itself committed, not on a
        // re-read of the engine; fast work can auto-advance past the
        // commanded state before we get back here.
        let committed = match (outcome.accepted, outcome.state) {
            (true, Some(state)) => state,
            _ => {
                let error = outcome.error.unwrap_or(CommandError::EngineInactive);
                return Err(CoordinationError::Command(error));
            }
        };
        debug!(command = %cmd, state = %committed, "local transition committed, awaiting fleet");
        let deadline = self.fan_out_timeout + Duration::from_secs(1);
        tokio::time::timeout(deadline, async {
            loop {
                match rx.recv().await {
                    Ok(notice) if notice.state == committed => return notice.outcome,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(CoordinationError::Command(CommandError::EngineInactive))
                    }
                }
            }
        })
        .await
        .unwrap_or(Err(CoordinationError::FanOutTimeout {
            timeout_secs: self.fan_out_timeout.as_secs(),
        }))
    }

    /// Switch the local mode, then fan the new mode out to the fleet and
    /// publish the settled status.
    pub async fn change_mode(&self, mode: ModeType) -> Result<(), CoordinationError> {
        let _guard = self.op_lock.lock().await;
        let profile = self
            .mode_profiles
            .get(&mode.0)
            .cloned()
            .unwrap_or_else(|| ModeProfile::for_mode(mode));
        self.engine
            .change_mode_with_profile(mode, profile)
            .await
            .map_err(CoordinationError::Command)?;
        let correlation_id = Uuid::new_v4().to_string();
        let span = create_fan_out_span("change_mode", &correlation_id);
        async {
            let mut requests = JoinSet::new();
            for node in self.nodes.iter() {
                let transport = Arc::clone(&self.transport);
                let node = node.clone();
                requests.spawn(async move {
                    let reply = transport.send_mode_transition(&node, mode).await;
                    (node, reply)
                });
            }
            gather(requests, self.fan_out_timeout).await?;
            let status = {
                let mut settled = self.settled.lock().unwrap_or_else(|e| e.into_inner());
                settled.mode = mode;
                *settled
            };
            self.transport.publish_status(status).await;
            info!(mode = %mode, "fleet switched mode");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs one fan-out round per committed engine state and reports each
/// round's outcome to any waiting command call. The published status always
/// carries the settled round's own state, never a later in-flight one.
async fn drive_fan_outs(
    mut state_rx: mpsc::UnboundedReceiver<State>,
    transport: Arc<dyn Transport>,
    nodes: Arc<Vec<String>>,
    fan_out_timeout: Duration,
    settled: Arc<std::sync::Mutex<Status>>,
    results: broadcast::Sender<FanOutNotice>,
) {
    while let Some(state) = state_rx.recv().await {
        let correlation_id = Uuid::new_v4().to_string();
        let span = create_fan_out_span("change_state", &correlation_id);
        let outcome = async {
            coordination_metrics().record_fan_out();
            let mut requests = JoinSet::new();
            for node in nodes.iter() {
                let transport = Arc::clone(&transport);
                let node = node.clone();
                requests.spawn(async move {
                    let reply = transport.send_state_transition(&node, state).await;
                    (node, reply)
                });
            }
            let outcome = gather(requests, fan_out_timeout).await;
            if outcome.is_ok() {
                let status = {
                    let mut settled = settled.lock().unwrap_or_else(|e| e.into_inner());
                    settled.state = state;
                    *settled
                };
                transport.publish_status(status).await;
                info!(state = %state, "fleet followed state change");
            }
            outcome
        }
        .instrument(span)
        .await;
        let _ = results.send(FanOutNotice { state, outcome });
    }
}

/// Wait for every dispatched request. Unreachable nodes are logged and
/// excluded; a node that answered but refused fails the round.
async fn gather(
    mut requests: JoinSet<(String, Result<TransitionAck, TransportError>)>,
    fan_out_timeout: Duration,
) -> Result<(), CoordinationError> {
    if requests.is_empty() {
        warn!("no subordinate nodes registered, nothing to fan out");
        return Err(CoordinationError::NoRequestsIssued);
    }
    let timeout_secs = fan_out_timeout.as_secs();
    let round = tokio::time::timeout(fan_out_timeout, async {
        let mut answered = 0usize;
        while let Some(joined) = requests.join_next().await {
            let Ok((node, reply)) = joined else {
                continue;
            };
            match reply {
                Ok(TransitionAck { success: true, .. }) => {
                    coordination_metrics().record_node_ack();
                    answered += 1;
                    debug!(node = %node, "node accepted transition request");
                }
                Ok(TransitionAck { message, .. }) => {
                    coordination_metrics().record_node_rejection();
                    warn!(node = %node, error = %message, "node rejected transition request");
                    return Err(CoordinationError::NodeRejected { node, message });
                }
                Err(TransportError::Unreachable { node }) => {
                    coordination_metrics().record_unreachable_node();
                    warn!(node = %node, "node unreachable, excluding from this round");
                }
                Err(TransportError::Failed { node, message }) => {
                    coordination_metrics().record_unreachable_node();
                    warn!(node = %node, error = %message, "transport failure, excluding node from this round");
                }
            }
        }
        Ok(answered)
    })
    .await;
    match round {
        Ok(Ok(0)) => Err(CoordinationError::NoRequestsIssued),
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(CoordinationError::FanOutTimeout { timeout_secs }),
    }
}

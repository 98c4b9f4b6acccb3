// PackML state machine engine.
//
// All state mutation happens on one processing task fed by an event channel.
// Callers never touch engine state directly: every command allocates its own
// oneshot reply and suspends until the engine context has evaluated the edge
// exactly once. Acting-state work runs on background tasks tagged with a
// generation counter so a completion from a preempted occupancy is dropped
// instead of being applied to a stale state.

use crate::errors::{CommandError, CommandOutcome};
use crate::observability::engine_metrics;
use crate::state::{
    completion_target, error_target,
    graph::{eligible_command_target, EdgeRejection},
    CycleMode, ModeProfile, ModeType, State, TransitionCmd,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Work bound to an acting state. Zero return means success and drives the
/// completion edge; non-zero drives the error edge into ABORTING.
pub type WorkFn = Arc<dyn Fn() -> i32 + Send + Sync>;

const DEFAULT_ACTING_DELAY: Duration = Duration::from_millis(200);

/// Observer invoked synchronously by the engine context after the current
/// state has been committed and before the issuing caller unblocks.
pub type StateHook = Arc<dyn Fn(State) + Send + Sync>;
pub type ModeHook = Arc<dyn Fn(ModeType) + Send + Sync>;

enum EngineEvent {
    Command {
        cmd: TransitionCmd,
        reply: oneshot::Sender<CommandOutcome>,
    },
    ChangeMode {
        mode: ModeType,
        profile: ModeProfile,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    WorkFinished {
        state: State,
        generation: u64,
        rtn: i32,
    },
    Shutdown,
}

/// Snapshot state shared between the processing task and handle readers.
struct EngineShared {
    state: AtomicI8,
    mode: AtomicI8,
    mode_set: AtomicBool,
    active: AtomicBool,
    dwell: Mutex<HashMap<State, Duration>>,
}

/// Construction-time configuration for an [`Engine`].
pub struct EngineBuilder {
    cycle: CycleMode,
    acting_delay: Duration,
    bindings: HashMap<State, WorkFn>,
    on_state_changed: Option<StateHook>,
    on_mode_changed: Option<ModeHook>,
}

impl EngineBuilder {
    /// EXECUTE auto-advances to COMPLETING once.
    pub fn single_cycle() -> Self {
        Self::new(CycleMode::Single)
    }

    /// EXECUTE loops on itself until explicitly commanded out.
    pub fn continuous_cycle() -> Self {
        Self::new(CycleMode::Continuous)
    }

    fn new(cycle: CycleMode) -> Self {
        Self {
            cycle,
            acting_delay: DEFAULT_ACTING_DELAY,
            bindings: HashMap::new(),
            on_state_changed: None,
            on_mode_changed: None,
        }
    }

    /// Delay standing in for unbound acting-state work.
    pub fn acting_delay(mut self, delay: Duration) -> Self {
        self.acting_delay = delay;
        self
    }

    /// Bind the EXECUTE state to a work function.
    pub fn bind_execute(self, work: WorkFn) -> Self {
        self.bind(State::Execute, work)
    }

    /// Bind the RESETTING state to a work function.
    pub fn bind_resetting(self, work: WorkFn) -> Self {
        self.bind(State::Resetting, work)
    }

    fn bind(mut self, state: State, work: WorkFn) -> Self {
        self.bindings.insert(state, work);
        self
    }

    pub fn on_state_changed(mut self, hook: StateHook) -> Self {
        self.on_state_changed = Some(hook);
        self
    }

    pub fn on_mode_changed(mut self, hook: ModeHook) -> Self {
        self.on_mode_changed = Some(hook);
        self
    }

    /// Build an inactive engine; call [`Engine::activate`] to start the
    /// processing task.
    pub fn build(self) -> Engine {
        Engine {
            shared: Arc::new(EngineShared {
                state: AtomicI8::new(State::Aborted as i8),
                mode: AtomicI8::new(ModeType::UNDEFINED.0),
                mode_set: AtomicBool::new(false),
                active: AtomicBool::new(false),
                dwell: Mutex::new(HashMap::new()),
            }),
            tx: Mutex::new(None),
            cycle: self.cycle,
            acting_delay: self.acting_delay,
            bindings: self.bindings,
            on_state_changed: self.on_state_changed,
            on_mode_changed: self.on_mode_changed,
        }
    }
}

/// Handle to one machine's state engine. Long-lived, one per node.
pub struct Engine {
    shared: Arc<EngineShared>,
    tx: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
    cycle: CycleMode,
    acting_delay: Duration,
    bindings: HashMap<State, WorkFn>,
    on_state_changed: Option<StateHook>,
    on_mode_changed: Option<ModeHook>,
}

impl Engine {
    /// Start the processing task. Fails if the engine is already active.
    pub fn activate(&self) -> Result<(), CommandError> {
        let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Err(CommandError::EngineAlreadyActive);
        }
        // A fresh core starts over from ABORTED with no mode; the shared
        // snapshot must not keep reporting the pre-deactivation values.
        self.shared.state.store(State::Aborted as i8, Ordering::SeqCst);
        self.shared.mode.store(ModeType::UNDEFINED.0, Ordering::SeqCst);
        self.shared.mode_set.store(false, Ordering::SeqCst);
        self.shared
            .dwell
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let (tx, rx) = mpsc::unbounded_channel();
        let core = EngineCore {
            current: State::Aborted,
            mode: None,
            profile: ModeProfile::all_available(),
            cycle: self.cycle,
            acting_delay: self.acting_delay,
            bindings: self.bindings.clone(),
            on_state_changed: self.on_state_changed.clone(),
            on_mode_changed: self.on_mode_changed.clone(),
            shared: Arc::clone(&self.shared),
            tx: tx.clone(),
            generation: 0,
            in_flight: None,
            entered_at: Instant::now(),
        };
        self.shared.active.store(true, Ordering::SeqCst);
        tokio::spawn(core.run(rx));
        *guard = Some(tx);
        info!(cycle = ?self.cycle, "state machine activated");
        Ok(())
    }

    /// Stop the processing task and abort any outstanding acting-state work.
    pub fn deactivate(&self) {
        let sender = {
            let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(tx) = sender {
            let _ = tx.send(EngineEvent::Shutdown);
        }
        self.shared.active.store(false, Ordering::SeqCst);
        info!("state machine deactivated");
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn current_state(&self) -> State {
        State::from_wire(self.shared.state.load(Ordering::SeqCst)).unwrap_or(State::Undefined)
    }

    /// UNDEFINED until the first successful mode change.
    pub fn current_mode(&self) -> ModeType {
        if self.shared.mode_set.load(Ordering::SeqCst) {
            ModeType(self.shared.mode.load(Ordering::SeqCst))
        } else {
            ModeType::UNDEFINED
        }
    }

    /// Cumulative occupancy per state, up to the last exit.
    pub fn dwell_times(&self) -> HashMap<State, Duration> {
        self.shared
            .dwell
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<EngineEvent>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Evaluate one transition command. Suspends the caller until the engine
    /// context has evaluated the edge (or determined none applies) and
    /// signaled this invocation's completion exactly once.
    pub async fn send_command(&self, cmd: TransitionCmd) -> CommandOutcome {
        if cmd == TransitionCmd::NoCommand {
            return CommandOutcome::rejected(CommandError::UnrecognizedCommand {
                command: cmd.to_string(),
            });
        }
        let Some(tx) = self.sender() else {
            return CommandOutcome::rejected(CommandError::EngineInactive);
        };
        let (reply, rx) = oneshot::channel();
        if tx.send(EngineEvent::Command { cmd, reply }).is_err() {
            return CommandOutcome::rejected(CommandError::EngineInactive);
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => CommandOutcome::rejected(CommandError::EngineInactive),
        }
    }

    /// Switch operating mode, installing the built-in profile for `mode`.
    /// Only allowed in IDLE or before any mode has been set.
    pub async fn change_mode(&self, mode: ModeType) -> Result<(), CommandError> {
        self.change_mode_with_profile(mode, ModeProfile::for_mode(mode))
            .await
    }

    /// Switch operating mode with an externally supplied profile (e.g. from
    /// the mode-mask configuration). The profile is installed whole.
    pub async fn change_mode_with_profile(
        &self,
        mode: ModeType,
        profile: ModeProfile,
    ) -> Result<(), CommandError> {
        let tx = self.sender().ok_or(CommandError::EngineInactive)?;
        let (reply, rx) = oneshot::channel();
        tx.send(EngineEvent::ChangeMode {
            mode,
            profile,
            reply,
        })
        .map_err(|_| CommandError::EngineInactive)?;
        rx.await.map_err(|_| CommandError::EngineInactive)?
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// State owned exclusively by the processing task.
struct EngineCore {
    current: State,
    mode: Option<ModeType>,
    profile: ModeProfile,
    cycle: CycleMode,
    acting_delay: Duration,
    bindings: HashMap<State, WorkFn>,
    on_state_changed: Option<StateHook>,
    on_mode_changed: Option<ModeHook>,
    shared: Arc<EngineShared>,
    tx: mpsc::UnboundedSender<EngineEvent>,
    generation: u64,
    in_flight: Option<tokio::task::JoinHandle<()>>,
    entered_at: Instant,
}

impl EngineCore {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
        debug!(state = %self.current, "engine context started");
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Command { cmd, reply } => {
                    let outcome = self.handle_command(cmd);
                    let _ = reply.send(outcome);
                }
                EngineEvent::ChangeMode {
                    mode,
                    profile,
                    reply,
                } => {
                    let _ = reply.send(self.handle_change_mode(mode, profile));
                }
                EngineEvent::WorkFinished {
                    state,
                    generation,
                    rtn,
                } => self.handle_work_finished(state, generation, rtn),
                EngineEvent::Shutdown => break,
            }
        }
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
        debug!("engine context stopped");
    }

    fn handle_command(&mut self, cmd: TransitionCmd) -> CommandOutcome {
        debug!(command = %cmd, state = %self.current, "evaluating transition request");
        match eligible_command_target(self.current, cmd, &self.profile) {
            Ok(target) => {
                self.enter_state(target);
                engine_metrics().record_command_accepted();
                CommandOutcome::accepted(target)
            }
            Err(EdgeRejection::NoEdge) => {
                engine_metrics().record_command_rejected();
                CommandOutcome::rejected(CommandError::InvalidTransition {
                    command: cmd,
                    state: self.current,
                })
            }
            Err(EdgeRejection::TargetMasked(target)) => {
                engine_metrics().record_command_rejected();
                CommandOutcome::rejected(CommandError::TargetUnavailable {
                    command: cmd,
                    target,
                    mode: self.mode.unwrap_or(ModeType::UNDEFINED),
                })
            }
        }
    }

    fn handle_change_mode(
        &mut self,
        mode: ModeType,
        profile: ModeProfile,
    ) -> Result<(), CommandError> {
        if self.mode.is_some() && self.current != State::Idle {
            return Err(CommandError::ModeChangeDisallowed {
                state: self.current,
            });
        }
        self.profile = profile;
        self.mode = Some(mode);
        self.shared.mode.store(mode.0, Ordering::SeqCst);
        self.shared.mode_set.store(true, Ordering::SeqCst);
        info!(mode = %mode, "switched mode");
        if let Some(hook) = &self.on_mode_changed {
            hook(mode);
        }
        Ok(())
    }

    fn handle_work_finished(&mut self, state: State, generation: u64, rtn: i32) {
        if generation != self.generation || state != self.current {
            debug!(
                state = %state,
                generation,
                "dropping completion from a preempted state occupancy"
            );
            return;
        }
        self.in_flight = None;
        if rtn != 0 {
            engine_metrics().record_work_failure();
            warn!(state = %state, rtn, "acting-state work failed");
            match error_target(self.current) {
                Some(target) => self.enter_state(target),
                None => warn!(state = %state, "no error edge from current state"),
            }
            return;
        }
        engine_metrics().record_completion();
        let Some(target) = completion_target(self.current, self.cycle) else {
            debug!(state = %state, "completion in a non-acting state ignored");
            return;
        };
        if !self.profile.available(target) {
            warn!(
                from = %self.current,
                to = %target,
                "completion target unavailable in active mode, holding position"
            );
            return;
        }
        self.enter_state(target);
    }

    /// Commit a transition: account dwell time, preempt outstanding work,
    /// publish the new state, notify the observer, then start the new
    /// state's work if it is an acting state.
    fn enter_state(&mut self, target: State) {
        let now = Instant::now();
        {
            let mut dwell = self.shared.dwell.lock().unwrap_or_else(|e| e.into_inner());
            *dwell.entry(self.current).or_default() += now - self.entered_at;
        }
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
        self.generation += 1;
        info!(from = %self.current, to = %target, "state changed");
        self.current = target;
        self.entered_at = now;
        self.shared.state.store(target as i8, Ordering::SeqCst);
        if let Some(hook) = &self.on_state_changed {
            hook(target);
        }
        if target.is_acting() {
            self.spawn_work(target);
        }
    }

    fn spawn_work(&mut self, state: State) {
        let generation = self.generation;
        let tx = self.tx.clone();
        let binding = self.bindings.get(&state).cloned();
        let delay = self.acting_delay;
        let handle = tokio::spawn(async move {
            let rtn = match binding {
                Some(work) => tokio::task::spawn_blocking(move || work())
                    .await
                    .unwrap_or(-1),
                None => {
                    tokio::time::sleep(delay).await;
                    0
                }
            };
            let _ = tx.send(EngineEvent::WorkFinished {
                state,
                generation,
                rtn,
            });
        });
        self.in_flight = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, timeout};

    fn engine() -> Engine {
        EngineBuilder::single_cycle()
            .acting_delay(Duration::from_millis(10))
            .build()
    }

    async fn wait_for_state(engine: &Engine, state: State) {
        timeout(Duration::from_secs(2), async {
            while engine.current_state() != state {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("timed out waiting for state");
    }

    #[tokio::test]
    async fn commands_fail_before_activation() {
        let engine = engine();
        let outcome = engine.send_command(TransitionCmd::Clear).await;
        assert!(!outcome.accepted);
        assert_eq!(outcome.error, Some(CommandError::EngineInactive));
    }

    #[tokio::test]
    async fn double_activation_is_an_error() {
        let engine = engine();
        engine.activate().expect("first activation");
        assert_eq!(engine.activate(), Err(CommandError::EngineAlreadyActive));
    }

    #[tokio::test]
    async fn starts_in_aborted() {
        let engine = engine();
        engine.activate().expect("activate");
        assert_eq!(engine.current_state(), State::Aborted);
    }

    #[tokio::test]
    async fn clear_then_completion_reaches_stopped() {
        let engine = engine();
        engine.activate().expect("activate");
        let outcome = engine.send_command(TransitionCmd::Clear).await;
        assert!(outcome.accepted, "{}", outcome.reason());
        // The outcome names the committed state even if the engine has
        // already moved on by the time the caller looks again.
        assert_eq!(outcome.state, Some(State::Clearing));
        assert_eq!(engine.current_state(), State::Clearing);
        wait_for_state(&engine, State::Stopped).await;
    }

    #[tokio::test]
    async fn reactivation_starts_over_from_aborted() {
        let engine = engine();
        engine.activate().expect("activate");
        engine.change_mode(ModeType::PRODUCTION).await.expect("mode");
        engine.send_command(TransitionCmd::Clear).await;
        wait_for_state(&engine, State::Stopped).await;
        engine.deactivate();
        engine.activate().expect("reactivate");
        assert_eq!(engine.current_state(), State::Aborted);
        assert_eq!(engine.current_mode(), ModeType::UNDEFINED);
        assert!(engine.dwell_times().is_empty());
    }

    #[tokio::test]
    async fn rejected_command_is_idempotent() {
        let engine = engine();
        engine.activate().expect("activate");
        let first = engine.send_command(TransitionCmd::Start).await;
        let second = engine.send_command(TransitionCmd::Start).await;
        assert_eq!(first, second);
        assert!(matches!(
            first.error,
            Some(CommandError::InvalidTransition { .. })
        ));
        assert_eq!(engine.current_state(), State::Aborted);
    }

    #[tokio::test]
    async fn state_hook_fires_before_command_returns() {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let hook_log = Arc::clone(&observed);
        let engine = EngineBuilder::single_cycle()
            .acting_delay(Duration::from_millis(10))
            .on_state_changed(Arc::new(move |state| {
                hook_log.lock().unwrap().push(state);
            }))
            .build();
        engine.activate().expect("activate");
        let outcome = engine.send_command(TransitionCmd::Clear).await;
        assert!(outcome.accepted);
        // The hook ran before the outcome was delivered.
        assert_eq!(observed.lock().unwrap().first(), Some(&State::Clearing));
    }

    #[tokio::test]
    async fn mode_change_rejected_outside_idle() {
        let engine = engine();
        engine.activate().expect("activate");
        // First mode change is allowed anywhere (no mode set yet).
        engine
            .change_mode(ModeType::PRODUCTION)
            .await
            .expect("initial mode");
        // Second change from ABORTED must name the offending state.
        let err = engine.change_mode(ModeType::MANUAL).await.unwrap_err();
        assert_eq!(
            err,
            CommandError::ModeChangeDisallowed {
                state: State::Aborted
            }
        );
    }

    #[tokio::test]
    async fn maintenance_holds_execute_when_work_completes() {
        let engine = EngineBuilder::single_cycle()
            .acting_delay(Duration::from_millis(5))
            .build();
        engine.activate().expect("activate");
        engine
            .change_mode(ModeType::MAINTENANCE)
            .await
            .expect("maintenance mode");
        engine.send_command(TransitionCmd::Clear).await;
        wait_for_state(&engine, State::Stopped).await;
        engine.send_command(TransitionCmd::Reset).await;
        wait_for_state(&engine, State::Idle).await;
        engine.send_command(TransitionCmd::Start).await;
        wait_for_state(&engine, State::Execute).await;
        // Work completes but COMPLETING is masked; EXECUTE holds position.
        sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.current_state(), State::Execute);
    }

    #[tokio::test]
    async fn failing_work_takes_the_error_edge() {
        let engine = EngineBuilder::single_cycle()
            .acting_delay(Duration::from_millis(5))
            .bind_execute(Arc::new(|| 1))
            .build();
        engine.activate().expect("activate");
        engine.change_mode(ModeType::PRODUCTION).await.expect("mode");
        engine.send_command(TransitionCmd::Clear).await;
        wait_for_state(&engine, State::Stopped).await;
        engine.send_command(TransitionCmd::Reset).await;
        wait_for_state(&engine, State::Idle).await;
        engine.send_command(TransitionCmd::Start).await;
        // EXECUTE work returns non-zero, driving the error edge to ABORTING
        // and on through completion to ABORTED.
        wait_for_state(&engine, State::Aborted).await;
    }

    #[tokio::test]
    async fn abort_preempts_in_flight_work() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let engine = EngineBuilder::single_cycle()
            .acting_delay(Duration::from_millis(5))
            .bind_execute(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(200));
                0
            }))
            .build();
        engine.activate().expect("activate");
        engine.send_command(TransitionCmd::Clear).await;
        wait_for_state(&engine, State::Stopped).await;
        engine.send_command(TransitionCmd::Reset).await;
        wait_for_state(&engine, State::Idle).await;
        engine.send_command(TransitionCmd::Start).await;
        wait_for_state(&engine, State::Execute).await;
        let outcome = engine.send_command(TransitionCmd::Abort).await;
        assert!(outcome.accepted);
        wait_for_state(&engine, State::Aborted).await;
        // The execute work's late completion must not drag the machine out
        // of the abort path.
        sleep(Duration::from_millis(250)).await;
        assert_eq!(engine.current_state(), State::Aborted);
    }

    #[tokio::test]
    async fn dwell_times_accumulate() {
        let engine = engine();
        engine.activate().expect("activate");
        engine.send_command(TransitionCmd::Clear).await;
        wait_for_state(&engine, State::Stopped).await;
        let dwell = engine.dwell_times();
        assert!(dwell.contains_key(&State::Aborted));
        assert!(dwell[&State::Clearing] >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn continuous_cycle_loops_on_execute() {
        let engine = EngineBuilder::continuous_cycle()
            .acting_delay(Duration::from_millis(5))
            .build();
        engine.activate().expect("activate");
        engine.send_command(TransitionCmd::Clear).await;
        wait_for_state(&engine, State::Stopped).await;
        engine.send_command(TransitionCmd::Reset).await;
        wait_for_state(&engine, State::Idle).await;
        engine.send_command(TransitionCmd::Start).await;
        wait_for_state(&engine, State::Execute).await;
        sleep(Duration::from_millis(50)).await;
        // Still executing: the completion edge loops back on itself.
        assert_eq!(engine.current_state(), State::Execute);
        let outcome = engine.send_command(TransitionCmd::Stop).await;
        assert!(outcome.accepted);
        wait_for_state(&engine, State::Stopped).await;
    }
}

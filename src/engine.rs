//! The scheduler engine.
//!
//! One cooperative task owns the timeline, the task registry and the session
//! link. Each tick runs a synchronization exchange, advances the virtual
//! clock, paces per-task updates and dispatches any instant the clock rolled
//! into. The only suspension points are the RPC boundary and the pause
//! barrier between dispatched lifecycle commands.

use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatch::{self, Applied};
use crate::journal::Journal;
use crate::params::{ParamTree, ParamValue};
use crate::plugin::{
    Authority, EngineRequest, PluginRegistry, RegistryError, TaskContext, TaskPlugin, TaskState,
    MAIN_TASK,
};
use crate::protocol::SyncFrame;
use crate::scenario::{
    self, ClockOverflow, CommandBody, ScenarioError, ScheduledCommand, TimeKey, Timeline, Verb,
};
use crate::session::{HostLink, ParticipantLink, SessionError, SessionRole};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Clock(#[from] ClockOverflow),
}

/// External happenings injected into the engine between suspension points:
/// routed key events and operator-level session controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    Key(u32),
    Pause,
    Resume,
    End,
}

#[derive(Clone)]
pub struct EngineEvents {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineEvents {
    pub fn send(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

pub enum SessionLink {
    Local,
    Host(HostLink),
    Participant(ParticipantLink),
}

impl SessionLink {
    pub fn role(&self) -> SessionRole {
        match self {
            SessionLink::Local => SessionRole::Local,
            SessionLink::Host(_) => SessionRole::Host,
            SessionLink::Participant(_) => SessionRole::Participant,
        }
    }
}

struct HostStatus {
    connected: bool,
    heartbeat_expired: bool,
    termination_sent: bool,
    timeout: Duration,
}

pub struct Engine {
    config: Config,
    registry: PluginRegistry,
    timeline: Timeline,
    active_tasks: BTreeSet<String>,
    main_params: ParamTree,
    scenario_path: String,
    journal: Journal,
    link: SessionLink,
    role: SessionRole,
    clock_ms: f64,
    last_tick: Instant,
    current_key: Option<TimeKey>,
    experiment_running: bool,
    experiment_paused: bool,
    ended_at: Option<Instant>,
    finished: bool,
    tick_in_flight: bool,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Engine {
    pub fn new(config: Config, journal: Journal, link: SessionLink) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let role = link.role();
        Self {
            config,
            registry: PluginRegistry::new(),
            timeline: Timeline::default(),
            active_tasks: BTreeSet::new(),
            main_params: ParamTree::new().with("messagetolog", ""),
            scenario_path: String::new(),
            journal,
            link,
            role,
            clock_ms: 0.0,
            last_tick: Instant::now(),
            current_key: None,
            experiment_running: true,
            experiment_paused: false,
            ended_at: None,
            finished: false,
            tick_in_flight: false,
            events_tx,
            events_rx,
        }
    }

    pub fn register(&mut self, plugin: Box<dyn TaskPlugin>) -> Result<(), RegistryError> {
        self.registry.register(plugin)
    }

    pub fn load_scenario(&mut self, source: &str, path: &str) -> Result<(), ScenarioError> {
        let timeline = scenario::compile(
            source,
            &self.registry,
            &self.main_params,
            self.config.max_priority,
        )?;
        self.active_tasks = timeline.tasks().iter().cloned().collect();
        self.scenario_path = path.to_string();
        self.timeline = timeline;
        self.journal_event(&["MAIN", "INFO", "SCENARIO", "FILENAME", path]);
        Ok(())
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn clock_ms(&self) -> f64 {
        self.clock_ms
    }

    pub fn current_key(&self) -> Option<TimeKey> {
        self.current_key
    }

    pub fn is_running(&self) -> bool {
        self.experiment_running
    }

    pub fn is_paused(&self) -> bool {
        self.experiment_paused
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn task_state(&self, name: &str) -> Option<&TaskState> {
        self.registry.get(name).map(|entry| &entry.state)
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Handle for feeding [`EngineEvent`]s from outside the engine task.
    pub fn events(&self) -> EngineEvents {
        EngineEvents {
            tx: self.events_tx.clone(),
        }
    }

    /// Establish the session before the clock starts. The host waits for
    /// `confirm_connected` up to its timeout; the participant announces
    /// itself; local sessions have nothing to do.
    pub async fn connect(&mut self) -> Result<(), EngineError> {
        match &self.link {
            SessionLink::Local => Ok(()),
            SessionLink::Host(_) => {
                info!("waiting for participant");
                loop {
                    if let Some(status) = self.pump_host(true) {
                        if status.connected {
                            return Ok(());
                        }
                        if status.heartbeat_expired {
                            self.journal_event(&["SESSION", "ERROR", "CONNECT", "TIMEOUT"]);
                            return Err(EngineError::Session(SessionError::ConnectionTimeout(
                                status.timeout,
                            )));
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
            SessionLink::Participant(_) => {
                let SessionLink::Participant(link) = &self.link else {
                    unreachable!();
                };
                link.confirm_connected().await.map_err(EngineError::from)?;
                info!(session_id = %link.session_id, "connected to host");
                Ok(())
            }
        }
    }

    /// Fire the opening instant and arm the tick timer.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        self.update_scenario_time().await?;
        self.last_tick = Instant::now();
        Ok(())
    }

    /// Drive the engine until the session finishes.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        self.start().await?;
        let mut ticker = tokio::time::interval(self.config.tick_floor);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !self.finished {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                self.end_session();
                self.finish();
                return Err(err);
            }
        }
        self.finish();
        Ok(())
    }

    /// One scheduler pass. Re-entrant calls are skipped outright, never
    /// queued.
    pub async fn tick(&mut self) -> Result<(), EngineError> {
        if self.tick_in_flight {
            return Ok(());
        }
        self.tick_in_flight = true;
        let result = self.tick_inner().await;
        self.tick_in_flight = false;
        result
    }

    async fn tick_inner(&mut self) -> Result<(), EngineError> {
        self.drain_events();

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick);
        if elapsed < self.config.tick_floor {
            return Ok(());
        }
        self.last_tick = now;

        let sync = self.session_exchange().await?;

        if self.role == SessionRole::Host {
            let status = match &self.link {
                SessionLink::Host(link) => HostStatus {
                    connected: link.connected,
                    heartbeat_expired: link.heartbeat_expired(),
                    termination_sent: link.termination_sent,
                    timeout: link.timeout(),
                },
                _ => unreachable!(),
            };
            if status.heartbeat_expired {
                if self.experiment_running {
                    self.journal_event(&["SESSION", "ERROR", "HEARTBEAT", "TIMEOUT"]);
                    warn!("connection to participant lost");
                    self.end_session();
                    self.finished = true;
                    return Err(EngineError::Session(SessionError::ConnectionTimeout(
                        status.timeout,
                    )));
                }
                self.finished = true;
                return Ok(());
            }
            if !self.experiment_running {
                let grace_elapsed = self
                    .ended_at
                    .map(|at| at.elapsed() > self.config.termination_grace)
                    .unwrap_or(false);
                if status.termination_sent || grace_elapsed {
                    self.finished = true;
                    return Ok(());
                }
            }
        } else if !self.experiment_running {
            self.finished = true;
            return Ok(());
        }

        if self.experiment_paused || !self.experiment_running {
            return Ok(());
        }

        let advance = match &self.link {
            SessionLink::Local | SessionLink::Host(_) => {
                self.clock_ms += elapsed.as_secs_f64() * 1000.0;
                elapsed
            }
            SessionLink::Participant(link) => {
                let before = self.clock_ms.round() as i64;
                let host_ms = link.fetch_time().await?;
                self.clock_ms = host_ms as f64;
                Duration::from_millis(host_ms.saturating_sub(before).max(0) as u64)
            }
        };

        self.update_tasks(advance, sync.as_ref());
        self.flush_message_to_log();
        self.update_scenario_time().await
    }

    /// Step 2 of the tick: one synchronization exchange. The host answers
    /// pending calls; the participant forwards inputs and fetches the sync
    /// frame. Local sessions skip the session entirely.
    async fn session_exchange(&mut self) -> Result<Option<SyncFrame>, EngineError> {
        match &mut self.link {
            SessionLink::Local => Ok(None),
            SessionLink::Host(_) => {
                let running = self.experiment_running;
                self.pump_host(running);
                Ok(None)
            }
            SessionLink::Participant(link) => {
                let mut ctx = TaskContext::new();
                let frame = link.exchange(&mut self.registry, &mut ctx).await?;
                let requests = ctx.drain();
                self.apply_requests(requests);
                if frame.terminate {
                    debug!("host signalled termination");
                    self.end_session();
                }
                Ok(Some(frame))
            }
        }
    }

    fn pump_host(&mut self, running: bool) -> Option<HostStatus> {
        let clock_ms = self.clock_ms.round() as i64;
        let SessionLink::Host(link) = &mut self.link else {
            return None;
        };
        let mut ctx = TaskContext::new();
        link.pump(
            &mut self.registry,
            running,
            clock_ms,
            &self.scenario_path,
            &mut ctx,
        );
        let status = HostStatus {
            connected: link.connected,
            heartbeat_expired: link.heartbeat_expired(),
            termination_sent: link.termination_sent,
            timeout: link.timeout(),
        };
        let requests = ctx.drain();
        self.apply_requests(requests);
        Some(status)
    }

    /// Step 6: pace per-task updates. Reaching the interval fires the update
    /// hook and applies any pending payload as a full update; otherwise a
    /// pending payload is delivered as a partial update without the hook.
    fn update_tasks(&mut self, elapsed: Duration, sync: Option<&SyncFrame>) {
        let is_participant = self.role == SessionRole::Participant;
        let mut ctx = TaskContext::new();

        for (name, entry) in self.registry.iter_mut() {
            if !self.active_tasks.contains(name) {
                continue;
            }
            let Some(interval) = entry.state.update_interval else {
                continue;
            };
            if entry.state.paused {
                continue;
            }

            entry.state.time_since_update += elapsed;
            let consumer = is_participant
                && entry.capabilities.consumes_sync
                && entry.plugin.network_mode().resolve(SessionRole::Participant)
                    == Authority::Host;
            let payload = sync.and_then(|frame| frame.payloads.get(name.as_str()));

            if entry.state.time_since_update >= interval {
                entry.plugin.on_update(&mut ctx);
                if consumer {
                    if let Some(payload) = payload {
                        entry.plugin.apply_sync_data(payload, true, &mut ctx);
                    }
                }
                entry.state.time_since_update = Duration::ZERO;
            } else if consumer {
                if let Some(payload) = payload {
                    entry.plugin.apply_sync_data(payload, false, &mut ctx);
                }
            }
        }

        self.apply_requests(ctx.drain());
    }

    fn flush_message_to_log(&mut self) {
        let message = match self.main_params.get("messagetolog") {
            Some(ParamValue::Text(text)) if !text.is_empty() => text.clone(),
            _ => return,
        };
        self.main_params.insert("messagetolog", "");
        self.journal_event(&["MAIN", "LOG", &message]);
    }

    /// Step 7: reformat the clock and dispatch when the instant changed.
    async fn update_scenario_time(&mut self) -> Result<(), EngineError> {
        let key = TimeKey::from_millis(self.clock_ms.max(0.0) as u64)?;
        if self.current_key != Some(key) {
            self.current_key = Some(key);
            self.execute_at(key).await?;
        }
        Ok(())
    }

    async fn execute_at(&mut self, key: TimeKey) -> Result<(), EngineError> {
        for command in dispatch::plan(&self.timeline, &key) {
            let applied = if command.task == MAIN_TASK {
                self.apply_main_command(&command)
            } else {
                let mut ctx = TaskContext::new();
                let applied = dispatch::apply(&mut self.registry, &command, &mut ctx);
                self.apply_requests(ctx.drain());
                applied
            };
            if applied == Applied::Lifecycle {
                self.pause_barrier().await?;
            }
            if !self.experiment_running {
                break;
            }
        }
        Ok(())
    }

    fn apply_main_command(&mut self, command: &ScheduledCommand) -> Applied {
        match &command.body {
            CommandBody::Lifecycle(verb) => {
                match verb {
                    Verb::Pause => self.pause_session(),
                    Verb::Resume => self.resume_session(),
                    Verb::Declared(word) if word == "end" => self.end_session(),
                    _ => {}
                }
                Applied::Lifecycle
            }
            CommandBody::SetParam { path, value } => {
                let rendered = value.to_string();
                if let Err(err) = self.main_params.set_path(path, value.clone()) {
                    error!(line = command.line, error = %err, "main parameter write failed");
                } else {
                    self.journal_event(&[
                        "MAIN",
                        "SCENARIO",
                        "MAIN",
                        &path.join("-").to_ascii_uppercase(),
                        &rendered,
                    ]);
                }
                Applied::Param
            }
        }
    }

    /// Wait out a session pause between dispatched commands. Exchanges keep
    /// running on a fast fixed interval so tasks flagged network-while-paused
    /// stay current and both processes can resume in agreement.
    async fn pause_barrier(&mut self) -> Result<(), EngineError> {
        while self.experiment_paused && self.experiment_running {
            self.drain_events();
            if !self.experiment_paused {
                break;
            }
            let sync = self.session_exchange().await?;
            if let Some(frame) = sync {
                self.deliver_paused_sync(&frame);
            }
            tokio::time::sleep(self.config.pause_exchange_interval).await;
        }
        self.last_tick = Instant::now();
        Ok(())
    }

    fn deliver_paused_sync(&mut self, frame: &SyncFrame) {
        let mut ctx = TaskContext::new();
        for (name, entry) in self.registry.iter_mut() {
            if !entry.capabilities.network_while_paused || !entry.capabilities.consumes_sync {
                continue;
            }
            if entry.plugin.network_mode().resolve(SessionRole::Participant) != Authority::Host {
                continue;
            }
            if let Some(payload) = frame.payloads.get(name.as_str()) {
                entry.plugin.apply_sync_data(payload, true, &mut ctx);
            }
        }
        self.apply_requests(ctx.drain());
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                EngineEvent::Key(key) => self.key_event(key),
                EngineEvent::Pause => self.pause_session(),
                EngineEvent::Resume => self.resume_session(),
                EngineEvent::End => self.end_session(),
            }
        }
    }

    /// Route a key event to running, unpaused tasks that registered for
    /// key events. Device polling lives outside the engine.
    pub fn key_event(&mut self, key: u32) {
        self.journal_event(&["MAIN", "INPUT", "KEY_PRESS", &key.to_string()]);
        let mut ctx = TaskContext::new();
        for (_, entry) in self.registry.iter_mut() {
            if entry.state.receives_key_events && entry.state.running && !entry.state.paused {
                entry.plugin.key_event(key, &mut ctx);
            }
        }
        self.apply_requests(ctx.drain());
    }

    fn apply_requests(&mut self, requests: Vec<EngineRequest>) {
        for request in requests {
            match request {
                EngineRequest::PauseSession => self.pause_session(),
                EngineRequest::ResumeSession => self.resume_session(),
                EngineRequest::EndSession => self.end_session(),
                EngineRequest::Journal(fields) => {
                    let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
                    self.journal_event(&refs);
                }
            }
        }
    }

    fn journal_event(&mut self, fields: &[&str]) {
        self.journal.record(fields);
        let owned: Vec<String> = fields.iter().map(|field| field.to_string()).collect();
        for (name, entry) in self.registry.iter_mut() {
            if entry.capabilities.journal_events && self.active_tasks.contains(name) {
                entry.plugin.on_journal(&owned);
            }
        }
    }

    /// Session-wide pause. Records each task's own paused flag so resume
    /// only touches tasks this pause actually paused.
    pub fn pause_session(&mut self) {
        if self.experiment_paused {
            return;
        }
        self.journal_event(&["MAIN", "STATE", "", "PAUSE"]);
        self.experiment_paused = true;

        let mut ctx = TaskContext::new();
        for (_, entry) in self.registry.iter_mut() {
            entry.state.previously_paused = entry.state.paused;
            if !entry.state.paused {
                entry.state.paused = true;
                entry.plugin.on_pause(&mut ctx);
            }
            if entry.state.visible && !entry.capabilities.visible_while_paused {
                entry.state.visible = false;
            }
        }
        self.apply_requests(ctx.drain());
    }

    pub fn resume_session(&mut self) {
        if !self.experiment_paused {
            return;
        }
        self.journal_event(&["MAIN", "STATE", "", "RESUME"]);
        self.experiment_paused = false;

        let mut ctx = TaskContext::new();
        for (_, entry) in self.registry.iter_mut() {
            if entry.state.running && !entry.state.previously_paused {
                entry.state.paused = false;
                entry.plugin.on_resume(&mut ctx);
                entry.state.visible = true;
            }
        }
        self.apply_requests(ctx.drain());
    }

    /// Flag the session over. The host keeps answering `get_sync_data` with
    /// the terminate flag until delivery is confirmed or the grace period
    /// runs out; everyone else stops on the next tick.
    pub fn end_session(&mut self) {
        if !self.experiment_running {
            return;
        }
        self.experiment_running = false;
        self.ended_at = Some(Instant::now());
    }

    /// Final teardown: task end hooks, the closing journal record, flush.
    fn finish(&mut self) {
        let mut ctx = TaskContext::new();
        for (_, entry) in self.registry.iter_mut() {
            entry.plugin.on_end(&mut ctx);
        }
        for request in ctx.drain() {
            if let EngineRequest::Journal(fields) = request {
                let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
                self.journal_event(&refs);
            }
        }
        self.journal_event(&["MAIN", "STATE", "", "END"]);
        self.journal.flush();
    }
}

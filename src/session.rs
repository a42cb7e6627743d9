//! Host/participant synchronization session.
//!
//! The host answers the five protocol calls from inside its scheduler tick;
//! the participant drives one exchange per tick. Both sides tolerate a small
//! budget of protocol violations before escalating to a user-visible
//! warning, and liveness is judged purely on sustained silence, never on a
//! single unanswered call.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::plugin::{Authority, PluginRegistry, TaskContext, TaskPlugin};
use crate::protocol::{InputMap, Request, Response, SyncFrame};
use crate::transport::{RpcClient, RpcServer, TransportError};

/// Fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Local,
    Host,
    Participant,
}

/// Violations tolerated silently before escalating.
pub const PROTOCOL_ERROR_BUDGET: u32 = 10;

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no participant contact within {0:?}")]
    ConnectionTimeout(Duration),
    #[error("unexpected response to {call}")]
    UnexpectedResponse { call: &'static str },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Tolerated-error counter: silent up to the budget, escalated past it,
/// reset by any clean cycle.
#[derive(Debug)]
struct ErrorBudget {
    counter: u32,
    budget: u32,
}

impl ErrorBudget {
    fn new(budget: u32) -> Self {
        Self { counter: 0, budget }
    }

    fn record(&mut self) -> bool {
        self.counter += 1;
        self.counter > self.budget
    }

    fn clean_cycle(&mut self) {
        self.counter = 0;
    }
}

/// Host-side session state: the answering end of the protocol.
pub struct HostLink {
    server: Box<dyn RpcServer>,
    timeout: Duration,
    started_at: Instant,
    last_peer_contact: Option<Instant>,
    pub connected: bool,
    pub peer_session: Option<Uuid>,
    /// Set once a `terminate=true` sync frame has been answered.
    pub termination_sent: bool,
    input_errors: ErrorBudget,
}

impl HostLink {
    pub fn new(server: Box<dyn RpcServer>, timeout: Duration) -> Self {
        Self {
            server,
            timeout,
            started_at: Instant::now(),
            last_peer_contact: None,
            connected: false,
            peer_session: None,
            termination_sent: false,
            input_errors: ErrorBudget::new(PROTOCOL_ERROR_BUDGET),
        }
    }

    /// Answer every pending participant call. Returns the number handled.
    pub fn pump(
        &mut self,
        registry: &mut PluginRegistry,
        experiment_running: bool,
        clock_ms: i64,
        scenario_path: &str,
        ctx: &mut TaskContext,
    ) -> usize {
        let mut handled = 0;
        while let Some(call) = self.server.poll() {
            handled += 1;
            let response = match call.request {
                Request::ConfirmConnected { session_id } => {
                    self.touch();
                    if !self.connected {
                        self.connected = true;
                        self.peer_session = Some(session_id);
                        info!(%session_id, "participant connected");
                        ctx.journal([
                            "SESSION".to_string(),
                            "INFO".to_string(),
                            "CONNECTED".to_string(),
                            session_id.to_string(),
                        ]);
                    }
                    Response::Ack { ok: true }
                }
                Request::GetScenarioPath => Response::ScenarioPath {
                    path: scenario_path.to_string(),
                },
                Request::GetTime => Response::Time {
                    elapsed_ms: clock_ms,
                },
                Request::GetSyncData => {
                    self.touch();
                    let frame = collect_sync_frame(registry, !experiment_running);
                    if frame.terminate {
                        self.termination_sent = true;
                    }
                    Response::SyncData(frame)
                }
                Request::PassNewInput { ref inputs } => {
                    self.apply_inputs(registry, inputs, ctx);
                    Response::Ack { ok: true }
                }
            };
            call.respond(response);
        }
        handled
    }

    fn touch(&mut self) {
        self.last_peer_contact = Some(Instant::now());
    }

    /// Time since the last participant contact, measured from session start
    /// when none has happened yet.
    pub fn peer_silence(&self) -> Duration {
        self.last_peer_contact
            .unwrap_or(self.started_at)
            .elapsed()
    }

    pub fn heartbeat_expired(&self) -> bool {
        self.peer_silence() > self.timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn apply_inputs(
        &mut self,
        registry: &mut PluginRegistry,
        inputs: &InputMap,
        ctx: &mut TaskContext,
    ) {
        let mut had_errors = false;
        for (name, payload) in inputs {
            let violation = match registry.get_mut(name) {
                None => Some("unknown task"),
                Some(entry) => {
                    if entry.plugin.network_mode().resolve(SessionRole::Host) != Authority::Host {
                        Some("task is not host-authoritative")
                    } else if !entry.capabilities.consumes_input {
                        Some("task has no input capability")
                    } else {
                        entry.plugin.apply_new_inputs(payload, ctx);
                        None
                    }
                }
            };
            if let Some(reason) = violation {
                had_errors = true;
                self.record_violation(name, reason, ctx);
            }
        }
        if !had_errors {
            self.input_errors.clean_cycle();
        }
    }

    fn record_violation(&mut self, task: &str, reason: &str, ctx: &mut TaskContext) {
        let escalated = self.input_errors.record();
        ctx.journal([
            "SESSION".to_string(),
            "PROTOCOL".to_string(),
            task.to_ascii_uppercase(),
            reason.to_string(),
        ]);
        if escalated {
            warn!(task, reason, "repeated protocol violations from participant input");
        } else {
            debug!(task, reason, "tolerated protocol violation");
        }
    }
}

/// Sync payloads from every task the host side is authoritative for.
pub fn collect_sync_frame(registry: &mut PluginRegistry, terminate: bool) -> SyncFrame {
    let mut frame = SyncFrame {
        terminate,
        ..SyncFrame::default()
    };
    for (name, entry) in registry.iter_mut() {
        if entry.capabilities.produces_sync
            && entry.plugin.network_mode().resolve(SessionRole::Host) == Authority::Host
        {
            if let Some(payload) = entry.plugin.get_sync_data() {
                frame.payloads.insert(name.clone(), payload);
            }
        }
    }
    frame
}

/// Participant-side session state: the calling end of the protocol.
pub struct ParticipantLink {
    client: Box<dyn RpcClient>,
    pub session_id: Uuid,
    sync_errors: ErrorBudget,
}

impl ParticipantLink {
    pub fn new(client: Box<dyn RpcClient>) -> Self {
        Self {
            client,
            session_id: Uuid::new_v4(),
            sync_errors: ErrorBudget::new(PROTOCOL_ERROR_BUDGET),
        }
    }

    pub async fn confirm_connected(&self) -> Result<(), SessionError> {
        match self
            .client
            .call(Request::ConfirmConnected {
                session_id: self.session_id,
            })
            .await?
        {
            Response::Ack { .. } => Ok(()),
            _ => Err(SessionError::UnexpectedResponse {
                call: "confirm_connected",
            }),
        }
    }

    pub async fn fetch_scenario_path(&self) -> Result<String, SessionError> {
        match self.client.call(Request::GetScenarioPath).await? {
            Response::ScenarioPath { path } => Ok(path),
            _ => Err(SessionError::UnexpectedResponse {
                call: "get_scenario_path",
            }),
        }
    }

    pub async fn fetch_time(&self) -> Result<i64, SessionError> {
        match self.client.call(Request::GetTime).await? {
            Response::Time { elapsed_ms } => Ok(elapsed_ms),
            _ => Err(SessionError::UnexpectedResponse { call: "get_time" }),
        }
    }

    /// One full exchange: forward queued inputs, then fetch the sync frame.
    pub async fn exchange(
        &mut self,
        registry: &mut PluginRegistry,
        ctx: &mut TaskContext,
    ) -> Result<SyncFrame, SessionError> {
        let inputs = drain_inputs(registry);
        match self.client.call(Request::PassNewInput { inputs }).await? {
            Response::Ack { .. } => {}
            _ => {
                return Err(SessionError::UnexpectedResponse {
                    call: "pass_new_input",
                });
            }
        }

        match self.client.call(Request::GetSyncData).await? {
            Response::SyncData(frame) => {
                self.scan_sync_frame(&frame, registry, ctx);
                Ok(frame)
            }
            _ => Err(SessionError::UnexpectedResponse {
                call: "get_sync_data",
            }),
        }
    }

    /// Flag payloads routed at tasks that cannot take them. Application of
    /// valid payloads happens on the engine's update pass.
    fn scan_sync_frame(
        &mut self,
        frame: &SyncFrame,
        registry: &PluginRegistry,
        ctx: &mut TaskContext,
    ) {
        let mut had_errors = false;
        for name in frame.payloads.keys() {
            let violation = match registry.get(name) {
                None => Some("unknown task"),
                Some(entry) => {
                    if !entry.capabilities.consumes_sync {
                        Some("task has no sync capability")
                    } else if entry.plugin.network_mode().resolve(SessionRole::Participant)
                        != Authority::Host
                    {
                        Some("task is not a sync consumer here")
                    } else {
                        None
                    }
                }
            };
            if let Some(reason) = violation {
                had_errors = true;
                let escalated = self.sync_errors.record();
                ctx.journal([
                    "SESSION".to_string(),
                    "PROTOCOL".to_string(),
                    name.to_ascii_uppercase(),
                    reason.to_string(),
                ]);
                if escalated {
                    warn!(task = %name, reason, "repeated misrouted sync payloads from host");
                } else {
                    debug!(task = %name, reason, "tolerated misrouted sync payload");
                }
            }
        }
        if !had_errors {
            self.sync_errors.clean_cycle();
        }
    }
}

/// Queued input events from every task that forwards to the host.
fn drain_inputs(registry: &mut PluginRegistry) -> InputMap {
    let mut inputs = InputMap::new();
    for (name, entry) in registry.iter_mut() {
        if entry.capabilities.produces_input
            && entry.plugin.network_mode().resolve(SessionRole::Participant) == Authority::Host
        {
            if let Some(payload) = entry.plugin.pop_new_inputs() {
                inputs.insert(name.clone(), payload);
            }
        }
    }
    inputs
}

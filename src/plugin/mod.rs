//! The task plugin contract.
//!
//! Task modules plug into the engine through [`TaskPlugin`]. Optional
//! behaviour is declared up front in [`Capabilities`] at registration time;
//! the engine queries the declaration, never the trait object, to decide
//! which hooks a task takes part in.

use serde_json::Value;

use crate::params::ParamTree;
use crate::session::SessionRole;

pub mod builtin;
pub mod registry;

pub use registry::{PluginEntry, PluginRegistry, RegistryError, TaskState};

/// Reserved name the scenario grammar uses for main-script commands.
pub const MAIN_TASK: &str = "__main__";

/// Declared network behaviour of a task, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// The host side owns this task's state wherever the process runs.
    Host,
    /// The participant side owns this task's state.
    Participant,
    /// Host-authoritative in a networked session, local-only otherwise.
    FollowSession,
    /// Never exchanged over the session link.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Host,
    Participant,
    Local,
}

impl NetworkMode {
    pub fn resolve(self, role: SessionRole) -> Authority {
        match self {
            NetworkMode::Host => Authority::Host,
            NetworkMode::Participant => Authority::Participant,
            NetworkMode::Local => Authority::Local,
            NetworkMode::FollowSession => match role {
                SessionRole::Local => Authority::Local,
                SessionRole::Host | SessionRole::Participant => Authority::Host,
            },
        }
    }
}

/// Optional interfaces a task implements, declared once at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Wants periodic `on_update` calls, paced by the `taskupdatetime` parameter.
    pub update: bool,
    /// Supplies sync payloads when this side is authoritative.
    pub produces_sync: bool,
    /// Accepts sync payloads when the remote side is authoritative.
    pub consumes_sync: bool,
    /// Queues local input events for forwarding to the authoritative side.
    pub produces_input: bool,
    /// Applies forwarded input events on the authoritative side.
    pub consumes_input: bool,
    /// Receives routed key events while running and unpaused.
    pub key_events: bool,
    /// Receives a copy of every journal record.
    pub journal_events: bool,
    /// Keeps exchanging sync/input data while the session is paused.
    pub network_while_paused: bool,
    /// Stays visible through a session pause.
    pub visible_while_paused: bool,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities {
        update: false,
        produces_sync: false,
        consumes_sync: false,
        produces_input: false,
        consumes_input: false,
        key_events: false,
        journal_events: false,
        network_while_paused: false,
        visible_while_paused: false,
    };
}

/// Requests a hook may raise against the engine.
///
/// Hooks never call back into the engine directly; they queue requests on the
/// [`TaskContext`] and the engine applies them once the hook returns.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineRequest {
    PauseSession,
    ResumeSession,
    EndSession,
    Journal(Vec<String>),
}

#[derive(Debug, Default)]
pub struct TaskContext {
    requests: Vec<EngineRequest>,
}

impl TaskContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&mut self) {
        self.requests.push(EngineRequest::PauseSession);
    }

    pub fn request_resume(&mut self) {
        self.requests.push(EngineRequest::ResumeSession);
    }

    pub fn request_end(&mut self) {
        self.requests.push(EngineRequest::EndSession);
    }

    pub fn journal<I, S>(&mut self, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requests.push(EngineRequest::Journal(
            fields.into_iter().map(Into::into).collect(),
        ));
    }

    pub fn drain(&mut self) -> Vec<EngineRequest> {
        std::mem::take(&mut self.requests)
    }
}

pub trait TaskPlugin: Send {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn network_mode(&self) -> NetworkMode {
        NetworkMode::Local
    }

    fn params(&self) -> &ParamTree;

    fn params_mut(&mut self) -> &mut ParamTree;

    fn on_start(&mut self, _ctx: &mut TaskContext) {}
    fn on_stop(&mut self, _ctx: &mut TaskContext) {}
    fn on_show(&mut self, _ctx: &mut TaskContext) {}
    fn on_hide(&mut self, _ctx: &mut TaskContext) {}
    fn on_pause(&mut self, _ctx: &mut TaskContext) {}
    fn on_resume(&mut self, _ctx: &mut TaskContext) {}
    fn on_update(&mut self, _ctx: &mut TaskContext) {}
    fn on_end(&mut self, _ctx: &mut TaskContext) {}

    /// Whether the task accepts `verb` beyond the fixed lifecycle set.
    /// Checked by the scenario compiler.
    fn declares_verb(&self, _verb: &str) -> bool {
        false
    }

    fn on_verb(&mut self, _verb: &str, _ctx: &mut TaskContext) {}

    fn key_event(&mut self, _key: u32, _ctx: &mut TaskContext) {}

    fn get_sync_data(&mut self) -> Option<Value> {
        None
    }

    fn apply_sync_data(&mut self, _payload: &Value, _full_update: bool, _ctx: &mut TaskContext) {}

    fn pop_new_inputs(&mut self) -> Option<Value> {
        None
    }

    fn apply_new_inputs(&mut self, _inputs: &Value, _ctx: &mut TaskContext) {}

    fn on_journal(&mut self, _fields: &[String]) {}
}

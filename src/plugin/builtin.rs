//! Built-in demo tasks.
//!
//! Small stand-ins for the real cognitive task modules, enough to run the
//! shipped demo scenarios end to end and to exercise every capability the
//! engine routes. Task visuals and input devices stay out of scope.

use serde_json::{json, Value};

use crate::params::ParamTree;
use crate::plugin::registry::UPDATE_INTERVAL_PARAM;
use crate::plugin::{Capabilities, NetworkMode, TaskContext, TaskPlugin};

/// Periodic counter with sync and input capabilities. Host-authoritative in
/// a networked session; the participant mirrors its tick count and forwards
/// key presses.
pub struct PulseTask {
    params: ParamTree,
    ticks: i64,
    remote_inputs: u64,
    pending_inputs: Vec<Value>,
}

impl PulseTask {
    pub fn new() -> Self {
        Self {
            params: ParamTree::new()
                .with(UPDATE_INTERVAL_PARAM, 200i64)
                .with("step", 1i64)
                .with("title", "Pulse"),
            ticks: 0,
            remote_inputs: 0,
            pending_inputs: Vec::new(),
        }
    }

    pub fn boxed() -> Box<Self> {
        Box::new(Self::new())
    }

    pub fn ticks(&self) -> i64 {
        self.ticks
    }
}

impl Default for PulseTask {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPlugin for PulseTask {
    fn name(&self) -> &str {
        "pulse"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            update: true,
            produces_sync: true,
            consumes_sync: true,
            produces_input: true,
            consumes_input: true,
            key_events: true,
            ..Capabilities::NONE
        }
    }

    fn network_mode(&self) -> NetworkMode {
        NetworkMode::FollowSession
    }

    fn params(&self) -> &ParamTree {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamTree {
        &mut self.params
    }

    fn on_update(&mut self, ctx: &mut TaskContext) {
        let step = self
            .params
            .get("step")
            .and_then(|value| value.as_int())
            .unwrap_or(1);
        self.ticks += step;
        ctx.journal(["PULSE".to_string(), "TICK".to_string(), self.ticks.to_string()]);
    }

    fn declares_verb(&self, verb: &str) -> bool {
        verb == "reset"
    }

    fn on_verb(&mut self, verb: &str, ctx: &mut TaskContext) {
        if verb == "reset" {
            self.ticks = 0;
            ctx.journal(["PULSE".to_string(), "RESET".to_string()]);
        }
    }

    fn key_event(&mut self, key: u32, _ctx: &mut TaskContext) {
        self.pending_inputs.push(json!({ "key": key }));
    }

    fn get_sync_data(&mut self) -> Option<Value> {
        Some(json!({ "ticks": self.ticks }))
    }

    fn apply_sync_data(&mut self, payload: &Value, _full_update: bool, _ctx: &mut TaskContext) {
        if let Some(ticks) = payload.get("ticks").and_then(Value::as_i64) {
            self.ticks = ticks;
        }
    }

    fn pop_new_inputs(&mut self) -> Option<Value> {
        if self.pending_inputs.is_empty() {
            return None;
        }
        Some(Value::Array(std::mem::take(&mut self.pending_inputs)))
    }

    fn apply_new_inputs(&mut self, inputs: &Value, ctx: &mut TaskContext) {
        if let Some(items) = inputs.as_array() {
            self.remote_inputs += items.len() as u64;
            ctx.journal([
                "PULSE".to_string(),
                "REMOTE_INPUTS".to_string(),
                self.remote_inputs.to_string(),
            ]);
        }
    }
}

/// Modal questionnaire stand-in: starting it pauses the whole session, the
/// way a survey interrupts a run. Stays visible through the pause; resuming
/// is up to the operator or a networked counterpart.
pub struct SurveyTask {
    params: ParamTree,
}

impl SurveyTask {
    pub fn new() -> Self {
        Self {
            params: ParamTree::new().with("title", "Survey"),
        }
    }

    pub fn boxed() -> Box<Self> {
        Box::new(Self::new())
    }
}

impl Default for SurveyTask {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPlugin for SurveyTask {
    fn name(&self) -> &str {
        "survey"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            visible_while_paused: true,
            ..Capabilities::NONE
        }
    }

    fn network_mode(&self) -> NetworkMode {
        NetworkMode::Local
    }

    fn params(&self) -> &ParamTree {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamTree {
        &mut self.params
    }

    fn on_start(&mut self, ctx: &mut TaskContext) {
        ctx.journal(["SURVEY".to_string(), "STATE".to_string(), "SHOW".to_string()]);
        ctx.request_pause();
    }

    fn on_resume(&mut self, ctx: &mut TaskContext) {
        ctx.journal(["SURVEY".to_string(), "STATE".to_string(), "DONE".to_string()]);
    }
}

/// The full built-in set, in registration order.
pub fn all() -> Vec<Box<dyn TaskPlugin>> {
    vec![PulseTask::boxed(), SurveyTask::boxed()]
}

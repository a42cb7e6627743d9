use std::sync::{Arc, Mutex};

use flightdeck::dispatch::{self, Applied};
use flightdeck::params::ParamTree;
use flightdeck::plugin::{Capabilities, PluginRegistry, TaskContext, TaskPlugin};
use flightdeck::scenario::{self, TimeKey};

#[derive(Clone, Default)]
struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct RecordingTask {
    name: String,
    params: ParamTree,
    log: CallLog,
}

impl RecordingTask {
    fn boxed(name: &str, log: CallLog) -> Box<Self> {
        Box::new(Self {
            name: name.to_string(),
            params: ParamTree::new().with("speed", 1i64),
            log,
        })
    }
}

impl TaskPlugin for RecordingTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    fn params(&self) -> &ParamTree {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamTree {
        &mut self.params
    }

    fn on_start(&mut self, _ctx: &mut TaskContext) {
        self.log.push(format!("{}:start", self.name));
    }

    fn on_stop(&mut self, _ctx: &mut TaskContext) {
        self.log.push(format!("{}:stop", self.name));
    }

    fn on_show(&mut self, _ctx: &mut TaskContext) {
        self.log.push(format!("{}:show", self.name));
    }

    fn on_hide(&mut self, _ctx: &mut TaskContext) {
        self.log.push(format!("{}:hide", self.name));
    }

    fn on_pause(&mut self, _ctx: &mut TaskContext) {
        self.log.push(format!("{}:pause", self.name));
    }

    fn on_resume(&mut self, _ctx: &mut TaskContext) {
        self.log.push(format!("{}:resume", self.name));
    }
}

fn fixture(log: &CallLog) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry
        .register(RecordingTask::boxed("alpha", log.clone()))
        .unwrap();
    registry
        .register(RecordingTask::boxed("beta", log.clone()))
        .unwrap();
    registry
}

fn compile(registry: &PluginRegistry, source: &str) -> flightdeck::scenario::Timeline {
    let main_params = ParamTree::new().with("messagetolog", "");
    scenario::compile(source, registry, &main_params, 10_000).unwrap()
}

#[test]
fn priorities_execute_strictly_descending() {
    let log = CallLog::default();
    let registry = fixture(&log);
    let timeline = compile(
        &registry,
        "0:00:00;alpha;start\n\
         0:00:00;beta;start\n\
         0:01:00-5;alpha;show\n\
         0:01:00-9;beta;show\n\
         0:01:00-5;beta;hide\n\
         0:01:05;end\n",
    );

    let key = TimeKey::parse("0:01:00").unwrap();
    let planned = dispatch::plan(&timeline, &key);
    let order: Vec<(String, u32)> = planned
        .iter()
        .map(|command| (command.task.clone(), command.priority))
        .collect();
    assert_eq!(
        order,
        vec![
            ("beta".to_string(), 9),
            ("alpha".to_string(), 5),
            ("beta".to_string(), 5),
        ]
    );
}

#[test]
fn equal_priorities_keep_file_encounter_order() {
    let log = CallLog::default();
    let registry = fixture(&log);
    let timeline = compile(
        &registry,
        "0:00:00;alpha;start\n\
         0:00:00;beta;start\n\
         0:01:00-5;alpha;hide\n\
         0:01:00-5;beta;hide\n\
         0:01:05;end\n",
    );

    let key = TimeKey::parse("0:01:00").unwrap();
    let tasks: Vec<String> = dispatch::plan(&timeline, &key)
        .iter()
        .map(|command| command.task.clone())
        .collect();
    assert_eq!(tasks, vec!["alpha".to_string(), "beta".to_string()]);
}

#[test]
fn default_priority_is_zero_and_runs_last() {
    let log = CallLog::default();
    let registry = fixture(&log);
    let timeline = compile(
        &registry,
        "0:00:00-3;alpha;start\n\
         0:00:00;beta;start\n\
         0:00:05;end\n",
    );

    let key = TimeKey::parse("0:00:00").unwrap();
    let tasks: Vec<String> = dispatch::plan(&timeline, &key)
        .iter()
        .map(|command| command.task.clone())
        .collect();
    assert_eq!(tasks, vec!["alpha".to_string(), "beta".to_string()]);
}

#[test]
fn lifecycle_commands_drive_the_state_table() {
    let log = CallLog::default();
    let mut registry = fixture(&log);
    let timeline = compile(
        &registry,
        "0:00:00;alpha;start\n\
         0:00:01;alpha;hide\n\
         0:00:02;alpha;pause\n\
         0:00:03;alpha;resume\n\
         0:00:04;alpha;stop\n\
         0:00:05;end\n",
    );
    let mut ctx = TaskContext::new();

    let step = |registry: &mut PluginRegistry, ctx: &mut TaskContext, at: &str| {
        let key = TimeKey::parse(at).unwrap();
        for command in dispatch::plan(&timeline, &key) {
            if command.task != "__main__" {
                assert_eq!(
                    dispatch::apply(registry, &command, ctx),
                    Applied::Lifecycle
                );
            }
        }
    };

    step(&mut registry, &mut ctx, "0:00:00");
    {
        let state = &registry.get("alpha").unwrap().state;
        assert!(state.running && state.visible && !state.paused);
    }

    step(&mut registry, &mut ctx, "0:00:01");
    assert!(!registry.get("alpha").unwrap().state.visible);

    step(&mut registry, &mut ctx, "0:00:02");
    assert!(registry.get("alpha").unwrap().state.paused);

    step(&mut registry, &mut ctx, "0:00:03");
    assert!(!registry.get("alpha").unwrap().state.paused);

    step(&mut registry, &mut ctx, "0:00:04");
    {
        let state = &registry.get("alpha").unwrap().state;
        assert!(!state.running && state.paused && !state.visible);
    }

    assert_eq!(
        log.entries(),
        vec![
            "alpha:start",
            "alpha:hide",
            "alpha:pause",
            "alpha:resume",
            "alpha:stop"
        ]
    );
}

#[test]
fn redundant_pause_does_not_rejournal_but_still_hooks() {
    let log = CallLog::default();
    let mut registry = fixture(&log);
    let timeline = compile(
        &registry,
        "0:00:00;alpha;start\n\
         0:00:01-5;alpha;pause\n\
         0:00:01;alpha;pause\n\
         0:00:05;end\n",
    );

    let mut ctx = TaskContext::new();
    for at in ["0:00:00", "0:00:01"] {
        let key = TimeKey::parse(at).unwrap();
        for command in dispatch::plan(&timeline, &key) {
            dispatch::apply(&mut registry, &command, &mut ctx);
        }
    }

    assert!(registry.get("alpha").unwrap().state.paused);
    // Both pause commands reach the hook; only the transition journals.
    assert_eq!(log.entries(), vec!["alpha:start", "alpha:pause", "alpha:pause"]);
    let journaled: Vec<_> = ctx
        .drain()
        .into_iter()
        .filter(|request| {
            matches!(
                request,
                flightdeck::plugin::EngineRequest::Journal(fields)
                    if fields.get(1).map(String::as_str) == Some("STATE")
                        && fields.get(3).map(String::as_str) == Some("PAUSE")
            )
        })
        .collect();
    assert_eq!(journaled.len(), 1);
}

#[test]
fn parameter_writes_do_not_trigger_the_barrier() {
    let log = CallLog::default();
    let mut registry = fixture(&log);
    let timeline = compile(
        &registry,
        "0:00:00;alpha;start\n\
         0:00:01;alpha;speed;4\n\
         0:00:05;end\n",
    );

    let key = TimeKey::parse("0:00:01").unwrap();
    let mut ctx = TaskContext::new();
    for command in dispatch::plan(&timeline, &key) {
        assert_eq!(dispatch::apply(&mut registry, &command, &mut ctx), Applied::Param);
    }
    assert_eq!(
        registry
            .get("alpha")
            .unwrap()
            .plugin
            .params()
            .get("speed"),
        Some(&flightdeck::params::ParamValue::Int(4))
    );
}

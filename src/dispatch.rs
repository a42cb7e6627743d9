//! Priority-ordered command dispatch.
//!
//! [`plan`] flattens one timeline instant into execution order: distinct
//! priorities descending, file-encounter order within a tier. [`apply`]
//! executes a single planned command against the registry; the engine
//! interleaves the pause barrier between lifecycle commands.

use tracing::error;

use crate::plugin::{PluginRegistry, TaskContext, TaskPlugin};
use crate::scenario::{CommandBody, ScheduledCommand, TimeKey, Timeline, Verb};

/// What a command did, which decides whether the engine yields to the pause
/// barrier before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Lifecycle,
    Param,
}

/// Execution order for the commands scheduled at `key`. Empty when the
/// instant has no entry.
pub fn plan(timeline: &Timeline, key: &TimeKey) -> Vec<ScheduledCommand> {
    let Some(commands) = timeline.commands_at(key) else {
        return Vec::new();
    };

    let mut priorities: Vec<u32> = Vec::new();
    for command in commands {
        if !priorities.contains(&command.priority) {
            priorities.push(command.priority);
        }
    }
    priorities.sort_unstable_by(|a, b| b.cmp(a));

    let mut ordered = Vec::with_capacity(commands.len());
    for priority in priorities {
        for command in commands {
            if command.priority == priority {
                ordered.push(command.clone());
            }
        }
    }
    ordered
}

/// Apply one planned command to a registered task.
///
/// Main-script commands never reach this function; the engine intercepts
/// them before dispatch.
pub fn apply(
    registry: &mut PluginRegistry,
    command: &ScheduledCommand,
    ctx: &mut TaskContext,
) -> Applied {
    match &command.body {
        CommandBody::Lifecycle(verb) => {
            let Some(entry) = registry.get_mut(&command.task) else {
                error!(task = %command.task, line = command.line, "dispatch target disappeared");
                return Applied::Param;
            };
            let mut journaled = true;
            match verb {
                Verb::Start => {
                    entry.state.running = true;
                    entry.state.visible = true;
                    entry.state.paused = false;
                    entry.plugin.on_start(ctx);
                }
                Verb::Stop => {
                    entry.state.running = false;
                    entry.state.paused = true;
                    entry.state.visible = false;
                    entry.plugin.on_stop(ctx);
                }
                Verb::Show => {
                    entry.state.visible = true;
                    entry.plugin.on_show(ctx);
                }
                Verb::Hide => {
                    entry.state.visible = false;
                    entry.plugin.on_hide(ctx);
                }
                Verb::Pause => {
                    journaled = !entry.state.paused;
                    entry.state.paused = true;
                    entry.plugin.on_pause(ctx);
                }
                Verb::Resume => {
                    journaled = entry.state.paused;
                    entry.state.paused = false;
                    entry.plugin.on_resume(ctx);
                }
                Verb::Declared(word) => {
                    journaled = false;
                    entry.plugin.on_verb(word, ctx);
                }
            }
            if journaled {
                ctx.journal([
                    "MAIN".to_string(),
                    "STATE".to_string(),
                    command.task.to_ascii_uppercase(),
                    verb.label(),
                ]);
            }
            Applied::Lifecycle
        }
        CommandBody::SetParam { path, value } => {
            let rendered = value.to_string();
            if let Err(err) = registry.set_param(&command.task, path, value.clone()) {
                error!(task = %command.task, line = command.line, error = %err, "parameter write failed");
            } else {
                ctx.journal([
                    "MAIN".to_string(),
                    "SCENARIO".to_string(),
                    command.task.to_ascii_uppercase(),
                    path.join("-").to_ascii_uppercase(),
                    rendered,
                ]);
            }
            Applied::Param
        }
    }
}

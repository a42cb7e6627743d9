//! Scenario source compiler.
//!
//! Turns the newline-delimited command grammar into a validated [`Timeline`].
//! Every failure is fatal to the whole compile and carries the 1-based line
//! number of the offending entry; nothing half-compiled ever reaches the
//! scheduler.

use thiserror::Error;

use crate::params::{ParamError, ParamTree};
use crate::plugin::{PluginRegistry, TaskPlugin, MAIN_TASK};
use crate::scenario::{CommandBody, ScheduledCommand, TimeKey, Timeline, Verb};

/// Verbs the main script accepts as single-word commands.
const MAIN_VERBS: [&str; 3] = ["pause", "resume", "end"];

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("line {line}: expected 2 to 4 semicolon-separated fields")]
    Syntax { line: usize },
    #[error("line {line}: malformed time '{time}' (expected H:MM:SS with an optional -PRIORITY suffix)")]
    Time { line: usize, time: String },
    #[error("line {line}: priority {priority} exceeds the configured maximum of {max}")]
    Priority {
        line: usize,
        priority: u32,
        max: u32,
    },
    #[error("line {line}: unknown task '{task}'")]
    UnknownTask { line: usize, task: String },
    #[error("line {line}: task '{task}' does not accept command '{verb}'")]
    UnknownCommand {
        line: usize,
        task: String,
        verb: String,
    },
    #[error("line {line}: {source}")]
    Parameter { line: usize, source: ParamError },
    #[error("task '{task}' has no scenario entries")]
    EmptyTask { task: String },
    #[error("task '{task}' is never started")]
    MissingStart { task: String },
    #[error("the scenario must finish with a solitary 'end' command")]
    MissingEnd,
    #[error("the scenario starts no task")]
    NoTasks,
}

/// Compile scenario source against the registered tasks.
///
/// `main_params` is the main script's own configuration tree; a three-field
/// line whose middle field names one of its keys is shorthand for a main
/// parameter write, mirroring the two-field verb shorthand.
pub fn compile(
    source: &str,
    registry: &PluginRegistry,
    main_params: &ParamTree,
    max_priority: u32,
) -> Result<Timeline, ScenarioError> {
    let mut timeline = Timeline::default();

    for (index, raw_line) in source.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw_line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut fields: Vec<&str> = trimmed.split(';').map(str::trim).collect();
        if fields.len() < 2 || fields.len() > 4 {
            return Err(ScenarioError::Syntax { line });
        }

        // Main-script shorthand: `TIME;WORD` and `TIME;PARAM;VALUE`.
        if fields.len() == 2 || (fields.len() == 3 && main_params.contains(fields[1])) {
            fields.insert(1, MAIN_TASK);
        }

        let (key, priority) = parse_time(fields[0], line, max_priority)?;
        let task = fields[1];
        let command = &fields[2..];

        let body = if task == MAIN_TASK {
            compile_main_command(command, line, main_params)?
        } else {
            let entry = registry
                .get(task)
                .ok_or_else(|| ScenarioError::UnknownTask {
                    line,
                    task: task.to_string(),
                })?;
            compile_task_command(command, line, task, entry.plugin.as_ref())?
        };

        timeline.push(
            key,
            ScheduledCommand {
                line,
                task: task.to_string(),
                body,
                priority,
            },
        );
    }

    validate(&timeline)?;
    Ok(timeline)
}

fn parse_time(field: &str, line: usize, max_priority: u32) -> Result<(TimeKey, u32), ScenarioError> {
    let malformed = || ScenarioError::Time {
        line,
        time: field.to_string(),
    };

    if field.len() == 7 {
        return Ok((TimeKey::parse(field).ok_or_else(malformed)?, 0));
    }

    let (time_part, priority_part) = field.split_at_checked(7).ok_or_else(malformed)?;
    let priority_part = priority_part.strip_prefix('-').ok_or_else(malformed)?;
    if priority_part.is_empty() || !priority_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let key = TimeKey::parse(time_part).ok_or_else(malformed)?;
    let priority: u32 = priority_part.parse().map_err(|_| malformed())?;
    if priority > max_priority {
        return Err(ScenarioError::Priority {
            line,
            priority,
            max: max_priority,
        });
    }
    Ok((key, priority))
}

fn compile_main_command(
    command: &[&str],
    line: usize,
    main_params: &ParamTree,
) -> Result<CommandBody, ScenarioError> {
    match command {
        [word] => {
            let word = word.to_ascii_lowercase();
            if !MAIN_VERBS.contains(&word.as_str()) {
                return Err(ScenarioError::UnknownCommand {
                    line,
                    task: MAIN_TASK.to_string(),
                    verb: word,
                });
            }
            let verb = Verb::fixed(&word).unwrap_or(Verb::Declared(word));
            Ok(CommandBody::Lifecycle(verb))
        }
        [path, value] => {
            let path: Vec<String> = path.split('-').map(str::to_string).collect();
            let value = main_params
                .coerce_path(&path, value)
                .map_err(|source| ScenarioError::Parameter { line, source })?;
            Ok(CommandBody::SetParam { path, value })
        }
        _ => Err(ScenarioError::Syntax { line }),
    }
}

fn compile_task_command(
    command: &[&str],
    line: usize,
    task: &str,
    plugin: &dyn TaskPlugin,
) -> Result<CommandBody, ScenarioError> {
    match command {
        [word] => {
            let word = word.to_ascii_lowercase();
            if let Some(verb) = Verb::fixed(&word) {
                Ok(CommandBody::Lifecycle(verb))
            } else if plugin.declares_verb(&word) {
                Ok(CommandBody::Lifecycle(Verb::Declared(word)))
            } else {
                Err(ScenarioError::UnknownCommand {
                    line,
                    task: task.to_string(),
                    verb: word,
                })
            }
        }
        [path, value] => {
            let path: Vec<String> = path.split('-').map(str::to_string).collect();
            let value = plugin
                .params()
                .coerce_path(&path, value)
                .map_err(|source| ScenarioError::Parameter { line, source })?;
            Ok(CommandBody::SetParam { path, value })
        }
        _ => Err(ScenarioError::Syntax { line }),
    }
}

fn validate(timeline: &Timeline) -> Result<(), ScenarioError> {
    let real_tasks: Vec<&String> = timeline
        .tasks()
        .iter()
        .filter(|task| task.as_str() != MAIN_TASK)
        .collect();

    if real_tasks.is_empty() {
        return Err(ScenarioError::NoTasks);
    }

    for task in &real_tasks {
        let task = task.as_str();
        let mut entries = 0usize;
        let mut started = false;
        for key in timeline.keys() {
            for command in timeline.commands_at(key).unwrap_or(&[]) {
                if command.task == task {
                    entries += 1;
                    if matches!(command.body, CommandBody::Lifecycle(Verb::Start)) {
                        started = true;
                    }
                }
            }
        }
        if entries == 0 {
            return Err(ScenarioError::EmptyTask {
                task: task.to_string(),
            });
        }
        if !started {
            return Err(ScenarioError::MissingStart {
                task: task.to_string(),
            });
        }
    }

    let last_key = timeline.final_key().ok_or(ScenarioError::MissingEnd)?;
    let last_commands = timeline.commands_at(last_key).unwrap_or(&[]);
    let solitary_end = last_commands.len() == 1
        && last_commands[0].task == MAIN_TASK
        && matches!(
            &last_commands[0].body,
            CommandBody::Lifecycle(Verb::Declared(word)) if word == "end"
        );
    if !solitary_end {
        return Err(ScenarioError::MissingEnd);
    }

    Ok(())
}

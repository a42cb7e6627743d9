//! Registration-time bookkeeping for task plugins.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::params::{ParamError, ParamValue};
use crate::plugin::{Capabilities, TaskPlugin, MAIN_TASK};

/// Reserved parameter that paces a task's update hook, in milliseconds.
pub const UPDATE_INTERVAL_PARAM: &str = "taskupdatetime";

/// Per-task lifecycle state, owned exclusively by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub running: bool,
    pub paused: bool,
    pub visible: bool,
    pub previously_paused: bool,
    pub update_interval: Option<Duration>,
    pub time_since_update: Duration,
    pub receives_key_events: bool,
}

impl TaskState {
    fn at_registration(update_interval: Option<Duration>, receives_key_events: bool) -> Self {
        Self {
            running: false,
            paused: false,
            visible: false,
            previously_paused: false,
            update_interval,
            time_since_update: Duration::ZERO,
            receives_key_events,
        }
    }
}

pub struct PluginEntry {
    pub plugin: Box<dyn TaskPlugin>,
    pub state: TaskState,
    pub capabilities: Capabilities,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("task '{0}' is already registered")]
    Duplicate(String),
    #[error("task name '{0}' is reserved")]
    Reserved(String),
    #[error("task '{name}' declares an update interval but no update capability")]
    MissingUpdateHook { name: String },
    #[error("task '{name}': {source}")]
    Parameter { name: String, source: ParamError },
}

/// All registered tasks, keyed by name. Iteration order is the task name
/// order, which keeps host/participant traversals deterministic.
#[derive(Default)]
pub struct PluginRegistry {
    entries: BTreeMap<String, PluginEntry>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Box<dyn TaskPlugin>) -> Result<(), RegistryError> {
        let name = plugin.name().to_ascii_lowercase();
        if name == MAIN_TASK {
            return Err(RegistryError::Reserved(name));
        }
        if self.entries.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        let capabilities = plugin.capabilities();
        let update_interval = match plugin.params().get(UPDATE_INTERVAL_PARAM) {
            Some(ParamValue::Int(ms)) if *ms > 0 => {
                if !capabilities.update {
                    return Err(RegistryError::MissingUpdateHook { name });
                }
                Some(Duration::from_millis(*ms as u64))
            }
            _ => None,
        };

        let state = TaskState::at_registration(update_interval, capabilities.key_events);
        self.entries.insert(
            name,
            PluginEntry {
                plugin,
                state,
                capabilities,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&PluginEntry> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut PluginEntry> {
        self.entries.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PluginEntry)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut PluginEntry)> {
        self.entries.iter_mut()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write a coerced value into a task's configuration tree. The reserved
    /// `taskupdatetime` leaf also refreshes the pacing recorded in
    /// [`TaskState`].
    pub fn set_param(
        &mut self,
        task: &str,
        path: &[String],
        value: ParamValue,
    ) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(task)
            .ok_or_else(|| RegistryError::Parameter {
                name: task.to_string(),
                source: ParamError::UnknownPath {
                    path: path.join("-"),
                },
            })?;
        entry
            .plugin
            .params_mut()
            .set_path(path, value.clone())
            .map_err(|source| RegistryError::Parameter {
                name: task.to_string(),
                source,
            })?;

        if path.len() == 1 && path[0] == UPDATE_INTERVAL_PARAM && entry.capabilities.update {
            if let ParamValue::Int(ms) = value {
                entry.state.update_interval = if ms > 0 {
                    Some(Duration::from_millis(ms as u64))
                } else {
                    None
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamTree;

    struct Bare {
        name: String,
        params: ParamTree,
        capabilities: Capabilities,
    }

    impl TaskPlugin for Bare {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> Capabilities {
            self.capabilities
        }

        fn params(&self) -> &ParamTree {
            &self.params
        }

        fn params_mut(&mut self) -> &mut ParamTree {
            &mut self.params
        }
    }

    fn updating(name: &str, interval_ms: i64) -> Box<Bare> {
        Box::new(Bare {
            name: name.to_string(),
            params: ParamTree::new().with(UPDATE_INTERVAL_PARAM, interval_ms),
            capabilities: Capabilities {
                update: true,
                ..Capabilities::NONE
            },
        })
    }

    #[test]
    fn registration_reads_the_update_interval() {
        let mut registry = PluginRegistry::new();
        registry.register(updating("track", 20)).unwrap();
        let entry = registry.get("track").unwrap();
        assert_eq!(entry.state.update_interval, Some(Duration::from_millis(20)));
        assert!(!entry.state.running);
        assert!(!entry.state.visible);
    }

    #[test]
    fn update_interval_without_capability_is_rejected() {
        let mut registry = PluginRegistry::new();
        let result = registry.register(Box::new(Bare {
            name: "sysmon".into(),
            params: ParamTree::new().with(UPDATE_INTERVAL_PARAM, 50i64),
            capabilities: Capabilities::NONE,
        }));
        assert!(matches!(
            result,
            Err(RegistryError::MissingUpdateHook { .. })
        ));
    }

    #[test]
    fn reserved_and_duplicate_names_are_rejected() {
        let mut registry = PluginRegistry::new();
        let bare = |name: &str| {
            Box::new(Bare {
                name: name.into(),
                params: ParamTree::new(),
                capabilities: Capabilities::NONE,
            })
        };
        assert!(matches!(
            registry.register(bare(MAIN_TASK)),
            Err(RegistryError::Reserved(_))
        ));
        registry.register(bare("track")).unwrap();
        assert!(matches!(
            registry.register(bare("track")),
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[test]
    fn writing_taskupdatetime_refreshes_the_pacing() {
        let mut registry = PluginRegistry::new();
        registry.register(updating("track", 20)).unwrap();
        registry
            .set_param(
                "track",
                &[UPDATE_INTERVAL_PARAM.to_string()],
                ParamValue::Int(75),
            )
            .unwrap();
        assert_eq!(
            registry.get("track").unwrap().state.update_interval,
            Some(Duration::from_millis(75))
        );
    }
}

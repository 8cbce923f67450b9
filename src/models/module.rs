use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A declarative scan definition loaded from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub mode: ModuleMode,
    #[serde(default)]
    pub inputs: Vec<InputField>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub steps: Vec<ModuleStep>,
    /// Shared working directory under the engine workspace.
    #[serde(default)]
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputField {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStep {
    #[serde(default)]
    pub name: Option<String>,
    pub command: String,
    #[serde(default)]
    pub condition: Option<String>,
    /// Variable name to regex; first capture group (or whole match) of the
    /// step output is stored into the task context.
    #[serde(default)]
    pub extract: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleMode {
    Auto,
    #[default]
    Manual,
}

/// Explicit result classification carried from module to task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    #[default]
    Scan,
    Vulnerability,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Scan => "scan",
            TaskKind::Vulnerability => "vulnerability",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scan" => Some(TaskKind::Scan),
            "vulnerability" => Some(TaskKind::Vulnerability),
            _ => None,
        }
    }
}

impl Module {
    /// Steps the engine will run for this module, in order.
    pub fn plan(&self) -> Vec<ModuleStep> {
        match &self.command {
            Some(command) if self.steps.is_empty() => vec![ModuleStep {
                name: None,
                command: command.clone(),
                condition: None,
                extract: BTreeMap::new(),
            }],
            _ => self.steps.clone(),
        }
    }
}

impl ModuleStep {
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Step {}", index + 1))
    }
}

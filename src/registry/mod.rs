//! Module registry: YAML module definitions and command resolution.
//!
//! Modules are loaded from every `*.yaml`/`*.yml` file under the modules
//! directory. A file that fails to parse or validate is skipped with a
//! warning so one broken definition never hides the others.

pub mod template;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{info, warn};
use regex::Regex;

use crate::error::{EngineError, Result};
use crate::models::module::{Module, ModuleMode};
use template::{render, TemplateError};

/// Input names tried, in order, for a task's target label.
const TARGET_KEYS: [&str; 5] = ["target", "ip", "range", "host", "dc_ip"];

pub struct ModuleRegistry {
    dir: Option<PathBuf>,
    modules: RwLock<Arc<Vec<Module>>>,
}

/// A module's command rendered against one set of inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub command: String,
    pub context: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub target: Option<String>,
}

impl ModuleRegistry {
    pub fn load(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let modules = load_dir(&dir);
        info!("Loaded {} module(s) from '{}'.", modules.len(), dir.display());
        ModuleRegistry {
            dir: Some(dir),
            modules: RwLock::new(Arc::new(modules)),
        }
    }

    pub fn from_modules(modules: Vec<Module>) -> Self {
        let modules = modules.into_iter().map(with_mode).collect();
        ModuleRegistry {
            dir: None,
            modules: RwLock::new(Arc::new(modules)),
        }
    }

    /// Replaces the loaded set wholesale. Returns the new module count.
    pub fn reload(&self) -> usize {
        let Some(dir) = &self.dir else {
            return self.list().len();
        };
        let modules = load_dir(dir);
        let count = modules.len();
        *self.modules.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(modules);
        info!("Reloaded {} module(s).", count);
        count
    }

    pub fn list(&self) -> Arc<Vec<Module>> {
        Arc::clone(&self.modules.read().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn get(&self, id: &str) -> Result<Module> {
        self.list()
            .iter()
            .find(|module| module.id == id)
            .cloned()
            .ok_or_else(|| EngineError::module_not_found(id))
    }
}

/// Builds the task context and renders the module's display command.
///
/// Precedence is input value, then field default, then global variable.
/// The global map itself becomes the environment snapshot for the task.
pub fn resolve(
    module: &Module,
    inputs: &HashMap<String, String>,
    globals: &BTreeMap<String, String>,
) -> Result<Resolution> {
    let mut context = globals.clone();
    for field in &module.inputs {
        if let Some(default) = field.default.as_ref().filter(|d| !d.is_empty()) {
            context.insert(field.name.clone(), default.clone());
        }
    }
    for (key, value) in inputs {
        if !value.trim().is_empty() {
            context.insert(key.clone(), value.clone());
        }
    }

    let plan = module.plan();
    let command = match plan.first() {
        Some(step) if module.steps.is_empty() || step.condition.is_none() => {
            render(&step.command, |name| context.get(name).cloned()).map_err(|err| match err {
                TemplateError::Missing { name } => EngineError::MissingInput(name),
            })?
        }
        _ => format!("multi-step workflow ({} steps)", plan.len()),
    };

    let target = TARGET_KEYS
        .iter()
        .find_map(|key| inputs.get(*key).filter(|v| !v.trim().is_empty()).cloned());

    Ok(Resolution {
        command,
        context,
        env: globals.clone(),
        target,
    })
}

/// Parses and validates one module definition.
pub fn parse_module(content: &str) -> std::result::Result<Module, String> {
    let module: Module =
        serde_yaml::from_str(content).map_err(|e| format!("invalid module YAML: {}", e))?;
    validate(&module)?;
    Ok(with_mode(module))
}

fn with_mode(mut module: Module) -> Module {
    module.mode = if module.steps.is_empty() {
        ModuleMode::Manual
    } else {
        ModuleMode::Auto
    };
    module
}

fn validate(module: &Module) -> std::result::Result<(), String> {
    if module.id.trim().is_empty() {
        return Err("module id must not be empty".to_string());
    }
    match (&module.command, module.steps.is_empty()) {
        (Some(_), false) => {
            return Err(format!(
                "module '{}' defines both 'command' and 'steps'",
                module.id
            ))
        }
        (None, true) => {
            return Err(format!(
                "module '{}' defines neither 'command' nor 'steps'",
                module.id
            ))
        }
        _ => {}
    }
    for step in &module.steps {
        for (var, pattern) in &step.extract {
            Regex::new(pattern).map_err(|e| {
                format!(
                    "module '{}': extract pattern for '{}' is invalid: {}",
                    module.id, var, e
                )
            })?;
        }
    }
    Ok(())
}

fn load_dir(dir: &Path) -> Vec<Module> {
    let mut files = Vec::new();
    if let Err(e) = collect_yaml_files(dir, &mut files) {
        warn!("Cannot read modules directory '{}': {}", dir.display(), e);
        return Vec::new();
    }
    files.sort();

    let mut modules: Vec<Module> = Vec::new();
    for path in files {
        let parsed = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|content| parse_module(&content));
        match parsed {
            Ok(module) if modules.iter().any(|m| m.id == module.id) => {
                warn!(
                    "Skipping '{}': module id '{}' already loaded.",
                    path.display(),
                    module.id
                );
            }
            Ok(module) => modules.push(module),
            Err(e) => warn!("Skipping module file '{}': {}", path.display(), e),
        }
    }
    modules
}

fn collect_yaml_files(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_yaml_files(&path, files)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            files.push(path);
        }
    }
    Ok(())
}

//! OCR engine registry with adaptive ordering.
//!
//! Scansets are tried in descending hit-counter order. Counters are a
//! performance heuristic only: a scanset that recently met the required
//! match count gets bumped (capped at the autosort buffer) while the rest
//! decay toward zero. Counters persist between runs through an explicit
//! save/load at the registry boundary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::ScanSetConfig;
use crate::tool::{ToolIo, ToolResult, ToolRunner, RET_EXEC};

/// One configured OCR engine with its adaptive hit counter.
#[derive(Debug, Clone)]
pub struct ScanSet {
    pub label: String,
    pub command: String,
    pub args: Vec<String>,
    pub hits: u32,
}

impl ScanSet {
    /// Materialize the command template for an input raster.
    ///
    /// `{input}` tokens are substituted; a template without a placeholder
    /// gets the input appended. Returns `None` for an empty template.
    pub fn build_command(&self, input: &Path) -> Option<(String, Vec<String>)> {
        let input = input.to_string_lossy();
        let mut tokens = self.command.split_whitespace();
        let program = tokens.next()?.to_string();
        let mut args: Vec<String> = tokens
            .map(|t| t.replace("{input}", &input))
            .collect();
        args.extend(self.args.iter().cloned());
        if !self.command.contains("{input}") {
            args.push(input.into_owned());
        }
        Some((program, args))
    }
}

/// Ordered scanset collection plus counter persistence.
pub struct ScansetRegistry {
    sets: Vec<ScanSet>,
    buffer: u32,
    state_path: Option<PathBuf>,
}

impl ScansetRegistry {
    /// Build the registry from config, loading persisted counters when a
    /// state file exists.
    pub fn from_config(
        configs: &[ScanSetConfig],
        buffer: u32,
        state_path: Option<PathBuf>,
    ) -> Self {
        let counters = state_path
            .as_deref()
            .map(load_counters)
            .unwrap_or_default();
        let sets = configs
            .iter()
            .map(|cfg| ScanSet {
                label: cfg.label.clone(),
                command: cfg.command.clone(),
                args: cfg.args.clone(),
                hits: counters.get(&cfg.label).copied().unwrap_or(0).min(buffer),
            })
            .collect();
        Self {
            sets,
            buffer,
            state_path,
        }
    }

    pub fn get(&self, index: usize) -> Option<&ScanSet> {
        self.sets.get(index)
    }

    /// Indices in iteration order: descending hit counter, config order
    /// on ties.
    pub fn order(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.sets.len()).collect();
        indices.sort_by(|a, b| self.sets[*b].hits.cmp(&self.sets[*a].hits));
        indices
    }

    /// Scansets in iteration order, for display.
    pub fn ordered(&self) -> Vec<&ScanSet> {
        self.order().into_iter().map(|i| &self.sets[i]).collect()
    }

    /// Invoke one scanset on an input raster, capturing its output.
    pub async fn run(&self, set: &ScanSet, runner: &ToolRunner, input: &Path) -> ToolResult {
        match set.build_command(input) {
            Some((program, args)) => runner.invoke(&program, &args, ToolIo::capture()).await,
            None => ToolResult {
                retcode: RET_EXEC,
                lines: vec![format!("scanset {} has no command", set.label)],
            },
        }
    }

    /// Reward the scanset that met the required count: bump its counter,
    /// decay everyone else's.
    pub fn reward(&mut self, label: &str) {
        for set in &mut self.sets {
            if set.label == label {
                set.hits = (set.hits + 1).min(self.buffer);
            } else {
                set.hits = set.hits.saturating_sub(1);
            }
        }
    }

    /// Persist counters to the state file.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = self.state_path.as_deref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let counters: BTreeMap<&str, u32> = self
            .sets
            .iter()
            .map(|s| (s.label.as_str(), s.hits))
            .collect();
        let body = serde_json::to_string_pretty(&counters)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, body)
    }
}

fn load_counters(path: &Path) -> BTreeMap<String, u32> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), "ignoring bad scanset state: {e}");
            BTreeMap::new()
        }),
        Err(_) => BTreeMap::new(),
    }
}

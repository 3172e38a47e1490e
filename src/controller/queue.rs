//! Script queue and breakpoint set.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One queued script. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptEntry {
    pub path: PathBuf,
    pub group: Option<String>,
    /// Zero-based index in the queue.
    pub position: usize,
}

impl ScriptEntry {
    /// File name used in events and history records.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Ordered list of scripts for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptQueue {
    entries: Vec<ScriptEntry>,
}

impl ScriptQueue {
    pub fn from_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let entries = paths
            .into_iter()
            .enumerate()
            .map(|(position, p)| ScriptEntry {
                path: p.into(),
                group: None,
                position,
            })
            .collect();
        Self { entries }
    }

    /// Load a manifest file. Relative paths resolve against its directory.
    pub fn from_manifest(path: &Path) -> Result<(Self, BreakpointSet)> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest: {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self::parse_manifest(&text, base))
    }

    /// Parse manifest text.
    ///
    /// One script per line. Blank lines and `#` comments are skipped, a
    /// `[name]` line sets the group for the entries that follow, and a
    /// leading `*` puts a breakpoint before that entry.
    pub fn parse_manifest(text: &str, base: &Path) -> (Self, BreakpointSet) {
        let mut entries = Vec::new();
        let mut breakpoints = BreakpointSet::new();
        let mut group: Option<String> = None;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim();
                group = (!name.is_empty()).then(|| name.to_string());
                continue;
            }

            let (line, brk) = match line.strip_prefix('*') {
                Some(rest) => (rest.trim_start(), true),
                None => (line, false),
            };
            let position = entries.len();
            if brk {
                breakpoints.insert(position);
            }
            let p = Path::new(line);
            let path = if p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            };
            entries.push(ScriptEntry {
                path,
                group: group.clone(),
                position,
            });
        }

        (Self { entries }, breakpoints)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&ScriptEntry> {
        self.entries.get(position)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScriptEntry> {
        self.entries.iter()
    }
}

/// Queue positions at which a run halts before launching the script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointSet {
    positions: BTreeSet<usize>,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, position: usize) -> bool {
        self.positions.insert(position)
    }

    pub fn remove(&mut self, position: usize) -> bool {
        self.positions.remove(&position)
    }

    /// Flip a breakpoint. Returns whether it is now set.
    pub fn toggle(&mut self, position: usize) -> bool {
        if self.positions.remove(&position) {
            false
        } else {
            self.positions.insert(position);
            true
        }
    }

    pub fn contains(&self, position: usize) -> bool {
        self.positions.contains(&position)
    }

    pub fn extend(&mut self, other: &BreakpointSet) {
        self.positions.extend(other.positions.iter().copied());
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.positions.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl FromIterator<usize> for BreakpointSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        Self {
            positions: iter.into_iter().collect(),
        }
    }
}

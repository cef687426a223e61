//! Weighted wordlist loading.
//!
//! A wordlist file has one entry per line: the word itself, optionally
//! followed by `:` and a fuzz threshold in `[0, 1)`. Blank lines and `#`
//! comments are skipped. A personal list merges over the global one, with
//! personal entries overriding.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WordlistError {
    #[error("failed to read wordlist {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
}

/// Word text mapped to its fuzz-distance threshold.
#[derive(Debug, Clone, Default)]
pub struct Wordlist {
    entries: BTreeMap<String, f32>,
}

impl Wordlist {
    /// Load the global list plus an optional personal override list.
    pub fn load(
        global: &Path,
        personal: Option<&Path>,
        default_threshold: f32,
    ) -> Result<Self, WordlistError> {
        let mut list = Self::default();
        list.merge_file(global, default_threshold)?;
        if let Some(personal) = personal {
            if personal.exists() {
                list.merge_file(personal, default_threshold)?;
            }
        }
        Ok(list)
    }

    /// Build a wordlist directly from (word, threshold) pairs.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, f32)>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(w, t)| (w.into(), t))
                .collect(),
        }
    }

    fn merge_file(&mut self, path: &Path, default_threshold: f32) -> Result<(), WordlistError> {
        let raw = std::fs::read_to_string(path).map_err(|source| WordlistError::Read {
            path: path.display().to_string(),
            source,
        })?;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (word, threshold) = parse_entry(line, default_threshold);
            if word.is_empty() {
                continue;
            }
            self.entries.insert(word, threshold);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.entries.iter().map(|(w, t)| (w.as_str(), *t))
    }
}

/// Split a wordlist line into word and threshold.
///
/// Only the part after the final `:` is considered a threshold, so words
/// containing colons still parse. Thresholds outside `[0, 1)` fall back to
/// the default.
fn parse_entry(line: &str, default_threshold: f32) -> (String, f32) {
    if let Some((word, thr)) = line.rsplit_once(':') {
        if let Ok(value) = thr.trim().parse::<f32>() {
            if (0.0..1.0).contains(&value) {
                return (word.trim().to_string(), value);
            }
            tracing::warn!(line, "wordlist threshold out of range, using default");
            return (word.trim().to_string(), default_threshold);
        }
    }
    (line.to_string(), default_threshold)
}

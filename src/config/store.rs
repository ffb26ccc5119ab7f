//! Durable key → integer settings backed by a `key = value` text file
//!
//! Readers share the map; `set`, `load` and `save` take it exclusively.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Entries {
    values: BTreeMap<String, i32>,
    dirty: bool,
}

#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    entries: RwLock<Entries>,
}

impl ConfigStore {
    /// Create a store for `path` and load whatever the file currently holds
    pub fn open(path: PathBuf) -> Self {
        let store = Self {
            path,
            entries: RwLock::new(Entries::default()),
        };
        store.load();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory map with the file's contents
    ///
    /// A missing or unreadable file yields an empty map. Lines without `=`
    /// or with a value that is not an integer are skipped.
    pub fn load(&self) {
        let mut entries = self.entries.write();
        entries.values.clear();
        entries.dirty = false;

        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                debug!(
                    path = %self.path.display(),
                    error = %e,
                    "No readable config file, starting empty"
                );
                return;
            }
        };

        for line in contents.lines() {
            if let Some((key, value)) = parse_line(line) {
                entries.values.insert(key.to_string(), value);
            }
        }
        info!(path = %self.path.display(), count = entries.values.len(), "Loaded config");
    }

    /// Truncate and rewrite the file, one `key = value` line per entry in key order
    pub fn save(&self) -> Result<()> {
        let mut entries = self.entries.write();

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {}", parent.display()))?;
        }
        let file = fs::File::create(&self.path)
            .context(format!("Failed to open config file {}", self.path.display()))?;
        let mut writer = BufWriter::new(file);
        for (key, value) in &entries.values {
            writeln!(writer, "{key} = {value}")
                .context(format!("Failed to write config file {}", self.path.display()))?;
        }
        writer
            .flush()
            .context(format!("Failed to flush config file {}", self.path.display()))?;

        entries.dirty = false;
        debug!(path = %self.path.display(), count = entries.values.len(), "Saved config");
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<i32> {
        self.entries.read().values.get(key).copied()
    }

    /// Insert or overwrite `key`. With `skip_if_exists`, an existing key is left alone.
    pub fn set(&self, key: &str, value: i32, skip_if_exists: bool) {
        let mut entries = self.entries.write();
        if skip_if_exists && entries.values.contains_key(key) {
            return;
        }
        entries.values.insert(key.to_string(), value);
        entries.dirty = true;
    }

    /// True when a `set` happened since the last `load`/`save`
    pub fn is_dirty(&self) -> bool {
        self.entries.read().dirty
    }
}

/// Split `<key><spaces>=<spaces><integer>` into its parts
fn parse_line(line: &str) -> Option<(&str, i32)> {
    if line.is_empty() {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    let key = key.trim_end_matches(' ');
    let value = parse_leading_int(value.trim_start_matches(' '))?;
    Some((key, value))
}

/// Parse a base-10 integer at the start of `text`
///
/// Leading whitespace is skipped and anything after the digits is ignored
/// (`"12 # note"` parses as 12). No digits, or a value outside `i32`, is `None`.
fn parse_leading_int(text: &str) -> Option<i32> {
    let text = text.trim_start();
    let sign_len = usize::from(text.starts_with(['+', '-']));
    let digits = text[sign_len..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 {
        return None;
    }
    text[..sign_len + digits].parse().ok()
}

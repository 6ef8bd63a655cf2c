//! Per-process rules
//!
//! Stored as a flat JSON object mapping `"<exe path>:<port>"` to a boolean
//! (true = allow). The port may be `*` to match every destination port.
//! Top-level `applications` and `services` keys are metadata and skipped.

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

const META_KEYS: [&str; 2] = ["applications", "services"];

type RuleKey = (String, Option<u16>);

pub struct RuleSet {
    path: PathBuf,
    rules: RwLock<HashMap<RuleKey, bool>>,
    /// mtime seen at the last load attempt
    loaded_mtime: Mutex<Option<SystemTime>>,
}

impl RuleSet {
    /// Creates a rule set backed by `path` and loads it if the file exists.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let set = Self {
            path: path.into(),
            rules: RwLock::new(HashMap::new()),
            loaded_mtime: Mutex::new(None),
        };
        set.reload();
        set
    }

    /// Replaces the in-memory rules with the file's content. A missing or
    /// unreadable file keeps the current rules.
    pub fn reload(&self) {
        if !self.path.exists() {
            info!("No rules file at {}, starting with empty rules", self.path.display());
            return;
        }

        // A broken file is retried only once it changes again
        *self.loaded_mtime.lock() = self.mtime();
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read rules file: {}", e);
                return;
            }
        };

        match parse_rules(&content) {
            Ok(parsed) => {
                info!("Loaded {} rules from {}", parsed.len(), self.path.display());
                *self.rules.write() = parsed;
            }
            Err(e) => error!("Failed to parse rules file {}: {}", self.path.display(), e),
        }
    }

    /// `Some(true)` to allow, `Some(false)` to deny, `None` without a rule.
    /// A rule for the exact port wins over a wildcard one.
    pub fn decision(&self, app_path: &str, port: u16) -> Option<bool> {
        let rules = self.rules.read();
        let key = (app_path.to_string(), Some(port));
        if let Some(&allow) = rules.get(&key) {
            return Some(allow);
        }
        rules.get(&(key.0, None)).copied()
    }

    /// Reloads the file if it changed on disk since the last load.
    pub fn reload_if_changed(&self) {
        let current = self.mtime();
        if current.is_some() && current != *self.loaded_mtime.lock() {
            debug!("Rules file {} changed, reloading", self.path.display());
            self.reload();
        }
    }

    fn mtime(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

fn parse_rules(content: &str) -> Result<HashMap<RuleKey, bool>, serde_json::Error> {
    let json: serde_json::Value = serde_json::from_str(content)?;
    let mut rules = HashMap::new();

    let serde_json::Value::Object(map) = json else {
        warn!("Rules file is not a JSON object, ignoring");
        return Ok(rules);
    };

    for (key, value) in map {
        if META_KEYS.contains(&key.as_str()) {
            continue;
        }
        let Some((app_path, port_str)) = key.rsplit_once(':') else {
            debug!("Skipping rule without port: {}", key);
            continue;
        };
        let port = match port_str {
            "*" => None,
            p => match p.parse::<u16>() {
                Ok(port) => Some(port),
                Err(_) => {
                    debug!("Skipping rule with bad port: {}", key);
                    continue;
                }
            },
        };
        if let serde_json::Value::Bool(allow) = value {
            rules.insert((app_path.to_string(), port), allow);
        }
    }
    Ok(rules)
}

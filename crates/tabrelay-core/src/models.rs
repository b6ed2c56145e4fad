//! Model registry: model name to backend id lookup, refreshed from scraped page HTML.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::Result;

static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<script[^>]*>(.*?)</script>").expect("static regex"));
static NEXT_PUSH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)self\.__next_f\.push\(\[1,"(.*?)"\]\)"#).expect("static regex")
});

/// Known models, loaded from `models.json`.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: BTreeMap<String, String>,
    default_id: String,
    path: PathBuf,
}

/// Differences between the stored table and a freshly scraped one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// (name, old id, new id)
    pub changed: Vec<(String, String, String)>,
}

impl ModelDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl ModelRegistry {
    /// Load the registry, starting empty if the file is missing or invalid.
    pub fn load(path: &Path, default_id: &str) -> Self {
        let models: BTreeMap<String, String> = match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(models) => models,
                Err(e) => {
                    error!("Failed to parse {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };

        info!("Loaded {} models from {}", models.len(), path.display());

        Self {
            models,
            default_id: default_id.to_string(),
            path: path.to_path_buf(),
        }
    }

    /// Build an in-memory registry (for tests and embedding).
    pub fn from_map(models: BTreeMap<String, String>, default_id: &str) -> Self {
        Self {
            models,
            default_id: default_id.to_string(),
            path: PathBuf::new(),
        }
    }

    /// Resolve a model name to its backend id, falling back to the default id.
    pub fn resolve(&self, name: Option<&str>) -> &str {
        match name.and_then(|n| self.models.get(n)) {
            Some(id) => id,
            None => {
                warn!(
                    model = name.unwrap_or("<none>"),
                    "Unknown model, using default backend id"
                );
                &self.default_id
            }
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn set_default_id(&mut self, default_id: &str) {
        self.default_id = default_id.to_string();
    }

    /// Compare against scraped model objects (`publicName`, `id`).
    pub fn diff(&self, scraped: &[Value]) -> ModelDiff {
        let fresh = scraped_table(scraped);
        let mut diff = ModelDiff::default();

        for (name, id) in &fresh {
            match self.models.get(name) {
                None => diff.added.push(name.clone()),
                Some(old) if old != id => {
                    diff.changed.push((name.clone(), old.clone(), id.clone()))
                }
                Some(_) => {}
            }
        }
        for name in self.models.keys() {
            if !fresh.contains_key(name) {
                diff.removed.push(name.clone());
            }
        }

        diff
    }

    /// Replace the table with scraped models and persist it when anything changed.
    pub fn apply_scraped(&mut self, scraped: &[Value]) -> Result<ModelDiff> {
        let diff = self.diff(scraped);
        for name in &diff.added {
            info!(model = %name, "Model added");
        }
        for name in &diff.removed {
            info!(model = %name, "Model removed");
        }
        for (name, old, new) in &diff.changed {
            info!(model = %name, old_id = %old, new_id = %new, "Model id changed");
        }

        if diff.is_empty() {
            info!("Model table unchanged");
            return Ok(diff);
        }

        self.models = scraped_table(scraped);
        if !self.path.as_os_str().is_empty() {
            let json = serde_json::to_string_pretty(&self.models)?;
            std::fs::write(&self.path, json)?;
            info!(
                "Saved {} models to {}",
                self.models.len(),
                self.path.display()
            );
        }
        Ok(diff)
    }
}

fn scraped_table(scraped: &[Value]) -> BTreeMap<String, String> {
    scraped
        .iter()
        .filter_map(|m| {
            let name = m.get("publicName")?.as_str()?;
            let id = m.get("id")?.as_str()?;
            Some((name.to_string(), id.to_string()))
        })
        .collect()
}

/// Extract the model list embedded in the chat page's streamed script payloads.
pub fn extract_models_from_html(html: &str) -> Option<Vec<Value>> {
    for script in SCRIPT_RE.captures_iter(html) {
        let body = &script[1];
        if !(body.contains("self.__next_f.push")
            && body.contains("initialState")
            && body.contains("publicName"))
        {
            continue;
        }

        let Some(push) = NEXT_PUSH_RE.captures(body) else {
            continue;
        };

        // The payload is `<id>:<json>` escaped inside a JS string; only the first line matters.
        let payload = push[1].split("\\n").next().unwrap_or_default();
        let Some(colon) = payload.find(':') else {
            continue;
        };
        let json = payload[colon + 1..].replace("\\\"", "\"");

        match serde_json::from_str::<Value>(&json) {
            Ok(data) => {
                if let Some(models) = find_initial_state(&data) {
                    info!("Extracted {} models from page script", models.len());
                    return Some(models.clone());
                }
            }
            Err(e) => {
                error!("Failed to parse embedded model JSON: {}", e);
            }
        }
    }

    error!("No script block with model data found in page HTML");
    None
}

fn find_initial_state(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "initialState" {
                    if let Some(list) = child.as_array() {
                        if list
                            .first()
                            .and_then(|first| first.get("publicName"))
                            .is_some()
                        {
                            return Some(list);
                        }
                    }
                }
                if let Some(found) = find_initial_state(child) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(find_initial_state),
        _ => None,
    }
}

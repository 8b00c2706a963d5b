//! Read-only view of the engine's processing state.
//!
//! The engine keeps `state.json` in its runtime directory with a per-connector
//! `last_processed` timestamp. Until one connector has processed something, a cycle
//! counts as a first run and gets the lookback window.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Default, Deserialize)]
struct ProcessingState {
    #[serde(default)]
    connectors: BTreeMap<String, ConnectorState>,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectorState {
    #[serde(default)]
    last_processed: Option<String>,
}

pub fn is_first_run(runtime_dir: &Path) -> bool {
    let path = runtime_dir.join(STATE_FILE);
    let state: ProcessingState = match std::fs::read_to_string(&path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
    {
        Some(s) => s,
        None => {
            debug!(path = %path.display(), "no usable processing state; treating as first run");
            return true;
        }
    };

    !state
        .connectors
        .values()
        .any(|c| c.last_processed.as_deref().is_some_and(|t| !t.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_broken_state_is_first_run() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_first_run(dir.path()));

        std::fs::write(dir.path().join(STATE_FILE), "not json").unwrap();
        assert!(is_first_run(dir.path()));
    }

    #[test]
    fn processed_connector_ends_first_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(STATE_FILE),
            r#"{"version": 1, "connectors": {"claude-code": {"last_processed": null, "conversations_processed": 0}}}"#,
        )
        .unwrap();
        assert!(is_first_run(dir.path()));

        std::fs::write(
            dir.path().join(STATE_FILE),
            r#"{"version": 1, "connectors": {"claude-code": {"last_processed": "2026-10-01T08:00:00"}}, "dreaming": {"total_runs": 3}}"#,
        )
        .unwrap();
        assert!(!is_first_run(dir.path()));
    }
}

//! Resolution documents on disk.
//!
//! The engine deposits one JSON document per dreaming run. Only the most recent
//! documents are surfaced, only pending actions are kept, and the document stays the
//! single source of truth for status.

use crate::model::{
    ActionContent, ActionKind, ActionStatus, Operation, ProposalAction, RawAction, RawDocument,
};
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DOCUMENT_EXTENSION: &str = "json";
pub const MAX_DOCUMENTS: usize = 10;
/// Path segment that marks a project-local config directory inside a `target`.
const LOCAL_CONFIG_MARKER: &str = "/.claude/";

/// Outcome of persisting a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    Written,
    /// Source document vanished, no longer parses, or no longer holds a matching action.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ResolutionStore {
    dir: PathBuf,
    max_documents: usize,
}

impl ResolutionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_documents: MAX_DOCUMENTS,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pending actions from the most recent documents, newest document first.
    pub fn load(&self) -> Vec<ProposalAction> {
        let mut actions = Vec::new();
        for (path, created) in self.recent_documents() {
            match parse_document(&path, created) {
                Ok(mut parsed) => actions.append(&mut parsed),
                Err(e) => warn!(path = %path.display(), error = %format!("{e:#}"), "skipping unreadable resolution document"),
            }
        }
        debug!(count = actions.len(), dir = %self.dir.display(), "loaded pending resolutions");
        actions
    }

    fn recent_documents(&self) -> Vec<(PathBuf, SystemTime)> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.dir.display(), error = %e, "resolution directory not readable");
                return Vec::new();
            }
        };

        let mut docs: Vec<(PathBuf, SystemTime)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|x| x.to_str()) == Some(DOCUMENT_EXTENSION))
            .filter_map(|p| {
                let meta = fs::metadata(&p).ok()?;
                if !meta.is_file() {
                    return None;
                }
                // Not every file system records birth time.
                let created = meta.created().or_else(|_| meta.modified()).ok()?;
                Some((p, created))
            })
            .collect();

        // Stable sort: equal timestamps keep directory order.
        docs.sort_by(|a, b| b.1.cmp(&a.1));
        docs.truncate(self.max_documents);
        docs
    }
}

/// Parse one document into its pending actions, in document order.
pub(crate) fn parse_document(path: &Path, created: SystemTime) -> Result<Vec<ProposalAction>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let doc: RawDocument =
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;

    let actions = doc
        .resolutions
        .into_iter()
        .flat_map(|group| group.actions)
        .filter_map(|raw| {
            let status = ActionStatus::parse(raw.status.as_deref())?;
            if status != ActionStatus::Pending {
                return None;
            }
            Some(into_action(raw, status, path, created))
        })
        .collect();
    Ok(actions)
}

fn into_action(raw: RawAction, status: ActionStatus, source: &Path, created: SystemTime) -> ProposalAction {
    let kind = ActionKind::parse(&raw.kind);
    let directories = derive_directories(&raw);
    ProposalAction {
        id: Uuid::new_v4(),
        name: record_name(raw.name.as_deref(), &raw.content),
        content: ActionContent::from_raw(&kind, &raw.content),
        kind,
        raw_kind: raw.kind,
        description: raw.description,
        rationale: raw.rationale,
        directories,
        is_local_change: raw.local_change,
        operation: raw.operation.as_deref().and_then(Operation::parse),
        issue_refs: raw.issue_refs,
        status,
        source: source.to_path_buf(),
        document_created: created,
    }
}

/// Action name, falling back to the content's `name` for records written without one.
fn record_name(name: Option<&str>, content: &Value) -> String {
    name.or_else(|| content.get("name").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

/// Project directories an action relates to, deduplicated and sorted.
pub(crate) fn derive_directories(raw: &RawAction) -> Vec<PathBuf> {
    let mut dirs: BTreeSet<String> = raw
        .references
        .iter()
        .filter_map(|r| r.working_directory.as_deref())
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect();

    if dirs.is_empty() {
        if let Some(wd) = raw
            .content
            .get("working_directory")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
        {
            dirs.insert(wd.to_string());
        }
    }

    if dirs.is_empty() && raw.local_change {
        let target = raw
            .target
            .as_deref()
            .or_else(|| raw.content.get("target").and_then(Value::as_str));
        if let Some(root) = target.and_then(project_root_from_target) {
            dirs.insert(root);
        }
    }

    dirs.into_iter().map(PathBuf::from).collect()
}

fn project_root_from_target(target: &str) -> Option<String> {
    let idx = target.find(LOCAL_CONFIG_MARKER)?;
    let root = &target[..idx];
    (!root.is_empty()).then(|| root.to_string())
}

/// Persist `status` for `action` into its source document.
///
/// The document is re-read from disk and the first action with the same name and raw
/// kind is updated. Anything that prevents a match is a silent skip, not an error.
pub fn write_status(action: &ProposalAction, status: ActionStatus) -> Result<StatusWrite> {
    let path = &action.source;
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            warn!(path = %path.display(), error = %e, action = %action.name, "source document gone; status not persisted");
            return Ok(StatusWrite::Skipped);
        }
    };
    let mut doc: Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %path.display(), error = %e, action = %action.name, "source document no longer parses; status not persisted");
            return Ok(StatusWrite::Skipped);
        }
    };

    let Some(record) = find_record(&mut doc, &action.name, &action.raw_kind) else {
        warn!(path = %path.display(), action = %action.name, kind = %action.raw_kind, "no matching action in source document; status not persisted");
        return Ok(StatusWrite::Skipped);
    };
    record.insert(
        "status".to_string(),
        Value::String(status.as_str().to_string()),
    );

    // serde_json maps are ordered by key, so output is stable across writes.
    let mut out = serde_json::to_string_pretty(&doc).context("serialize resolution document")?;
    out.push('\n');
    atomic_write(path, out.as_bytes())?;
    debug!(path = %path.display(), action = %action.name, status = status.as_str(), "status persisted");
    Ok(StatusWrite::Written)
}

fn find_record<'a>(
    doc: &'a mut Value,
    name: &str,
    raw_kind: &str,
) -> Option<&'a mut serde_json::Map<String, Value>> {
    doc.get_mut("resolutions")?
        .as_array_mut()?
        .iter_mut()
        .filter_map(|group| group.get_mut("actions").and_then(Value::as_array_mut))
        .flat_map(|actions| actions.iter_mut())
        .filter_map(Value::as_object_mut)
        .find(|obj| {
            let content = obj.get("content").cloned().unwrap_or(Value::Null);
            obj.get("type").and_then(Value::as_str) == Some(raw_kind)
                && record_name(obj.get("name").and_then(Value::as_str), &content) == name
        })
}

/// Write through a sibling temp file and rename so readers never see a partial document.
pub(crate) fn atomic_write(target: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let temp = target.with_extension("tmp");
    fs::write(&temp, content).with_context(|| format!("write {}", temp.display()))?;
    fs::rename(&temp, target).with_context(|| format!("rename into {}", target.display()))?;
    Ok(())
}

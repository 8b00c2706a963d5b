//! Materializing accepted resolutions.
//!
//! Skills are rendered to a single markdown file and overwritten on every apply.
//! Preferences are appended to the preferences file, so applying twice duplicates the
//! section. Either way the disposition is written back to the source document and the
//! action leaves the caller's pending list.

use crate::error::ApplyError;
use crate::model::{
    ActionContent, ActionStatus, ApplyTarget, PreferencesContent, ProposalAction, SkillContent,
};
use crate::store::{self, StatusWrite};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const NAMESPACE_DIR: &str = ".claude";
pub const SKILLS_DIR: &str = "skills";
pub const SKILL_FILE: &str = "SKILL.md";
pub const PREFERENCES_FILE: &str = "CLAUDE.md";

#[derive(Debug, Clone)]
pub struct ApplyConfig {
    /// Scope root for global artifacts, normally the user's home directory.
    pub global_root: PathBuf,
    pub namespace: String,
    pub preferences_filename: String,
}

impl ApplyConfig {
    pub fn for_home(home: &Path) -> Self {
        Self {
            global_root: home.to_path_buf(),
            namespace: NAMESPACE_DIR.to_string(),
            preferences_filename: PREFERENCES_FILE.to_string(),
        }
    }
}

/// What an apply did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub action: String,
    pub written: Vec<PathBuf>,
    pub status: StatusWrite,
    /// Unknown kind or empty payload: nothing was written but the action is marked applied.
    pub unresolved: bool,
}

#[derive(Debug, Clone)]
pub struct ApplicationEngine {
    config: ApplyConfig,
}

impl ApplicationEngine {
    pub fn new(config: ApplyConfig) -> Self {
        Self { config }
    }

    /// Apply the pending action `id` and drop it from `pending`.
    ///
    /// A write failure leaves the action pending and in the list.
    pub fn apply(
        &self,
        pending: &mut Vec<ProposalAction>,
        id: Uuid,
        target: &ApplyTarget,
    ) -> Result<ApplyReport, ApplyError> {
        let idx = position(pending, id)?;
        let action = &pending[idx];
        let written = self.materialize(action, target)?;
        let unresolved = !has_payload(&action.content);
        if unresolved {
            warn!(action = %action.name, kind = %action.raw_kind, "nothing to write for this resolution; marking applied without changes");
        }
        let status = persist(action, ActionStatus::Applied);
        let action = pending.remove(idx);
        info!(action = %action.name, files = written.len(), "resolution applied");

        Ok(ApplyReport {
            action: action.name,
            written,
            status,
            unresolved,
        })
    }

    /// Reject the pending action `id` and drop it from `pending`.
    pub fn dismiss(
        &self,
        pending: &mut Vec<ProposalAction>,
        id: Uuid,
    ) -> Result<StatusWrite, ApplyError> {
        let idx = position(pending, id)?;
        let status = persist(&pending[idx], ActionStatus::Rejected);
        let action = pending.remove(idx);
        info!(action = %action.name, "resolution dismissed");
        Ok(status)
    }

    /// Write the artifacts for `action` without touching its status.
    pub fn materialize(
        &self,
        action: &ProposalAction,
        target: &ApplyTarget,
    ) -> Result<Vec<PathBuf>, ApplyError> {
        let roots = self.scope_roots(target);
        let mut written = Vec::new();

        match &action.content {
            ActionContent::Skill(skill) => {
                let name = effective_name(skill, &action.name);
                let slug = skill_slug(name);
                if !is_valid_slug(&slug) {
                    return Err(ApplyError::InvalidSkillName {
                        action: action.name.clone(),
                        name: name.to_string(),
                    });
                }
                let body = render_skill(skill, &action.name);
                for root in &roots {
                    let path = self.skill_path(root, &slug);
                    store::atomic_write(&path, body.as_bytes())
                        .map_err(|e| io_error(action, &path, e))?;
                    debug!(path = %path.display(), "skill written");
                    written.push(path);
                }
            }
            ActionContent::Preferences(prefs) => {
                let text = render_preferences(prefs);
                if text.is_empty() {
                    debug!(action = %action.name, "preferences render empty; no file touched");
                    return Ok(written);
                }
                for root in &roots {
                    let path = self.preferences_path(root);
                    append_text(&path, &text).map_err(|source| ApplyError::Io {
                        action: action.name.clone(),
                        path: path.clone(),
                        source,
                    })?;
                    debug!(path = %path.display(), "preferences appended");
                    written.push(path);
                }
            }
            ActionContent::Unknown(_) => {}
        }

        Ok(written)
    }

    /// `None` entries mean the global scope.
    fn scope_roots(&self, target: &ApplyTarget) -> Vec<Option<PathBuf>> {
        match target {
            ApplyTarget::Directories(dirs) if !dirs.is_empty() => {
                dirs.iter().cloned().map(Some).collect()
            }
            _ => vec![None],
        }
    }

    pub fn skill_path(&self, root: &Option<PathBuf>, slug: &str) -> PathBuf {
        let base = root.as_deref().unwrap_or(&self.config.global_root);
        base.join(&self.config.namespace)
            .join(SKILLS_DIR)
            .join(slug)
            .join(SKILL_FILE)
    }

    pub fn preferences_path(&self, root: &Option<PathBuf>) -> PathBuf {
        match root {
            Some(dir) => dir.join(&self.config.preferences_filename),
            None => self
                .config
                .global_root
                .join(&self.config.namespace)
                .join(&self.config.preferences_filename),
        }
    }
}

/// Where an action goes when the user picks no scope: its own project directories for
/// local changes, the global scope otherwise.
pub fn default_target(action: &ProposalAction) -> ApplyTarget {
    if action.is_local_change && !action.directories.is_empty() {
        ApplyTarget::Directories(action.directories.clone())
    } else {
        ApplyTarget::Global
    }
}

fn position(pending: &[ProposalAction], id: Uuid) -> Result<usize, ApplyError> {
    pending
        .iter()
        .position(|a| a.id == id)
        .ok_or(ApplyError::UnknownAction(id))
}

fn persist(action: &ProposalAction, status: ActionStatus) -> StatusWrite {
    match store::write_status(action, status) {
        Ok(w) => w,
        Err(e) => {
            warn!(action = %action.name, error = %format!("{e:#}"), "failed to persist status");
            StatusWrite::Skipped
        }
    }
}

fn io_error(action: &ProposalAction, path: &Path, err: anyhow::Error) -> ApplyError {
    let source = match err.downcast::<std::io::Error>() {
        Ok(io) => io,
        Err(other) => std::io::Error::other(format!("{other:#}")),
    };
    ApplyError::Io {
        action: action.name.clone(),
        path: path.to_path_buf(),
        source,
    }
}

fn effective_name<'a>(skill: &'a SkillContent, fallback: &'a str) -> &'a str {
    let name = skill.name.trim();
    if name.is_empty() {
        fallback.trim()
    } else {
        name
    }
}

/// Whether applying `content` writes anything at all.
fn has_payload(content: &ActionContent) -> bool {
    match content {
        ActionContent::Skill(_) => true,
        ActionContent::Preferences(prefs) => !render_preferences(prefs).is_empty(),
        ActionContent::Unknown(_) => false,
    }
}

/// Lower-case, whitespace runs collapsed to `-`. Path separators become `-` so the slug
/// is always a single directory name.
pub fn skill_slug(name: &str) -> String {
    name.replace(['/', '\\'], "-")
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

fn is_valid_slug(slug: &str) -> bool {
    !matches!(slug, "" | "." | "..")
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim_end).filter(|s| !s.trim().is_empty())
}

fn has_headings(text: &str) -> bool {
    text.lines().any(|line| {
        let line = line.trim_start();
        line.starts_with("# ") || line.starts_with("##")
    })
}

pub fn render_skill(skill: &SkillContent, fallback_name: &str) -> String {
    let mut out = format!("# {}\n", effective_name(skill, fallback_name));

    if let Some(description) = non_empty(&skill.description) {
        out.push_str(&format!("\n{description}\n"));
    }
    if let Some(when) = non_empty(&skill.when_to_use) {
        out.push_str(&format!("\n## When to Use\n{when}\n"));
    }
    match non_empty(&skill.instructions) {
        Some(instructions) if has_headings(instructions) => {
            out.push_str(&format!("\n{instructions}\n"));
        }
        Some(instructions) => out.push_str(&format!("\n## Instructions\n{instructions}\n")),
        None => out.push_str("\n## Instructions\n"),
    }
    if let Some(examples) = non_empty(&skill.examples) {
        out.push_str(&format!("\n## Examples\n{examples}\n"));
    }
    out
}

pub fn render_preferences(prefs: &PreferencesContent) -> String {
    prefs
        .sections
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| {
            let mut block = format!("## {}\n", s.heading);
            for item in &s.items {
                block.push_str(&format!("- {item}\n"));
            }
            for text in &s.text {
                block.push_str(text.trim_end());
                block.push('\n');
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn append_text(path: &Path, text: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let existing = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return fs::write(path, text),
        Err(e) => return Err(e),
    };
    if existing.is_empty() {
        return fs::write(path, text);
    }

    let mut combined = existing;
    if !combined.ends_with('\n') {
        combined.push('\n');
    }
    combined.push('\n');
    combined.push_str(text);
    fs::write(path, combined)
}

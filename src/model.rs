use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::SystemTime;
use uuid::Uuid;

/// Persisted disposition of a single resolution action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Applied,
    Rejected,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Applied => "applied",
            ActionStatus::Rejected => "rejected",
        }
    }

    /// Missing status means pending; anything unrecognised is `None`.
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        match raw {
            None | Some("pending") => Some(ActionStatus::Pending),
            Some("applied") => Some(ActionStatus::Applied),
            Some("rejected") => Some(ActionStatus::Rejected),
            Some(_) => None,
        }
    }
}

/// Artifact-generation strategy an action requires when applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Skill,
    Preferences,
    Unknown(String),
}

impl ActionKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "skill" | "claude-skills" => ActionKind::Skill,
            "claude-md" | "preferences" => ActionKind::Preferences,
            other => ActionKind::Unknown(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            ActionKind::Skill => "skill",
            ActionKind::Preferences => "preferences",
            ActionKind::Unknown(raw) => raw,
        }
    }
}

/// Informational write hint from the engine. The applier always picks its own strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Append,
}

impl Operation {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "append" => Some(Operation::Append),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillContent {
    pub name: String,
    pub description: Option<String>,
    pub instructions: Option<String>,
    pub when_to_use: Option<String>,
    pub examples: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreferenceSection {
    pub heading: String,
    /// Rendered as `- item` bullets.
    pub items: Vec<String>,
    /// Free text, rendered verbatim after the bullets.
    pub text: Vec<String>,
}

impl PreferenceSection {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.text.iter().all(|t| t.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreferencesContent {
    pub sections: Vec<PreferenceSection>,
}

impl PreferencesContent {
    const DEFAULT_HEADING: &'static str = "General";
    /// Top-level keys that never become sections of their own. The last two route the
    /// action to a directory and are read by the store.
    const RESERVED_KEYS: [&'static str; 5] =
        ["preferences", "name", "description", "working_directory", "target"];

    /// Read `preferences: [{section, items}]`, with bare strings grouped under `General`.
    ///
    /// Every other top-level key is a section too: `code_style: [..]` becomes bullets under
    /// `Code Style`, a string value becomes that section's text.
    pub fn from_value(content: &Value) -> Self {
        let mut sections: Vec<PreferenceSection> = Vec::new();
        let entries = content
            .get("preferences")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for entry in entries {
            match entry {
                Value::Object(obj) => {
                    let heading = obj
                        .get("section")
                        .and_then(Value::as_str)
                        .filter(|s| !s.trim().is_empty())
                        .unwrap_or(Self::DEFAULT_HEADING);
                    let items = obj
                        .get("items")
                        .and_then(Value::as_array)
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    push_items(&mut sections, heading, items);
                }
                Value::String(item) => {
                    push_items(&mut sections, Self::DEFAULT_HEADING, vec![item.clone()]);
                }
                _ => {}
            }
        }

        if let Some(obj) = content.as_object() {
            for (key, value) in obj {
                if Self::RESERVED_KEYS.contains(&key.as_str()) {
                    continue;
                }
                let heading = section_heading(key);
                match value {
                    Value::Array(items) => {
                        let items = items
                            .iter()
                            .map(|item| match item {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .collect();
                        push_items(&mut sections, &heading, items);
                    }
                    Value::String(text) => {
                        section_mut(&mut sections, &heading).text.push(text.clone());
                    }
                    _ => {}
                }
            }
        }

        Self { sections }
    }
}

/// `code_style` -> `Code Style`.
fn section_heading(key: &str) -> String {
    key.replace('_', " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Sections with the same heading are merged, keeping first-seen order.
fn section_mut<'a>(sections: &'a mut Vec<PreferenceSection>, heading: &str) -> &'a mut PreferenceSection {
    let idx = match sections.iter().position(|s| s.heading == heading) {
        Some(idx) => idx,
        None => {
            sections.push(PreferenceSection {
                heading: heading.to_string(),
                items: Vec::new(),
                text: Vec::new(),
            });
            sections.len() - 1
        }
    };
    &mut sections[idx]
}

fn push_items(sections: &mut Vec<PreferenceSection>, heading: &str, items: Vec<String>) {
    section_mut(sections, heading).items.extend(items);
}

/// Kind-specific payload. Unknown kinds keep the opaque map so new kinds never break loading.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ActionContent {
    Skill(SkillContent),
    Preferences(PreferencesContent),
    Unknown(Map<String, Value>),
}

impl ActionContent {
    pub fn from_raw(kind: &ActionKind, content: &Value) -> Self {
        match kind {
            ActionKind::Skill => {
                ActionContent::Skill(serde_json::from_value(content.clone()).unwrap_or_default())
            }
            ActionKind::Preferences => {
                ActionContent::Preferences(PreferencesContent::from_value(content))
            }
            ActionKind::Unknown(_) => {
                ActionContent::Unknown(content.as_object().cloned().unwrap_or_default())
            }
        }
    }
}

/// A single resolution as presented to callers.
///
/// `id` is synthesized on every load and never persisted; write-back matches on
/// `name` + `raw_kind` against `source`.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalAction {
    pub id: Uuid,
    pub name: String,
    pub kind: ActionKind,
    /// The `type` string exactly as stored on disk.
    pub raw_kind: String,
    pub description: String,
    pub rationale: String,
    pub content: ActionContent,
    pub directories: Vec<PathBuf>,
    pub is_local_change: bool,
    pub operation: Option<Operation>,
    pub issue_refs: Vec<String>,
    pub status: ActionStatus,
    pub source: PathBuf,
    #[serde(skip)]
    pub document_created: SystemTime,
}

/// Where an accepted action should be materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyTarget {
    Directories(Vec<PathBuf>),
    Global,
}

// On-disk document shapes. Only what the core reads; the status write-back edits the
// raw JSON tree so unknown keys survive untouched.

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawDocument {
    #[serde(default)]
    pub resolutions: Vec<RawGroup>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawGroup {
    #[serde(default)]
    pub actions: Vec<RawAction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct RawAction {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub content: Value,
    pub references: Vec<RawReference>,
    pub rationale: String,
    pub issue_refs: Vec<String>,
    pub local_change: bool,
    pub operation: Option<String>,
    pub status: Option<String>,
    pub target: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct RawReference {
    pub working_directory: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_aliases() {
        assert_eq!(ActionKind::parse("skill"), ActionKind::Skill);
        assert_eq!(ActionKind::parse("claude-skills"), ActionKind::Skill);
        assert_eq!(ActionKind::parse("claude-md"), ActionKind::Preferences);
        assert_eq!(ActionKind::parse("preferences"), ActionKind::Preferences);
        assert_eq!(
            ActionKind::parse("hook"),
            ActionKind::Unknown("hook".to_string())
        );
    }

    #[test]
    fn status_defaults_to_pending() {
        assert_eq!(ActionStatus::parse(None), Some(ActionStatus::Pending));
        assert_eq!(ActionStatus::parse(Some("applied")), Some(ActionStatus::Applied));
        assert_eq!(ActionStatus::parse(Some("archived")), None);
    }

    #[test]
    fn preferences_group_bare_strings_under_general() {
        let content = json!({
            "preferences": [
                {"section": "Testing", "items": ["Use pytest", "Run with -x"]},
                "Prefer uv",
                {"items": ["No emojis"]},
                "Keep diffs small"
            ]
        });
        let prefs = PreferencesContent::from_value(&content);
        assert_eq!(prefs.sections.len(), 2);
        assert_eq!(prefs.sections[0].heading, "Testing");
        assert_eq!(prefs.sections[1].heading, "General");
        assert_eq!(
            prefs.sections[1].items,
            vec!["Prefer uv", "No emojis", "Keep diffs small"]
        );
    }

    #[test]
    fn keyed_sections_join_the_preferences_list() {
        let content = json!({
            "name": "Team style",
            "description": "not a section",
            "preferences": [{"section": "Code Style", "items": ["Use black"]}],
            "code_style": ["Prefer early returns", 3],
            "workflow_notes": "Squash before merging.",
            "working_directory": "/proj"
        });
        let prefs = PreferencesContent::from_value(&content);

        assert_eq!(prefs.sections.len(), 2);
        assert_eq!(prefs.sections[0].heading, "Code Style");
        assert_eq!(
            prefs.sections[0].items,
            vec!["Use black", "Prefer early returns", "3"]
        );
        assert_eq!(prefs.sections[1].heading, "Workflow Notes");
        assert!(prefs.sections[1].items.is_empty());
        assert_eq!(prefs.sections[1].text, vec!["Squash before merging."]);
    }

    #[test]
    fn section_headings_are_title_cased() {
        assert_eq!(section_heading("code_style"), "Code Style");
        assert_eq!(section_heading("API_usage"), "Api Usage");
    }

    #[test]
    fn unknown_kind_keeps_opaque_payload() {
        let content = json!({"event": "PreToolUse", "command": "lint"});
        let parsed = ActionContent::from_raw(&ActionKind::parse("hook"), &content);
        match parsed {
            ActionContent::Unknown(map) => assert_eq!(map.get("command"), Some(&json!("lint"))),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn malformed_skill_content_falls_back_to_defaults() {
        let parsed = ActionContent::from_raw(&ActionKind::Skill, &json!("just a string"));
        assert_eq!(parsed, ActionContent::Skill(SkillContent::default()));
    }
}

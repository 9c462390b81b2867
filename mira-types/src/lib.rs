// mira-types/src/lib.rs

//! Shared data contracts between the memory engine and its clients.
//!
//! These types are designed to work across native and WASM builds,
//! with no native-only dependencies allowed.

use serde::{Deserialize, Serialize};

/// The coding assistant a transcript folder was produced by.
///
/// `source_kind` is inferred per folder at parse time (see the parser) and
/// stored alongside every conversation so mixed corpora can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    #[default]
    AssistantA,
    AssistantB,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::AssistantA => "assistant-a",
            SourceKind::AssistantB => "assistant-b",
        }
    }
}

/// Maps a canonical filesystem path to a project's database identity.
///
/// This context is required for almost all operations (indexing, search);
/// it ensures data is scoped to the correct project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectContext {
    /// The persistent database ID for this project. Use this for all foreign keys.
    pub id: i64,
    /// The canonicalized absolute filesystem path to the project root.
    pub path: String,
    /// Human-readable display name, usually the directory name.
    pub name: Option<String>,
}

/// Speaker role on a message. `Model` is normalized to `Assistant` at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Model,
}

impl Role {
    /// Normalize `Model` to `Assistant`; all other roles pass through unchanged.
    pub fn normalized(self) -> Self {
        match self {
            Role::Model => Role::Assistant,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self.normalized() {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Model => unreachable!("normalized() maps Model to Assistant"),
        }
    }
}

/// Kind of a mistake record, in the extractor's tie-break priority order
/// (highest priority first): tool_error > wrong_approach > syntax_error >
/// misunderstanding > logic_error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MistakeKind {
    ToolError,
    WrongApproach,
    SyntaxError,
    Misunderstanding,
    LogicError,
}

impl MistakeKind {
    /// Lower value sorts first (higher severity/priority).
    pub fn priority(&self) -> u8 {
        match self {
            MistakeKind::ToolError => 0,
            MistakeKind::WrongApproach => 1,
            MistakeKind::SyntaxError => 2,
            MistakeKind::Misunderstanding => 3,
            MistakeKind::LogicError => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MistakeKind::ToolError => "tool_error",
            MistakeKind::WrongApproach => "wrong_approach",
            MistakeKind::SyntaxError => "syntax_error",
            MistakeKind::Misunderstanding => "misunderstanding",
            MistakeKind::LogicError => "logic_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_context_serialize() {
        let ctx = ProjectContext {
            id: 1,
            path: "/home/user/project".to_string(),
            name: Some("my-project".to_string()),
        };
        let json = serde_json::to_string(&ctx).unwrap();
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("/home/user/project"));
    }

    #[test]
    fn test_project_context_name_optional() {
        let json = r#"{"id": 1, "path": "/test"}"#;
        let ctx: ProjectContext = serde_json::from_str(json).unwrap();
        assert_eq!(ctx.name, None);
    }

    #[test]
    fn test_role_normalizes_model_to_assistant() {
        assert_eq!(Role::Model.normalized(), Role::Assistant);
        assert_eq!(Role::User.normalized(), Role::User);
    }

    #[test]
    fn test_mistake_kind_priority_ordering() {
        assert!(MistakeKind::ToolError.priority() < MistakeKind::WrongApproach.priority());
        assert!(MistakeKind::WrongApproach.priority() < MistakeKind::SyntaxError.priority());
        assert!(MistakeKind::SyntaxError.priority() < MistakeKind::Misunderstanding.priority());
        assert!(MistakeKind::Misunderstanding.priority() < MistakeKind::LogicError.priority());
    }
}

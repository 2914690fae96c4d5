use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse effect of a tool, used by the ordering and context checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClass {
    Read,
    Search,
    Create,
    Modify,
    Execute,
    Delegate,
    Other,
}

impl ToolClass {
    /// Create and modify tools produce code or content on disk.
    pub fn is_code_producing(self) -> bool {
        matches!(self, ToolClass::Create | ToolClass::Modify)
    }

    pub fn is_read(self) -> bool {
        matches!(self, ToolClass::Read | ToolClass::Search)
    }

    pub fn is_write_or_execute(self) -> bool {
        matches!(self, ToolClass::Create | ToolClass::Modify | ToolClass::Execute)
    }
}

fn default_read() -> Vec<String> {
    vec!["read".into()]
}

fn default_search() -> Vec<String> {
    vec!["grep".into(), "glob".into(), "list".into()]
}

fn default_create() -> Vec<String> {
    vec!["write".into()]
}

fn default_modify() -> Vec<String> {
    vec!["edit".into(), "patch".into(), "multiedit".into()]
}

fn default_execute() -> Vec<String> {
    vec!["bash".into(), "shell".into()]
}

fn default_delegate() -> Vec<String> {
    vec!["task".into()]
}

/// Maps runtime tool names onto [`ToolClass`]es.
///
/// Names are compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCatalog {
    #[serde(default = "default_read")]
    pub read: Vec<String>,
    #[serde(default = "default_search")]
    pub search: Vec<String>,
    #[serde(default = "default_create")]
    pub create: Vec<String>,
    #[serde(default = "default_modify")]
    pub modify: Vec<String>,
    #[serde(default = "default_execute")]
    pub execute: Vec<String>,
    #[serde(default = "default_delegate")]
    pub delegate: Vec<String>,
    /// Tools that always need approval, whatever the runtime flags on the event.
    #[serde(default)]
    pub approval_required: Vec<String>,
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self {
            read: default_read(),
            search: default_search(),
            create: default_create(),
            modify: default_modify(),
            execute: default_execute(),
            delegate: default_delegate(),
            approval_required: Vec::new(),
        }
    }
}

fn contains_name(list: &[String], name: &str) -> bool {
    list.iter().any(|candidate| candidate.eq_ignore_ascii_case(name))
}

impl ToolCatalog {
    pub fn classify(&self, tool: &str) -> ToolClass {
        if contains_name(&self.read, tool) {
            ToolClass::Read
        } else if contains_name(&self.search, tool) {
            ToolClass::Search
        } else if contains_name(&self.create, tool) {
            ToolClass::Create
        } else if contains_name(&self.modify, tool) {
            ToolClass::Modify
        } else if contains_name(&self.execute, tool) {
            ToolClass::Execute
        } else if contains_name(&self.delegate, tool) {
            ToolClass::Delegate
        } else {
            ToolClass::Other
        }
    }

    pub fn requires_approval(&self, tool: &str) -> bool {
        contains_name(&self.approval_required, tool)
    }
}

const PATH_KEYS: [&str; 4] = ["filePath", "file_path", "path", "file"];

/// File path a tool call operates on, if its arguments name one.
pub fn target_path(arguments: &Value) -> Option<&str> {
    let object = arguments.as_object()?;
    PATH_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .filter(|path| !path.trim().is_empty())
}

/// Shell command string of an execute-class call.
pub fn shell_command(arguments: &Value) -> Option<&str> {
    match arguments {
        Value::String(command) => Some(command.as_str()),
        Value::Object(object) => object
            .get("command")
            .or_else(|| object.get("cmd"))
            .and_then(Value::as_str),
        _ => None,
    }
}

/// Normalizes separators and leading `./` so paths compare the same way
/// regardless of platform.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    unified.trim_start_matches("./").to_string()
}

/// `true` when `fragment` is a substring or suffix of `path`.
pub fn path_matches(path: &str, fragment: &str) -> bool {
    let path = normalize_path(path).to_lowercase();
    let fragment = normalize_path(fragment).to_lowercase();
    if fragment.is_empty() {
        return false;
    }
    path.contains(&fragment) || path.ends_with(&fragment)
}

/// A shell invocation that has a dedicated tool doing the same thing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellAntipattern {
    pub command: String,
    pub dedicated_tool: &'static str,
}

struct AntipatternRule {
    pattern: Regex,
    dedicated_tool: &'static str,
}

static ANTIPATTERN_RULES: Lazy<Vec<AntipatternRule>> = Lazy::new(|| {
    let rule = |pattern: &str, dedicated_tool| AntipatternRule {
        pattern: Regex::new(pattern).unwrap(),
        dedicated_tool,
    };
    vec![
        rule(r"^(?:sudo\s+)?sed\s+(?:-[A-Za-z]*\s+)*-i", "edit"),
        rule(r"^(?:sudo\s+)?cat\s*<<", "write"),
        rule(r"^(?:sudo\s+)?(?:echo|printf)\b.*[^<>&]>{1,2}\s*\S", "write"),
        rule(r"^(?:sudo\s+)?tee\b", "write"),
        rule(r"^(?:sudo\s+)?(?:cat|head|tail|less|more|bat)\b", "read"),
        rule(r"^(?:sudo\s+)?(?:grep|egrep|fgrep|rg|ag|ack)\b", "grep"),
        rule(r"^(?:sudo\s+)?(?:find|fd)\b", "glob"),
        rule(r"^(?:sudo\s+)?(?:ls|tree)\b", "list"),
    ]
});

static COMMAND_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"&&|\|\||;|\n").unwrap());

/// Finds shell segments that should have used a dedicated tool.
///
/// Commands are split on `&&`, `||`, `;` and newlines; within a pipeline only
/// the first stage is inspected.
pub fn detect_shell_antipatterns(command: &str) -> Vec<ShellAntipattern> {
    COMMAND_SEPARATOR
        .split(command)
        .filter_map(|segment| {
            let stage = segment.split('|').next().unwrap_or_default().trim();
            if stage.is_empty() {
                return None;
            }
            ANTIPATTERN_RULES
                .iter()
                .find(|rule| rule.pattern.is_match(stage))
                .map(|rule| ShellAntipattern {
                    command: stage.to_string(),
                    dedicated_tool: rule.dedicated_tool,
                })
        })
        .collect()
}

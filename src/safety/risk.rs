//! Risk classification for tool invocations.
//!
//! Classification is a keyword heuristic over the tool name, driven by a
//! fixed rule table. It is an approximation: tool vocabularies it has never
//! seen fall through to [`ActionType::Unknown`] and need table updates.
//! Everything here is pure, so identical inputs always assess identically.

use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Risk level of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Get numeric value for comparison.
    fn value(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }
}

impl Ord for RiskLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value().cmp(&other.value())
    }
}

impl PartialOrd for RiskLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Coarse category of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    FileRead,
    FileWrite,
    FileCreate,
    FileDelete,
    DirectoryDelete,
    FileRename,
    FileMove,
    FileCopy,
    PackageInstall,
    PackageUninstall,
    CommandExecute,
    SystemCommand,
    Unknown,
}

impl ActionType {
    /// Base risk before argument checks.
    pub fn base_level(&self) -> RiskLevel {
        match self {
            Self::FileRead => RiskLevel::Low,
            Self::FileWrite
            | Self::FileCreate
            | Self::FileRename
            | Self::FileMove
            | Self::FileCopy => RiskLevel::Medium,
            Self::FileDelete
            | Self::DirectoryDelete
            | Self::PackageInstall
            | Self::PackageUninstall
            | Self::CommandExecute => RiskLevel::High,
            Self::SystemCommand => RiskLevel::Critical,
            Self::Unknown => RiskLevel::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::FileCreate => "file_create",
            Self::FileDelete => "file_delete",
            Self::DirectoryDelete => "directory_delete",
            Self::FileRename => "file_rename",
            Self::FileMove => "file_move",
            Self::FileCopy => "file_copy",
            Self::PackageInstall => "package_install",
            Self::PackageUninstall => "package_uninstall",
            Self::CommandExecute => "command_execute",
            Self::SystemCommand => "system_command",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of assessing one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub action_type: ActionType,
    pub level: RiskLevel,
    pub warnings: Vec<String>,
}

impl RiskAssessment {
    pub fn requires_confirmation(&self) -> bool {
        self.level != RiskLevel::Low
    }

    fn escalate(&mut self, to: RiskLevel, warning: String) {
        self.level = self.level.max(to);
        self.warnings.push(warning);
    }
}

/// Name tokens per action type, checked in order; first hit wins.
///
/// Tokens match whole words only. Destructive categories come first so a
/// name like `read_and_delete` lands on the riskier side.
const CLASSIFICATION_RULES: &[(ActionType, &[&str])] = &[
    (
        ActionType::SystemCommand,
        &["sudo", "reboot", "shutdown", "poweroff", "systemctl"],
    ),
    (
        ActionType::FileDelete,
        &["delete", "deletes", "remove", "removes", "rm", "unlink", "erase", "purge"],
    ),
    (ActionType::PackageUninstall, &["uninstall", "uninstalls"]),
    (ActionType::PackageInstall, &["install", "installs"]),
    (
        ActionType::CommandExecute,
        &[
            "exec", "execute", "run", "runs", "shell", "bash", "sh", "command", "cmd",
            "terminal", "spawn",
        ],
    ),
    (ActionType::FileRename, &["rename"]),
    (ActionType::FileMove, &["move", "mv"]),
    (ActionType::FileCopy, &["copy", "cp", "duplicate"]),
    (ActionType::FileCreate, &["create", "mkdir", "touch", "new"]),
    (
        ActionType::FileWrite,
        &["write", "save", "update", "edit", "append", "put", "patch", "set"],
    ),
    (ActionType::FileRead, READ_VERBS),
];

/// A name that starts with one of these reads, unless a destructive
/// token appears later in it.
const READ_VERBS: &[&str] = &[
    "read", "get", "list", "search", "find", "view", "fetch", "cat", "stat", "show", "query",
    "describe", "lookup", "check",
];

/// Qualifies a name as a system command when no read verb leads it.
const SYSTEM_NOUNS: &[&str] = &["system"];

/// Name tokens that make a delete a directory delete.
const DIRECTORY_KEYWORDS: &[&str] = &["dir", "directory", "folder", "tree", "rmdir"];

/// Package managers named in install/uninstall warnings.
const PACKAGE_MANAGERS: &[&str] = &["npm", "pip", "cargo", "apt", "brew", "yarn", "pnpm", "gem"];

/// Substrings that force CRITICAL wherever they appear in the arguments.
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r /",
    "rmdir /s",
    "del /f",
    "del /s",
    "format c:",
    "mkfs",
    "dd if=",
    ":(){",
    "> /dev/sd",
    "chmod -r 777",
    "chmod 777",
    "chown -r",
    "kill -9",
    "killall",
    "pkill",
    "shutdown",
    "reboot",
    "drop table",
    "drop database",
    "truncate table",
    "delete from",
    "curl | sh",
    "wget | sh",
];

/// Argument names checked for filesystem paths.
const PATH_ARGUMENTS: &[&str] = &[
    "path",
    "file",
    "file_path",
    "filePath",
    "filename",
    "dir",
    "directory",
    "target",
    "destination",
    "dest",
    "source",
    "src",
    "cwd",
    "working_dir",
];

/// Paths the agent must never touch without CRITICAL review.
const PROTECTED_PATHS: &[&str] = &[
    "/etc", "/bin", "/sbin", "/usr", "/boot", "/sys", "/proc", "/dev", "/lib", "/lib64",
    "/var/lib", "/root", "/System", "/Library", "c:\\windows", "c:\\program files",
];

static DANGEROUS_MATCHER: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostLongest)
        .build(DANGEROUS_PATTERNS)
        .unwrap_or_else(|e| panic!("dangerous pattern table is invalid: {e}"))
});

/// The risk gate. Stateless; cheap to copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskGate;

impl RiskGate {
    pub fn new() -> Self {
        Self
    }

    /// Sort a tool invocation into an action type.
    pub fn classify(&self, tool_name: &str, args: &Value) -> ActionType {
        let tokens = tokenize(tool_name);
        let has = |keywords: &[&str]| tokens.iter().any(|t| keywords.contains(&t.as_str()));
        let leads_with_read = tokens
            .first()
            .is_some_and(|t| READ_VERBS.contains(&t.as_str()));

        let action = if leads_with_read {
            CLASSIFICATION_RULES
                .iter()
                .filter(|(action, _)| action.base_level() >= RiskLevel::High)
                .find(|(_, keywords)| has(keywords))
                .map_or(ActionType::FileRead, |(action, _)| *action)
        } else if has(SYSTEM_NOUNS) {
            ActionType::SystemCommand
        } else {
            CLASSIFICATION_RULES
                .iter()
                .find(|(_, keywords)| has(keywords))
                .map_or(ActionType::Unknown, |(action, _)| *action)
        };

        if action == ActionType::FileDelete
            && (has(DIRECTORY_KEYWORDS) || flag_set(args, "recursive") || targets_directory(args))
        {
            return ActionType::DirectoryDelete;
        }
        action
    }

    /// Assess an already classified action against its arguments.
    ///
    /// Each check may raise the level, never lower it.
    pub fn assess(&self, action_type: ActionType, tool_name: &str, args: &Value) -> RiskAssessment {
        let mut assessment = RiskAssessment {
            action_type,
            level: action_type.base_level(),
            warnings: Vec::new(),
        };

        if matches!(
            action_type,
            ActionType::PackageInstall | ActionType::PackageUninstall
        ) {
            let tokens = tokenize(tool_name);
            if let Some(manager) = PACKAGE_MANAGERS
                .iter()
                .find(|m| tokens.iter().any(|t| t == *m))
            {
                assessment
                    .warnings
                    .push(format!("Modifies packages via {manager}"));
            }
        }

        let text = argument_text(args);
        let mut seen: Vec<&str> = Vec::new();
        for m in DANGEROUS_MATCHER.find_iter(&text) {
            let pattern = DANGEROUS_PATTERNS[m.pattern().as_usize()];
            if !seen.contains(&pattern) {
                seen.push(pattern);
                assessment.escalate(
                    RiskLevel::Critical,
                    format!("Arguments contain dangerous command '{pattern}'"),
                );
            }
        }

        for (name, path) in path_arguments(args) {
            if let Some(protected) = protected_prefix(path) {
                assessment.escalate(
                    RiskLevel::Critical,
                    format!("Argument '{name}' targets protected system path {protected}"),
                );
            }
        }

        if assessment.level == RiskLevel::Medium {
            for flag in ["recursive", "force"] {
                if flag_set(args, flag) {
                    assessment.escalate(
                        RiskLevel::High,
                        format!("'{flag}' flag widens the effect of this action"),
                    );
                }
            }
        }

        assessment
    }

    /// Classify and assess in one step.
    pub fn evaluate(&self, tool_name: &str, args: &Value) -> RiskAssessment {
        let action_type = self.classify(tool_name, args);
        self.assess(action_type, tool_name, args)
    }

    /// Whether a human must approve this call first.
    pub fn requires_confirmation(&self, tool_name: &str, args: &Value) -> bool {
        self.evaluate(tool_name, args).requires_confirmation()
    }
}

/// Split a tool name into lowercase words on separators and camelCase.
fn tokenize(name: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_ascii_uppercase() && prev_lower && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn flag_set(args: &Value, flag: &str) -> bool {
    match args.get(flag) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

fn targets_directory(args: &Value) -> bool {
    path_arguments(args).any(|(_, p)| p.ends_with('/') || p.ends_with('\\'))
}

fn path_arguments(args: &Value) -> impl Iterator<Item = (&'static str, &str)> {
    PATH_ARGUMENTS
        .iter()
        .filter_map(move |name| args.get(*name).and_then(Value::as_str).map(|p| (*name, p)))
}

fn protected_prefix(path: &str) -> Option<&'static str> {
    let lowered = path.trim().to_ascii_lowercase();
    PROTECTED_PATHS.iter().copied().find(|prefix| {
        let prefix_lower = prefix.to_ascii_lowercase();
        lowered == prefix_lower
            || lowered
                .strip_prefix(&prefix_lower)
                .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('\\'))
    })
}

/// Flatten every string in the arguments into one searchable text.
fn argument_text(args: &Value) -> String {
    fn collect(value: &Value, out: &mut String) {
        match value {
            Value::String(s) => {
                out.push_str(s);
                out.push('\n');
            }
            Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
            Value::Object(map) => map.values().for_each(|v| collect(v, out)),
            _ => {}
        }
    }
    let mut out = String::new();
    collect(args, &mut out);
    out
}

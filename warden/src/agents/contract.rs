//! Parser for declarative agent contract files.
//!
//! A contract is a human-readable document with labeled ALL-CAPS sections.
//! The parser recognizes the `AGENT:` name line, the `CLASS:` permission
//! line, `Allowed:`/`Disallowed:` path lists inside `SCOPE / PERMISSIONS`,
//! the `INPUT` field list, the fenced JSON skeleton in `OUTPUT`, and the
//! optional `STOP CONDITIONS` list. Unknown sections are ignored; optional
//! parenthesized suffixes on headers (e.g. `(HARD)`) are ignored.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::core::permissions::PermissionSet;
use crate::core::schema::OutputSchema;
use crate::core::types::AgentClass;

/// One declared input field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputField {
    pub name: String,
    pub required: bool,
}

/// Immutable contract definition for one agent.
///
/// Created at registry load, never mutated, dropped on registry refresh.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub class: AgentClass,
    pub role: String,
    pub goal: String,
    pub prompt: String,
    pub inputs: Vec<InputField>,
    pub output_schema: OutputSchema,
    pub stop_conditions: Vec<String>,
    pub permissions: PermissionSet,
    pub source_file: String,
    pub content_hash: String,
}

impl AgentDefinition {
    /// True iff this agent may write to `target` within `repo_root`.
    pub fn allows_write_to(&self, repo_root: &Path, target: &Path) -> bool {
        self.permissions.allows_write_to(repo_root, target)
    }

    /// Names of inputs the contract marks required.
    pub fn required_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
    }
}

/// Load and parse one contract file.
pub fn parse_contract(path: &Path) -> Result<AgentDefinition> {
    let source =
        fs::read_to_string(path).with_context(|| format!("read contract {}", path.display()))?;
    parse_contract_source(&source, path)
}

/// Parse contract text. `path` is used for error reporting and provenance.
pub fn parse_contract_source(source: &str, path: &Path) -> Result<AgentDefinition> {
    let fail = |section: &str, detail: String| {
        anyhow!(
            "contract {}: section {section}: {detail}",
            path.display()
        )
    };

    let name = parse_labeled_line(source, "AGENT")
        .ok_or_else(|| fail("AGENT", "missing 'AGENT: <name>' line".to_string()))?;
    let class_label = parse_labeled_line(source, "CLASS")
        .ok_or_else(|| fail("CLASS", "missing 'CLASS: <class>' line".to_string()))?;
    let class = AgentClass::parse(&class_label)
        .ok_or_else(|| fail("CLASS", format!("unknown permission class '{class_label}'")))?;

    let role = extract_section(source, "ROLE")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| fail("ROLE", "missing or empty".to_string()))?;
    let goal = extract_section(source, "GOAL")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| fail("GOAL", "missing or empty".to_string()))?;

    let scope = extract_section(source, "SCOPE / PERMISSIONS")
        .ok_or_else(|| fail("SCOPE / PERMISSIONS", "missing".to_string()))?;
    let permissions = PermissionSet::for_class(class).overlay(
        parse_path_list(&scope, "Allowed:"),
        parse_path_list(&scope, "Disallowed:"),
    );

    let input_section = extract_section(source, "INPUT")
        .ok_or_else(|| fail("INPUT", "missing".to_string()))?;
    let inputs = parse_input_fields(&input_section);

    let output_section = extract_section(source, "OUTPUT")
        .ok_or_else(|| fail("OUTPUT", "missing".to_string()))?;
    let skeleton_text = extract_fenced_json(&output_section)
        .ok_or_else(|| fail("OUTPUT", "missing fenced JSON skeleton".to_string()))?;
    let skeleton = serde_json::from_str(&skeleton_text)
        .map_err(|err| fail("OUTPUT", format!("invalid JSON skeleton: {err}")))?;
    let output_schema = OutputSchema::from_skeleton(skeleton)
        .map_err(|err| fail("OUTPUT", err.to_string()))?;

    let stop_conditions = extract_section(source, "STOP CONDITIONS")
        .map(|s| parse_list_items(&s))
        .unwrap_or_default();

    let digest = Sha256::digest(source.as_bytes());
    let content_hash = hex::encode(&digest[..8]);

    Ok(AgentDefinition {
        name,
        class,
        role,
        goal,
        prompt: source.to_string(),
        inputs,
        output_schema,
        stop_conditions,
        permissions,
        source_file: path.display().to_string(),
        content_hash,
    })
}

static HEADER_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z][A-Z0-9 /_]{2,}\s*(\([^)]*\))?\s*$|^[A-Z][A-Z0-9_]{2,}:.*$")
        .expect("header line pattern should be valid")
});

/// Extract the body of an ALL-CAPS section, up to the next section header.
fn extract_section(source: &str, header: &str) -> Option<String> {
    let header_pattern = format!(r"^{}(\s*\([^)]*\))?\s*$", regex::escape(header));
    let header_re = Regex::new(&header_pattern).expect("section header pattern should be valid");

    let mut lines = source.lines();
    lines.find(|line| header_re.is_match(line.trim_end()))?;

    let mut body = Vec::new();
    for line in lines {
        if HEADER_LINE_RE.is_match(line.trim_end()) {
            break;
        }
        body.push(line);
    }
    Some(body.join("\n").trim().to_string())
}

/// Extract `LABEL: value` from a single line.
fn parse_labeled_line(source: &str, label: &str) -> Option<String> {
    let pattern = format!(r"(?m)^{}:\s*(\S.*?)\s*$", regex::escape(label));
    let re = Regex::new(&pattern).expect("label pattern should be valid");
    re.captures(source).map(|caps| caps[1].to_string())
}

/// Parse a `Label:` sub-list of `- path` items inside a section body.
///
/// Returns `None` when the label is absent, so class defaults apply.
fn parse_path_list(section: &str, label: &str) -> Option<Vec<String>> {
    let mut lines = section.lines();
    lines.find(|line| line.trim() == label)?;
    let mut paths = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if let Some(item) = trimmed.strip_prefix('-') {
            let path = item.trim().trim_matches('`').to_string();
            if !path.is_empty() {
                paths.push(path);
            }
        } else if !trimmed.is_empty() {
            break;
        }
    }
    Some(paths)
}

static INPUT_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-\s*([A-Za-z_][A-Za-z0-9_]*)\s*(\(required\))?\s*$")
        .expect("input field pattern should be valid")
});

fn parse_input_fields(section: &str) -> Vec<InputField> {
    section
        .lines()
        .filter_map(|line| {
            let caps = INPUT_FIELD_RE.captures(line.trim())?;
            Some(InputField {
                name: caps[1].to_string(),
                required: caps.get(2).is_some(),
            })
        })
        .collect()
}

fn parse_list_items(section: &str) -> Vec<String> {
    section
        .lines()
        .filter_map(|line| {
            let item = line.trim().strip_prefix('-')?.trim();
            (!item.is_empty()).then(|| item.to_string())
        })
        .collect()
}

/// Extract the first fenced JSON block (``` or ```json).
fn extract_fenced_json(section: &str) -> Option<String> {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)```(?:json)?\s*\n(\{.*?\})\s*```")
            .expect("fence pattern should be valid")
    });
    FENCE_RE
        .captures(section)
        .map(|caps| caps[1].to_string())
}

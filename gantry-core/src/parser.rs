//! Parsing of raw agent stdout into a structured outcome.
//!
//! Every function here is pure and total: any input string yields a
//! well-formed result and nothing panics. Callers decide what to do with
//! partial information (a missing PR URL on a "successful" run is the
//! worker's problem, not the parser's).

use std::sync::OnceLock;

use regex::Regex;

/// Everything extracted from one agent run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedOutput {
    pub success: bool,
    pub pull_request_url: Option<String>,
    pub commit_hash: Option<String>,
    pub modified_files: Vec<String>,
    pub commands: Vec<ParsedCommand>,
}

/// One shell command echoed by the agent, with its captured output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: String,
    pub output: String,
    /// Inferred: 1 when the output carries error markers, otherwise 0.
    pub exit_code: i32,
}

/// Words that mark a run (or a command's output) as failed. Checked before
/// success keywords; failure always wins.
const FAILURE_KEYWORDS: &[&str] = &["error", "failed", "failure", "fatal", "exception", "panic"];

const SUCCESS_KEYWORDS: &[&str] = &[
    "success",
    "successfully",
    "completed",
    "done",
    "merged",
    "pull request created",
    "created pull request",
];

fn pr_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"https?://[A-Za-z0-9.\-]+(?::\d+)?/[A-Za-z0-9_.\-]+/[A-Za-z0-9_.\-]+/pull/\d+")
            .expect("pr url regex")
    })
}

fn commit_hash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[0-9a-f]{40}\b").expect("commit hash regex"))
}

fn diff_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^diff --git a/(\S+) b/(\S+)").expect("diff header regex"))
}

fn path_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // A bare relative path with an extension, e.g. `src/lib.rs`.
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-][A-Za-z0-9_\-./]*/[A-Za-z0-9_\-./]+\.[A-Za-z0-9]+$").expect("path regex"))
}

/// Parse a full agent run in one pass.
pub fn parse_output(raw: &str) -> ParsedOutput {
    ParsedOutput {
        success: is_success(raw),
        pull_request_url: extract_pull_request_url(raw),
        commit_hash: extract_commit_hash(raw),
        modified_files: extract_modified_files(raw),
        commands: extract_commands(raw),
    }
}

/// First canonical pull-request URL in the output.
pub fn extract_pull_request_url(raw: &str) -> Option<String> {
    pr_url_re()
        .find(raw)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ')']).to_string())
}

/// First 40-hex token with word boundaries.
pub fn extract_commit_hash(raw: &str) -> Option<String> {
    commit_hash_re().find(raw).map(|m| m.as_str().to_string())
}

/// Parse shell-echoed command blocks.
///
/// A line starting `$ ` opens a command; subsequent lines are its output
/// until the next `$ ` line or end of input.
pub fn extract_commands(raw: &str) -> Vec<ParsedCommand> {
    let mut commands = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in raw.lines() {
        if let Some(cmd) = line.strip_prefix("$ ") {
            if let Some((command, output)) = current.take() {
                commands.push(finish_command(command, &output));
            }
            current = Some((cmd.to_string(), Vec::new()));
        } else if let Some((_, output)) = current.as_mut() {
            output.push(line);
        }
    }
    if let Some((command, output)) = current.take() {
        commands.push(finish_command(command, &output));
    }
    commands
}

fn finish_command(command: String, output_lines: &[&str]) -> ParsedCommand {
    let output = output_lines.join("\n");
    let exit_code = if contains_any(&output, FAILURE_KEYWORDS) { 1 } else { 0 };
    ParsedCommand {
        command,
        output,
        exit_code,
    }
}

/// Union of modified-file paths found in status markers, diff headers, and
/// standalone path lines. Order of first appearance, deduplicated.
pub fn extract_modified_files(raw: &str) -> Vec<String> {
    let mut files = Vec::new();
    let mut push = |path: &str| {
        let path = path.trim();
        if !path.is_empty() && path != "/dev/null" && !files.iter().any(|f| f == path) {
            files.push(path.to_string());
        }
    };

    for line in raw.lines() {
        let trimmed = line.trim();

        for marker in ["new file:", "modified:", "deleted:", "renamed:"] {
            if let Some(rest) = trimmed.strip_prefix(marker) {
                // `renamed: old -> new` keeps the new path.
                let path = rest.rsplit("->").next().unwrap_or(rest);
                push(path);
            }
        }

        if let Some(caps) = diff_header_re().captures(trimmed) {
            push(&caps[1]);
            push(&caps[2]);
        } else if path_line_re().is_match(trimmed) {
            push(trimmed);
        }
    }
    files
}

/// Success inference over the whole output.
///
/// Failure keywords override success keywords; with neither present the run
/// counts as a success, so empty output is a success by contract.
pub fn is_success(raw: &str) -> bool {
    if contains_any(raw, FAILURE_KEYWORDS) {
        return false;
    }
    if contains_any(raw, SUCCESS_KEYWORDS) {
        return true;
    }
    true
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let lowered = haystack.to_lowercase();
    needles.iter().any(|needle| lowered.contains(needle))
}

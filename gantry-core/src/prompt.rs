//! Prompt assembly for each worker action.
//!
//! Prompts are built from sections. When the rendered prompt would exceed
//! the context budget, the largest sections are spilled into files under a
//! workspace-local context directory and replaced with `@<path>` references
//! the agent can follow; an index file lists what was spilled.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::model::{ReviewComment, Task, WorkerAction, WorkspaceInfo};
use crate::workspace::{extract_requirements, INSTRUCTION_FILE_NAME};

/// Directory (relative to the workspace) that holds spilled prompt sections.
pub const CONTEXT_DIR: &str = ".gantry/context";
const CONTEXT_INDEX: &str = "INDEX.md";

pub struct PromptBuilder {
    max_context_length: usize,
}

struct Section {
    slug: &'static str,
    heading: &'static str,
    content: String,
    /// Short sections and instructions stay inline no matter what.
    spillable: bool,
}

impl PromptBuilder {
    pub fn new(max_context_length: usize) -> Self {
        Self { max_context_length }
    }

    /// Build the prompt for `task`, spilling oversized sections into the
    /// workspace context directory when the budget is exceeded.
    pub fn build(
        &self,
        task: &Task,
        workspace: &WorkspaceInfo,
        progress: Option<&str>,
    ) -> Result<String> {
        let mut sections = self.sections_for(task, workspace, progress);
        let prompt = render(&sections);
        if prompt.len() <= self.max_context_length {
            return Ok(prompt);
        }

        let context_dir = workspace.workspace_dir.join(CONTEXT_DIR);
        fs::create_dir_all(&context_dir)
            .with_context(|| format!("creating context dir {}", context_dir.display()))?;
        let chunk_limit = (self.max_context_length * 8 / 10).max(1);

        let mut index = String::from("# Prompt context\n\n");
        // Spill the largest spillable sections first until the prompt fits.
        loop {
            let rendered = render(&sections);
            if rendered.len() <= self.max_context_length {
                break;
            }
            let Some(section) = sections
                .iter_mut()
                .filter(|s| s.spillable)
                .max_by_key(|s| s.content.len())
            else {
                break;
            };

            let mut references = Vec::new();
            for (i, chunk) in split_section(&section.content, chunk_limit).iter().enumerate() {
                let file_name = format!("{}-{}.md", section.slug, i + 1);
                fs::write(context_dir.join(&file_name), chunk)
                    .with_context(|| format!("writing context file {file_name}"))?;
                index.push_str(&format!("- {file_name}: {}\n", section.heading));
                references.push(format!("@{CONTEXT_DIR}/{file_name}"));
            }
            section.content = references.join("\n");
            section.spillable = false;
        }
        fs::write(context_dir.join(CONTEXT_INDEX), index)?;

        Ok(render(&sections))
    }

    fn sections_for(
        &self,
        task: &Task,
        workspace: &WorkspaceInfo,
        progress: Option<&str>,
    ) -> Vec<Section> {
        let mut sections = Vec::new();

        match task.action {
            WorkerAction::StartNewTask | WorkerAction::ResumeTask => {
                let title = task
                    .board_item
                    .as_ref()
                    .map(|i| i.title.clone())
                    .unwrap_or_else(|| format!("Task {}", task.task_id));
                sections.push(Section {
                    slug: "task",
                    heading: "Task",
                    content: title,
                    spillable: false,
                });

                if let Some(item) = &task.board_item {
                    if !item.description.is_empty() {
                        sections.push(Section {
                            slug: "details",
                            heading: "Details",
                            content: item.description.clone(),
                            spillable: true,
                        });
                        let requirements = extract_requirements(&item.description);
                        if !requirements.is_empty() {
                            sections.push(Section {
                                slug: "requirements",
                                heading: "Requirements",
                                content: requirements
                                    .iter()
                                    .map(|r| format!("- {r}"))
                                    .collect::<Vec<_>>()
                                    .join("\n"),
                                spillable: true,
                            });
                        }
                    }
                }

                sections.push(Section {
                    slug: "repository",
                    heading: "Repository",
                    content: format!(
                        "Repository: {}\nBranch: {}\nThe current directory is a prepared git \
                         worktree on that branch. {INSTRUCTION_FILE_NAME} in the workspace \
                         root repeats the task details.",
                        task.repository_id, workspace.branch_name
                    ),
                    spillable: false,
                });

                if task.action == WorkerAction::ResumeTask {
                    sections.push(Section {
                        slug: "progress",
                        heading: "Previous progress",
                        content: progress
                            .filter(|p| !p.is_empty())
                            .unwrap_or("No progress was recorded; inspect the worktree to see how far the previous run got.")
                            .to_string(),
                        spillable: true,
                    });
                    sections.push(Section {
                        slug: "instructions",
                        heading: "Instructions",
                        content: "Continue from the last completed step. Do not redo finished \
                                  work. Commit and push as you go, and make sure a pull request \
                                  exists when you finish; print its URL."
                            .to_string(),
                        spillable: false,
                    });
                } else {
                    sections.push(Section {
                        slug: "instructions",
                        heading: "Instructions",
                        content: "Implement the task on the current branch. Commit after each \
                                  logical unit of work and push. Run the project's tests. When \
                                  done, open a pull request for this branch and print its URL \
                                  on a line of its own."
                            .to_string(),
                        spillable: false,
                    });
                }
            }
            WorkerAction::ProcessFeedback => {
                let title = task
                    .board_item
                    .as_ref()
                    .map(|i| i.title.clone())
                    .unwrap_or_else(|| format!("Task {}", task.task_id));
                sections.push(Section {
                    slug: "task",
                    heading: "Task",
                    content: title,
                    spillable: false,
                });
                if let Some(url) = &task.pull_request_url {
                    sections.push(Section {
                        slug: "pull-request",
                        heading: "Pull request",
                        content: url.clone(),
                        spillable: false,
                    });
                }
                sections.push(Section {
                    slug: "feedback",
                    heading: "Review feedback",
                    content: format_comments(&task.review_comments),
                    spillable: true,
                });
                sections.push(Section {
                    slug: "instructions",
                    heading: "Instructions",
                    content: "Address every comment above in the current worktree. Commit and \
                              push to the pull request branch. Summarize what you changed for \
                              each comment."
                        .to_string(),
                    spillable: false,
                });
            }
            WorkerAction::MergeRequest => {
                if let Some(url) = &task.pull_request_url {
                    sections.push(Section {
                        slug: "pull-request",
                        heading: "Pull request",
                        content: url.clone(),
                        spillable: false,
                    });
                }
                sections.push(Section {
                    slug: "instructions",
                    heading: "Instructions",
                    content: "Merge the pull request above. After merging, print the merge \
                              commit hash on a line of its own."
                        .to_string(),
                    spillable: false,
                });
            }
            WorkerAction::CheckStatus => {
                // Status checks never reach the agent; the router answers
                // them from worker state. Kept total for safety.
                sections.push(Section {
                    slug: "instructions",
                    heading: "Instructions",
                    content: "Report the current status of the work in this directory."
                        .to_string(),
                    spillable: false,
                });
            }
        }

        sections
    }
}

fn render(sections: &[Section]) -> String {
    let mut out = String::new();
    for section in sections {
        out.push_str(&format!("## {}\n\n{}\n\n", section.heading, section.content));
    }
    out
}

/// Ordered, deduplicated comment bodies. Duplicate bodies (bots repeating
/// themselves) collapse onto the first occurrence.
fn format_comments(comments: &[ReviewComment]) -> String {
    let mut seen = Vec::new();
    let mut out = Vec::new();
    for comment in comments {
        let body = comment.content.trim();
        if body.is_empty() || seen.contains(&body) {
            continue;
        }
        seen.push(body);
        out.push(format!("{}. ({}) {}", out.len() + 1, comment.author, body));
    }
    if out.is_empty() {
        "No actionable comments were found.".to_string()
    } else {
        out.join("\n")
    }
}

/// Split an oversized section into chunks of at most `limit` bytes,
/// preferring markdown header boundaries and falling back to line and
/// character boundaries. Concatenating the chunks reproduces the input.
pub fn split_section(content: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    if content.len() <= limit {
        return vec![content.to_string()];
    }

    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in content.split_inclusive('\n') {
        if line.starts_with('#') && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        pieces.push(current);
    }

    let mut chunks = Vec::new();
    for piece in pieces {
        if piece.len() <= limit {
            chunks.push(piece);
        } else {
            chunks.extend(hard_chunks(&piece, limit));
        }
    }
    chunks
}

fn hard_chunks(content: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = content;
    while rest.len() > limit {
        let mut cut = limit;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        // Prefer ending the chunk on a line boundary.
        if let Some(nl) = rest[..cut].rfind('\n') {
            if nl > 0 {
                cut = nl + 1;
            }
        }
        out.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

/// Re-inline `@<path>` references relative to the workspace.
///
/// Used to reconstruct the full prompt content that a split prompt refers
/// to; unknown references are kept verbatim.
pub fn resolve_references(prompt: &str, workspace_dir: &Path) -> String {
    let mut out = Vec::new();
    for line in prompt.lines() {
        if let Some(path) = line.strip_prefix('@') {
            let full = workspace_dir.join(path);
            if let Ok(content) = fs::read_to_string(&full) {
                out.push(content);
                continue;
            }
        }
        out.push(format!("{line}\n"));
    }
    out.concat()
}

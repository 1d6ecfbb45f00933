//! Producer response parser: fenced code blocks -> candidate changeset.
//!
//! The response grammar is a sequence of fenced blocks, each optionally
//! declaring a relative filename via an inline `# Filename:` marker on one
//! of its leading lines. The scanner is an explicit finite-state machine;
//! a block left open at end of input is a hard parse error, never a silent
//! truncation.
//!
//! Blocks without a declared name get one synthesized from a timestamp:
//! `test_<ts>` when the content looks like a test, `generated_<ts>`
//! otherwise, with the extension taken from the fence language tag.

use chrono::Utc;

use crate::changeset::{CandidateChangeSet, FileKind};
use crate::error::{Result, StagegateError};

const FENCE: &str = "```";
const NAME_MARKERS: [&str; 2] = ["# Filename:", "# File:"];

/// Scanner states, one per grammar position.
enum ScanState {
    /// Between blocks.
    Outside,

    /// Inside a block, no filename seen yet; lines are buffered in case the
    /// name shows up on a later line.
    AwaitingName { lang: String, buffered: Vec<String> },

    /// Inside a block with a declared filename.
    Collecting { name: String, lines: Vec<String> },
}

/// Parse a producer response into a changeset.
///
/// Returns an empty changeset for a response with no code blocks; that is
/// a valid (if unhelpful) producer answer, not a parse error.
pub fn parse_response(response: &str) -> Result<CandidateChangeSet> {
    let mut set = CandidateChangeSet::new();
    let mut state = ScanState::Outside;
    let mut synthesized = 0usize;

    for line in response.lines() {
        state = match state {
            ScanState::Outside => {
                if let Some(tag) = fence_open(line) {
                    ScanState::AwaitingName {
                        lang: tag,
                        buffered: Vec::new(),
                    }
                } else {
                    ScanState::Outside
                }
            }
            ScanState::AwaitingName { lang, mut buffered } => {
                if is_fence_close(line) {
                    finish_unnamed(&mut set, &lang, buffered, &mut synthesized)?;
                    ScanState::Outside
                } else if let Some(name) = declared_name(line) {
                    ScanState::Collecting {
                        name,
                        lines: buffered,
                    }
                } else {
                    buffered.push(line.to_string());
                    ScanState::AwaitingName { lang, buffered }
                }
            }
            ScanState::Collecting { name, mut lines } => {
                if is_fence_close(line) {
                    let content = lines.join("\n");
                    let kind = FileKind::infer(std::path::Path::new(&name));
                    set.insert(&name, content, kind)?;
                    ScanState::Outside
                } else {
                    lines.push(line.to_string());
                    ScanState::Collecting { name, lines }
                }
            }
        };
    }

    match state {
        ScanState::Outside => Ok(set),
        ScanState::AwaitingName { .. } | ScanState::Collecting { .. } => {
            Err(StagegateError::MalformedResponse(
                "unterminated code block at end of response".to_string(),
            ))
        }
    }
}

/// A fence line that opens a block, returning its language tag.
fn fence_open(line: &str) -> Option<String> {
    let trimmed = line.trim();
    let rest = trimmed.strip_prefix(FENCE)?;
    let tag = rest.trim();
    if tag.is_empty() {
        // A bare fence outside a block is ambiguous; treat it as an opener
        // with no language rather than dropping content.
        Some(String::new())
    } else {
        Some(tag.to_lowercase())
    }
}

fn is_fence_close(line: &str) -> bool {
    line.trim() == FENCE
}

/// Extract a filename declared via an inline marker line.
fn declared_name(line: &str) -> Option<String> {
    let trimmed = line.trim();
    for marker in NAME_MARKERS {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            let name = rest.trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Close an unnamed block: synthesize a filename from the content and
/// fence tag, or discard the block if it is empty.
fn finish_unnamed(
    set: &mut CandidateChangeSet,
    lang: &str,
    lines: Vec<String>,
    synthesized: &mut usize,
) -> Result<()> {
    if lines.iter().all(|l| l.trim().is_empty()) {
        return Ok(());
    }

    let looks_like_test = lines
        .iter()
        .any(|l| l.contains("def test_") || l.contains("fn test_") || l.contains("it("));
    let prefix = if looks_like_test { "test" } else { "generated" };
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    *synthesized += 1;
    let name = format!(
        "{prefix}_{stamp}_{n}.{ext}",
        n = *synthesized,
        ext = extension_for(lang)
    );

    let kind = if looks_like_test {
        FileKind::Test
    } else {
        FileKind::Code
    };
    set.insert(&name, lines.join("\n"), kind)
}

fn extension_for(lang: &str) -> &'static str {
    match lang {
        "python" | "py" => "py",
        "rust" | "rs" => "rs",
        "javascript" | "js" => "js",
        "typescript" | "ts" => "ts",
        "bash" | "sh" | "shell" => "sh",
        "html" => "html",
        "css" => "css",
        _ => "txt",
    }
}

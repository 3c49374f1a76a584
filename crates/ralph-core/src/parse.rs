//! Artifact parsers and status derivation.
//!
//! Every function here is pure: it takes the raw artifact text (plus the
//! metadata the caller already has) and returns a typed record or a
//! [`ParseError`]. Callers decide whether a failure is logged or surfaced.

use crate::frontmatter::{Frontmatter, FrontmatterError};
use crate::types::{
    LoopMode, LoopStatus, Outcome, ProgressSnapshot, QuestionStatus, SpecRecord,
    SteeringQuestion, SummaryRecord, DEFAULT_MAX_ITERATIONS, SPEC_SUMMARY_MAX_CHARS,
};
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;

/// Marker the loop writes into an unanswered Response section.
pub const AWAITING_RESPONSE: &str = "_Awaiting response..._";

const PROGRESS_SUMMARY_MAX_CHARS: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Frontmatter(#[from] FrontmatterError),
    #[error("missing section: {0}")]
    MissingSection(&'static str),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Fields read from a persistent loop state artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    pub iteration: u32,
    /// `0` means unlimited.
    pub max_iterations: u32,
    pub completion_promise: Option<String>,
    pub mode: LoopMode,
    pub started_at: Option<DateTime<Utc>>,
    pub completed: bool,
    pub cancelled: bool,
}

impl LoopState {
    pub fn status(&self) -> LoopStatus {
        resolve_status(
            self.cancelled,
            self.completed,
            self.iteration,
            self.max_iterations,
        )
    }
}

/// Status precedence: cancelled, then completed, then the iteration cap.
pub fn resolve_status(
    cancelled: bool,
    completed: bool,
    iteration: u32,
    max_iterations: u32,
) -> LoopStatus {
    if cancelled {
        LoopStatus::Cancelled
    } else if completed {
        LoopStatus::Completed
    } else if max_iterations > 0 && iteration >= max_iterations {
        LoopStatus::MaxReached
    } else {
        LoopStatus::Running
    }
}

/// Status of a fresh-mode loop, which has no explicit state.
///
/// A loop whose newest log was touched within `stale_after` is running.
/// Past that it is either capped or done.
pub fn classify_fresh_status(
    iteration: u32,
    max_iterations: u32,
    last_activity: DateTime<Utc>,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> LoopStatus {
    if now.signed_duration_since(last_activity) <= stale_after {
        LoopStatus::Running
    } else if max_iterations > 0 && iteration >= max_iterations {
        LoopStatus::MaxReached
    } else {
        LoopStatus::Completed
    }
}

pub fn parse_loop_state(content: &str) -> Result<LoopState> {
    let (fm, _) = Frontmatter::parse(content)?;

    let iteration = required_u32(&fm, "iteration")?.unwrap_or(0);
    let max_iterations = required_u32(&fm, "max_iterations")?.unwrap_or(0);
    let completed = fm.get_bool("completed").unwrap_or(false)
        || fm
            .get_str("status")
            .is_some_and(|s| s.eq_ignore_ascii_case("completed"));
    let cancelled = fm.get_bool("cancelled").unwrap_or(false)
        || fm
            .get_str("status")
            .is_some_and(|s| s.eq_ignore_ascii_case("cancelled"));

    Ok(LoopState {
        iteration,
        max_iterations,
        completion_promise: fm.get_non_empty("completion_promise"),
        mode: fm
            .get_str("mode")
            .map_or(LoopMode::Yolo, |m| LoopMode::parse(&m)),
        started_at: fm.get_datetime("started_at"),
        completed,
        cancelled,
    })
}

/// A present-but-unparseable integer is an error; an absent one is `None`.
fn required_u32(fm: &Frontmatter, key: &'static str) -> Result<Option<u32>> {
    if !fm.contains(key) {
        return Ok(None);
    }
    fm.get_u32(key)
        .map(Some)
        .ok_or_else(|| ParseError::InvalidValue {
            key,
            value: fm.get_str(key).unwrap_or_default(),
        })
}

/// Parse a spec artifact. Specs may omit frontmatter entirely.
pub fn parse_spec(task_id: &str, content: &str, source_path: PathBuf) -> Result<SpecRecord> {
    let (fm, body) = Frontmatter::parse_optional(content)?;
    let body = body.trim().to_string();

    Ok(SpecRecord {
        task_id: task_id.to_string(),
        max_iterations: required_u32(&fm, "max_iterations")?.unwrap_or(DEFAULT_MAX_ITERATIONS),
        completion_promise: fm.get_non_empty("completion_promise"),
        mode: fm
            .get_str("mode")
            .map_or(LoopMode::Yolo, |m| LoopMode::parse(&m)),
        summary: summarize(&body, SPEC_SUMMARY_MAX_CHARS),
        body,
        source_path,
        created_at: fm.get_datetime("created_at"),
    })
}

/// First meaningful text of a markdown body, collapsed to one line and
/// truncated to at most `max_chars` characters (including the ellipsis).
pub fn summarize(body: &str, max_chars: usize) -> String {
    let text = body
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("```"))
        .map(|l| l.trim_start_matches('#').trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    if text.chars().count() <= max_chars {
        return text;
    }
    let mut truncated: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    truncated = truncated.trim_end().to_string();
    truncated.push_str("...");
    truncated
}

/// Split a markdown body into `## ` sections, keyed by lowercase heading.
fn sections(body: &str) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    let mut in_code_block = false;

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_code_block = !in_code_block;
        }
        if !in_code_block {
            if let Some(heading) = trimmed.strip_prefix("## ") {
                out.push((heading.trim().to_lowercase(), String::new()));
                continue;
            }
        }
        if let Some((_, text)) = out.last_mut() {
            text.push_str(line);
            text.push('\n');
        }
    }

    for (_, text) in &mut out {
        *text = text.trim().to_string();
    }
    out
}

fn section<'a>(sections: &'a [(String, String)], name: &str) -> Option<&'a str> {
    sections
        .iter()
        .find(|(heading, _)| heading == name)
        .map(|(_, text)| text.as_str())
}

fn parse_options(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if let Some(rest) = trimmed
                .strip_prefix("- ")
                .or_else(|| trimmed.strip_prefix("* "))
            {
                return Some(rest.trim().to_string());
            }
            let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
            if digits == 0 {
                return None;
            }
            let rest = &trimmed[digits..];
            rest.strip_prefix(". ")
                .or_else(|| rest.strip_prefix(") "))
                .map(|r| r.trim().to_string())
        })
        .filter(|o| !o.is_empty())
        .collect()
}

fn is_unanswered(response: &str) -> bool {
    let trimmed = response.trim();
    trimmed.is_empty() || trimmed == AWAITING_RESPONSE
}

pub fn parse_steering(task_id: &str, content: &str) -> Result<SteeringQuestion> {
    let (fm, body) = Frontmatter::parse_optional(content)?;
    let sections = sections(body);

    let question = section(&sections, "question")
        .filter(|q| !q.is_empty())
        .ok_or(ParseError::MissingSection("Question"))?
        .to_string();
    let context = section(&sections, "context")
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    let options = section(&sections, "options")
        .map(parse_options)
        .unwrap_or_default();
    let response = section(&sections, "response")
        .filter(|r| !is_unanswered(r))
        .map(str::to_string);

    let status = match fm.get_str("status").map(|s| s.to_ascii_lowercase()) {
        Some(s) if s == "answered" => QuestionStatus::Answered,
        Some(s) if s == "pending" => QuestionStatus::Pending,
        Some(other) => {
            return Err(ParseError::InvalidValue {
                key: "status",
                value: other,
            })
        }
        None if response.is_some() => QuestionStatus::Answered,
        None => QuestionStatus::Pending,
    };

    Ok(SteeringQuestion {
        task_id: task_id.to_string(),
        status,
        iteration: fm.get_u32("iteration"),
        timestamp: fm.get_datetime("timestamp"),
        question,
        context,
        options,
        response,
    })
}

/// Replace the body of the `## Response` section, appending one if absent.
pub fn replace_response(content: &str, response: &str) -> String {
    let mut out = String::with_capacity(content.len() + response.len() + 16);
    let mut in_response = false;
    let mut replaced = false;
    let mut in_code_block = false;

    for line in content.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed.starts_with("```") && !in_response {
            in_code_block = !in_code_block;
        }
        let is_heading = !in_code_block && trimmed.starts_with("## ");

        if in_response {
            if is_heading {
                in_response = false;
                out.push('\n');
            } else {
                continue;
            }
        }
        if is_heading && trimmed[3..].trim().eq_ignore_ascii_case("response") && !replaced {
            out.push_str(line.trim_end());
            out.push_str("\n\n");
            out.push_str(response.trim());
            out.push('\n');
            in_response = true;
            replaced = true;
            continue;
        }
        out.push_str(line);
    }

    if !replaced {
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("\n## Response\n\n");
        out.push_str(response.trim());
        out.push('\n');
    }
    out
}

pub fn parse_progress(
    task_id: &str,
    content: &str,
    modified: Option<DateTime<Utc>>,
) -> Result<ProgressSnapshot> {
    let (fm, body) = Frontmatter::parse_optional(content)?;
    Ok(ProgressSnapshot {
        task_id: task_id.to_string(),
        content: content.to_string(),
        summary: latest_progress_line(body)
            .map(|l| summarize(l, PROGRESS_SUMMARY_MAX_CHARS))
            .unwrap_or_default(),
        timestamp: fm
            .get_datetime("updated_at")
            .or_else(|| fm.get_datetime("timestamp"))
            .or(modified),
    })
}

/// The most recent meaningful line: progress files are append-only logs.
fn latest_progress_line(body: &str) -> Option<&str> {
    body.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("```") && !l.starts_with('#') && *l != "---")
        .map(|l| {
            l.trim_start_matches("- ")
                .trim_start_matches("* ")
                .trim_start_matches("[x] ")
                .trim_start_matches("[ ] ")
        })
}

pub fn parse_summary(
    task_id: &str,
    content: &str,
    modified: Option<DateTime<Utc>>,
) -> Result<SummaryRecord> {
    let (fm, body) = Frontmatter::parse_optional(content)?;
    let outcome = fm
        .get_str("outcome")
        .or_else(|| fm.get_str("status"))
        .map_or_else(|| outcome_from_body(body), |o| Outcome::parse(&o));

    Ok(SummaryRecord {
        task_id: task_id.to_string(),
        content: content.to_string(),
        outcome,
        timestamp: fm
            .get_datetime("completed_at")
            .or_else(|| fm.get_datetime("timestamp"))
            .or(modified),
    })
}

/// Look for an `Outcome:` line or an `## Outcome` section.
fn outcome_from_body(body: &str) -> Outcome {
    let sections = sections(body);
    if let Some(text) = section(&sections, "outcome") {
        if let Some(first) = text.lines().map(str::trim).find(|l| !l.is_empty()) {
            return Outcome::parse(first.trim_matches('*'));
        }
    }
    for line in body.lines() {
        let trimmed = line.trim().trim_start_matches("**");
        let lower = trimmed.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("outcome:") {
            return Outcome::parse(rest.trim_start_matches("**").trim_matches('*'));
        }
    }
    Outcome::Unknown
}

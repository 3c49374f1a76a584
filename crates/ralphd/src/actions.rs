//! User-initiated mutations of loop artifacts.
//!
//! Unlike reads, these fail loudly: a missing target is an error the caller
//! must surface.

use chrono::{SecondsFormat, Utc};
use ralph_core::frontmatter::{self, FrontmatterError};
use ralph_core::parse::{self, ParseError};
use ralph_core::QuestionStatus;
use thiserror::Error;
use tracing::info;

use crate::store::{ArtifactStore, StoreError};

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{artifact} not found for task {task_id}")]
    NotFound {
        task_id: String,
        artifact: &'static str,
    },
    #[error("steering question for task {0} is already answered")]
    AlreadyAnswered(String),
    #[error("response must not be empty")]
    EmptyResponse,
    #[error("invalid steering artifact: {0}")]
    Parse(#[from] ParseError),
    #[error("invalid frontmatter: {0}")]
    Frontmatter(#[from] FrontmatterError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ActionError>;

async fn read_required(
    store: &dyn ArtifactStore,
    path: &std::path::Path,
    task_id: &str,
    artifact: &'static str,
) -> Result<String> {
    match store.read(path).await {
        Ok(content) => Ok(content),
        Err(StoreError::NotFound(_)) => Err(ActionError::NotFound {
            task_id: task_id.to_string(),
            artifact,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Record `response` as the answer to the pending steering question.
pub async fn answer_steering(store: &dyn ArtifactStore, task_id: &str, response: &str) -> Result<()> {
    let response = response.trim();
    if response.is_empty() {
        return Err(ActionError::EmptyResponse);
    }

    let path = store.layout().steering_path(task_id);
    let content = read_required(store, &path, task_id, "steering question").await?;
    let question = parse::parse_steering(task_id, &content)?;
    if question.status == QuestionStatus::Answered {
        return Err(ActionError::AlreadyAnswered(task_id.to_string()));
    }

    let answered_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let updated = frontmatter::set_field(&content, "status", QuestionStatus::Answered.as_str())?;
    let updated = frontmatter::set_field(&updated, "answered_at", &format!("\"{answered_at}\""))?;
    let updated = parse::replace_response(&updated, response);

    store.write(&path, &updated).await?;
    info!(task_id = %task_id, "answered steering question");
    Ok(())
}

/// Mark a persistent loop as cancelled.
///
/// Fresh loops have no state artifact to mutate, so they report `NotFound`.
pub async fn cancel_loop(store: &dyn ArtifactStore, task_id: &str) -> Result<()> {
    let path = store.layout().state_path(task_id);
    let content = read_required(store, &path, task_id, "loop state").await?;
    let updated = frontmatter::set_field(&content, "cancelled", "true")?;

    store.write(&path, &updated).await?;
    info!(task_id = %task_id, "cancelled loop");
    Ok(())
}

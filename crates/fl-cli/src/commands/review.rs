//! Review commands.

use std::str::FromStr;

use clap::Args;
use fl_core::task_store::{ReviewOutcome, ReviewSubmission, TaskStore};
use fl_core::types::{ReviewFinding, ReviewStatus, ReviewType, TaskReview};

#[derive(Debug, Args)]
pub struct RequestArgs {
    pub key: String,
    #[arg(long = "type", value_parser = ReviewType::from_str, default_value = "code")]
    pub review_type: ReviewType,
    #[arg(long, default_value = "")]
    pub notes: String,
    #[arg(long)]
    pub reviewer: Option<String>,
}

pub async fn request(store: &TaskStore, args: RequestArgs) -> anyhow::Result<TaskReview> {
    let review = store
        .request_review(&args.key, args.review_type, &args.notes, args.reviewer.as_deref())
        .await?;
    tracing::info!(task_key = %args.key, review_id = review.id, "review requested");
    Ok(review)
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    pub review_id: i64,
    /// approved, needs_changes or rejected.
    #[arg(value_parser = ReviewStatus::from_str)]
    pub status: ReviewStatus,
    #[arg(long, default_value = "")]
    pub comments: String,
    /// Change the author must make (repeatable).
    #[arg(long = "change")]
    pub required_changes: Vec<String>,
    /// Findings as a JSON array of {category, severity, issue, location}.
    #[arg(long)]
    pub findings: Option<String>,
    #[arg(long)]
    pub reviewer: Option<String>,
}

pub async fn submit(store: &TaskStore, args: SubmitArgs) -> anyhow::Result<ReviewOutcome> {
    let findings: Vec<ReviewFinding> = match args.findings.as_deref() {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("--findings must be a JSON array of findings: {e}"))?,
        None => Vec::new(),
    };
    let mut submission = ReviewSubmission::new(args.status, args.comments);
    submission.findings = findings;
    submission.required_changes = args.required_changes;
    submission.reviewer = args.reviewer;
    Ok(store.submit_review(args.review_id, submission).await?)
}

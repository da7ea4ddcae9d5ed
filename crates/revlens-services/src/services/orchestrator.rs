//! Per-session analysis pipeline: ingest → extract → classify → aggregate →
//! finalize.
//!
//! One background task per submission. The dedup claim travels with the task
//! and is released on every exit path. Only this module writes session
//! status transitions; readers observe `generating` until the single
//! terminal upsert lands.

use bigdecimal::BigDecimal;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use revlens_core::database::DatabasePool;
use revlens_core::error::{AppError, AppResult};
use revlens_core::models::{
    categorize_upload, AnalysisSession, ClassificationSource, FileCategory, LlmRunStatus,
    MessageRole, NewSessionFile, SessionFile, SessionMessage, SessionPatch, SessionStatus,
    StatementTransaction,
};

use crate::services::aggregate::{build_report, render_report_text};
use crate::services::classify::{classify_transaction, Verdict};
use crate::services::extractor::{FileExtraction, PdfPayload, StatementExtractor};
use crate::services::llm::{ReviewClassifier, ReviewDecision, ReviewItem};
use crate::services::normalize::{extract_amount, extract_date, extract_text, FieldRole};
use crate::services::registry::{ClaimGuard, SessionRegistry};

/// Default report currency when the submission metadata does not name one
pub const DEFAULT_CURRENCY: &str = "KZT";

/// One file as received from the multipart submission
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// A claimed submission ready for background processing
#[derive(Debug, Clone)]
pub struct Submission {
    pub session_id: String,
    pub comment: Option<String>,
    pub metadata: Option<Value>,
    pub files: Vec<UploadedFile>,
}

/// Heuristic partition of the extracted transactions
#[derive(Debug, Default)]
pub struct ClassifiedBatch {
    pub revenue: Vec<StatementTransaction>,
    pub non_revenue: Vec<StatementTransaction>,
    pub needs_review: Vec<StatementTransaction>,
}

/// Spawns and runs the per-session pipeline
pub struct AnalysisOrchestrator {
    pool: DatabasePool,
    registry: Arc<SessionRegistry>,
    extractor: Arc<dyn StatementExtractor>,
    reviewer: Option<Arc<dyn ReviewClassifier>>,
}

impl AnalysisOrchestrator {
    pub fn new(
        pool: DatabasePool,
        registry: Arc<SessionRegistry>,
        extractor: Arc<dyn StatementExtractor>,
        reviewer: Option<Arc<dyn ReviewClassifier>>,
    ) -> Self {
        Self {
            pool,
            registry,
            extractor,
            reviewer,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Launch the background task for a claimed submission. Returns
    /// immediately; progress is observable through the store.
    pub fn spawn(&self, submission: Submission, claim: ClaimGuard) {
        let pool = self.pool.clone();
        let registry = Arc::clone(&self.registry);
        let extractor = Arc::clone(&self.extractor);
        let reviewer = self.reviewer.clone();

        tokio::spawn(async move {
            let session_id = submission.session_id.clone();
            tracing::info!(session = %session_id, files = submission.files.len(), "Analysis accepted");

            let result = run_pipeline(
                &pool,
                &registry,
                extractor.as_ref(),
                reviewer.as_deref(),
                submission,
            )
            .await;

            if let Err(error) = result {
                error.log_with_context("Analysis pipeline failed");

                let mut patch = SessionPatch::new();
                patch.status = Some(SessionStatus::Failed.to_string());
                patch.completed_at = Some(Utc::now());
                patch.report_text = Some(error.to_string());
                patch.llm_status = match &error {
                    AppError::UpstreamUnavailable(m) | AppError::ExternalApiError(m)
                        if m.contains("LLM") =>
                    {
                        Some(LlmRunStatus::Failed.to_string())
                    }
                    _ => None,
                };

                if let Err(e) = AnalysisSession::upsert_report(&pool, &session_id, patch).await {
                    e.log_with_context("Failed to persist terminal failure state");
                }
            }

            // claim is released here on all paths, panics included
            drop(claim);
        });
    }
}

async fn run_pipeline(
    pool: &DatabasePool,
    registry: &Arc<SessionRegistry>,
    extractor: &dyn StatementExtractor,
    reviewer: Option<&dyn ReviewClassifier>,
    submission: Submission,
) -> AppResult<()> {
    let session_id = submission.session_id.clone();

    // ── Ingest ──────────────────────────────────────────────────────────
    tracing::info!(session = %session_id, phase = "ingesting", "Persisting submission");

    let mut patch = SessionPatch::new();
    patch.status = Some(SessionStatus::Generating.to_string());
    patch.comment = submission.comment.clone();
    patch.metadata = submission.metadata.clone();
    patch.files_count = Some(submission.files.len() as i32);
    patch.files_data = Some(files_data_summary(&submission.files));
    AnalysisSession::upsert_report(pool, &session_id, patch).await?;

    let mut statement_pdfs = Vec::new();
    for file in &submission.files {
        let category = categorize_upload(&file.name, &file.mime);

        let row = NewSessionFile {
            session_id: session_id.clone(),
            external_file_id: None,
            original_name: file.name.clone(),
            size_bytes: file.bytes.len() as i64,
            mime_type: file.mime.clone(),
            category: category.to_string(),
        };
        if let Err(e) = SessionFile::insert(pool, &row).await {
            tracing::warn!(session = %session_id, file = %file.name, error = %e,
                "Skipping file record insert");
        }

        if category == FileCategory::Statements {
            statement_pdfs.push(PdfPayload {
                file_name: file.name.clone(),
                bytes: file.bytes.clone(),
            });
        }
    }

    // ── Extract ─────────────────────────────────────────────────────────
    tracing::info!(session = %session_id, phase = "extracting",
        statements = statement_pdfs.len(), "Running statement extraction");

    let outcomes = if statement_pdfs.is_empty() {
        Vec::new()
    } else {
        extractor.extract(statement_pdfs).await?
    };

    for outcome in &outcomes {
        if let Some(error) = &outcome.error {
            tracing::warn!(session = %session_id, file = %outcome.source_file, error = %error,
                "Extractor failed for one file; continuing with the rest");
        }
        if let Some(artifact) = &outcome.excel_file {
            let row = NewSessionFile {
                session_id: session_id.clone(),
                external_file_id: None,
                original_name: artifact.name.clone(),
                size_bytes: artifact.size,
                mime_type: artifact.mime.clone(),
                category: FileCategory::ConvertedStatement.to_string(),
            };
            if let Err(e) = SessionFile::insert(pool, &row).await {
                tracing::warn!(session = %session_id, error = %e,
                    "Skipping converted-statement record insert");
            }
        }
    }

    let transactions = build_transactions(&session_id, &outcomes);

    // ── Classify ────────────────────────────────────────────────────────
    tracing::info!(session = %session_id, phase = "classifying",
        transactions = transactions.len(), "Classifying transactions");

    let batch = partition_by_heuristic(transactions);

    let (reviewed_revenue, reviewed_non_revenue, llm_status, llm_response_id) =
        if batch.needs_review.is_empty() {
            (Vec::new(), Vec::new(), LlmRunStatus::Skipped, None)
        } else {
            let reviewer = reviewer.ok_or_else(|| {
                AppError::UpstreamUnavailable(
                    "LLM classifier is not configured but ambiguous transactions need review"
                        .to_string(),
                )
            })?;

            let items = review_items(&batch.needs_review, submission.comment.as_deref());
            let outcome = reviewer.review(&items).await?;

            // Persist the provider response id before anything else: if the
            // process dies between here and the terminal upsert, the row is
            // left `generating` with a response id, which is exactly what
            // status reconciliation needs to recover the session.
            if let Some(response_id) = &outcome.response_id {
                let mut patch = SessionPatch::new();
                patch.llm_response_id = Some(response_id.clone());
                if let Err(e) = AnalysisSession::upsert_report(pool, &session_id, patch).await {
                    tracing::warn!(session = %session_id, error = %e,
                        "Skipping provider response id persist");
                }
            }

            registry.append_turn(&session_id, "user", outcome.user_prompt.clone());
            registry.append_turn(&session_id, "assistant", json!(outcome.assistant_text));

            if let Err(e) = SessionMessage::append(
                pool,
                &session_id,
                MessageRole::User,
                outcome.user_prompt.clone(),
            )
            .await
            {
                tracing::warn!(session = %session_id, error = %e, "Skipping user message insert");
            }
            if let Err(e) = SessionMessage::append(
                pool,
                &session_id,
                MessageRole::Assistant,
                json!({ "text": outcome.assistant_text }),
            )
            .await
            {
                tracing::warn!(session = %session_id, error = %e, "Skipping assistant message insert");
            }

            let (revenue, non_revenue, status) =
                fold_decisions(batch.needs_review, &outcome.decisions);
            (revenue, non_revenue, status, outcome.response_id)
        };

    // ── Aggregate ───────────────────────────────────────────────────────
    tracing::info!(session = %session_id, phase = "aggregating", "Building report");

    let mut revenue = batch.revenue;
    revenue.extend(reviewed_revenue);
    let mut non_revenue = batch.non_revenue;
    non_revenue.extend(reviewed_non_revenue);

    sort_by_date_nulls_last(&mut revenue);
    sort_by_date_nulls_last(&mut non_revenue);

    let currency = submission
        .metadata
        .as_ref()
        .and_then(|m| m.get("currency"))
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_CURRENCY);

    let report = build_report(&revenue, &non_revenue, currency, Utc::now());
    let report_text = render_report_text(&report);

    // ── Finalize ────────────────────────────────────────────────────────
    let mut patch = SessionPatch::new();
    patch.status = Some(SessionStatus::Completed.to_string());
    patch.completed_at = Some(Utc::now());
    patch.report_structured = Some(serde_json::to_value(&report)?);
    patch.report_text = Some(report_text);
    patch.stats = Some(serde_json::to_value(&report.stats)?);
    patch.llm_status = Some(llm_status.to_string());
    patch.llm_response_id = llm_response_id;

    // the one write whose failure is fatal for the session
    AnalysisSession::upsert_report(pool, &session_id, patch).await?;

    tracing::info!(session = %session_id, status = "completed", llm = %llm_status,
        "Analysis finished");
    Ok(())
}

/// Canonical `files_data` summary: name/size/mime per uploaded file.
pub fn files_data_summary(files: &[UploadedFile]) -> Value {
    json!(files
        .iter()
        .map(|f| {
            json!({
                "name": f.name,
                "size": f.bytes.len(),
                "mime": f.mime,
            })
        })
        .collect::<Vec<_>>())
}

/// Turn per-file extraction outcomes into normalized transactions with
/// stable `{session_id}_{index}` ids (1-based, across all files in order).
pub fn build_transactions(
    session_id: &str,
    outcomes: &[FileExtraction],
) -> Vec<StatementTransaction> {
    let mut transactions = Vec::new();
    let mut index = 0usize;

    for outcome in outcomes {
        if outcome.error.is_some() {
            continue;
        }
        for record in &outcome.transactions {
            index += 1;

            let (raw_amount, amount) = extract_amount(record)
                .unwrap_or_else(|| (String::new(), BigDecimal::from(0)));

            transactions.push(StatementTransaction {
                internal_id: format!("{}_{}", session_id, index),
                raw_amount,
                amount: amount.abs(),
                value_date: extract_date(record),
                purpose: extract_text(record, FieldRole::Purpose).unwrap_or_default(),
                sender: extract_text(record, FieldRole::Sender).unwrap_or_default(),
                correspondent: extract_text(record, FieldRole::Correspondent).unwrap_or_default(),
                bin: extract_text(record, FieldRole::Bin),
                source: ClassificationSource::Heuristic,
                reason: String::new(),
                possible_non_revenue: false,
            });
        }
    }

    transactions
}

/// Run the keyword heuristic over every transaction.
pub fn partition_by_heuristic(transactions: Vec<StatementTransaction>) -> ClassifiedBatch {
    let mut batch = ClassifiedBatch::default();

    for mut tx in transactions {
        let decision = classify_transaction(&tx);
        tx.reason = decision.reason;
        match decision.verdict {
            Verdict::Revenue => {
                tx.source = ClassificationSource::Heuristic;
                batch.revenue.push(tx);
            }
            Verdict::NonRevenue => {
                tx.source = ClassificationSource::Heuristic;
                batch.non_revenue.push(tx);
            }
            Verdict::NeedsReview => {
                tx.source = ClassificationSource::Heuristic;
                tx.possible_non_revenue = true;
                batch.needs_review.push(tx);
            }
        }
    }

    batch
}

/// Reduce ambiguous transactions for the reviewer.
pub fn review_items(
    transactions: &[StatementTransaction],
    comment: Option<&str>,
) -> Vec<ReviewItem> {
    transactions
        .iter()
        .map(|tx| ReviewItem {
            id: tx.internal_id.clone(),
            date: tx.value_date.map(|d| d.format("%Y-%m-%d").to_string()),
            amount: tx.amount.to_string(),
            purpose: tx.purpose.clone(),
            sender: tx.sender.clone(),
            correspondent: tx.correspondent.clone(),
            bin: tx.bin.clone(),
            comment: comment.map(|c| c.to_string()),
        })
        .collect()
}

/// Fold reviewer decisions back into the ambiguous set.
///
/// Matched items route by `is_revenue` with source `agent`; unmatched items
/// default to non-revenue with source `agent-missing`. The run status is
/// `completed` only when every item received a decision.
pub fn fold_decisions(
    needs_review: Vec<StatementTransaction>,
    decisions: &[ReviewDecision],
) -> (
    Vec<StatementTransaction>,
    Vec<StatementTransaction>,
    LlmRunStatus,
) {
    let by_id: HashMap<&str, &ReviewDecision> = decisions
        .iter()
        .map(|d| (d.id.as_str(), d))
        .collect();

    let total = needs_review.len();
    let mut decided = 0usize;
    let mut revenue = Vec::new();
    let mut non_revenue = Vec::new();

    for mut tx in needs_review {
        match by_id.get(tx.internal_id.as_str()) {
            Some(decision) => {
                decided += 1;
                tx.source = ClassificationSource::Agent;
                tx.reason = decision.reason.clone();
                if decision.is_revenue {
                    revenue.push(tx);
                } else {
                    non_revenue.push(tx);
                }
            }
            None => {
                tx.source = ClassificationSource::AgentMissing;
                tx.reason = "no decision returned; treated as non-revenue".to_string();
                non_revenue.push(tx);
            }
        }
    }

    let status = if decided == total {
        LlmRunStatus::Completed
    } else {
        LlmRunStatus::Partial
    };

    (revenue, non_revenue, status)
}

/// Stable date sort with undated entries last.
pub fn sort_by_date_nulls_last(transactions: &mut [StatementTransaction]) {
    transactions.sort_by(|a, b| match (a.value_date, b.value_date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

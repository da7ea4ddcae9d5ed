pub mod aggregate;
pub mod classify;
pub mod extractor;
pub mod llm;
pub mod normalize;
pub mod orchestrator;
pub mod reconcile;
pub mod registry;

pub use aggregate::{build_report, format_amount, render_report_text};
pub use classify::{classify_transaction, HeuristicDecision, Verdict};
pub use extractor::{
    FileExtraction, HttpExtractor, PdfPayload, StatementExtractor, SubprocessExtractor,
};
pub use llm::{
    OpenAiClassifier, ProviderStatus, ReviewClassifier, ReviewDecision, ReviewItem, ReviewOutcome,
};
pub use orchestrator::{AnalysisOrchestrator, Submission, UploadedFile};
pub use reconcile::{refresh_all, refresh_session};
pub use registry::{ClaimGuard, SessionRegistry};

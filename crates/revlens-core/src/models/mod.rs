pub mod file;
pub mod message;
pub mod report;
pub mod session;
pub mod transaction;

pub use file::{categorize_upload, FileCategory, NewSessionFile, SessionFile};
pub use message::{MessageRole, NewSessionMessage, SessionMessage};
pub use report::{
    MoneyView, MonthBucket, ReportStats, ReportTotals, StructuredReport, TrailingTwelveMonths,
    YearBucket, YearSeries,
};
pub use session::{
    AnalysisSession, LlmRunStatus, NewAnalysisSession, SessionPatch, SessionStatus,
};
pub use transaction::{ClassificationSource, StatementTransaction};

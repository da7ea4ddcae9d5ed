use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::DatabasePool;
use crate::error::AppResult;
use crate::schema::session_files;

/// An uploaded artifact bound to a session
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = session_files)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SessionFile {
    pub id: Uuid,
    pub session_id: String,
    pub external_file_id: Option<String>,
    pub original_name: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub category: String,
    pub uploaded_at: DateTime<Utc>,
}

/// New file row for insertion
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = session_files)]
pub struct NewSessionFile {
    pub session_id: String,
    pub external_file_id: Option<String>,
    pub original_name: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub category: String,
}

/// File category derived from name/mime at ingest time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileCategory {
    Statements,
    Taxes,
    Financial,
    ConvertedStatement,
    Uncategorized,
}

impl std::fmt::Display for FileCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileCategory::Statements => write!(f, "statements"),
            FileCategory::Taxes => write!(f, "taxes"),
            FileCategory::Financial => write!(f, "financial"),
            FileCategory::ConvertedStatement => write!(f, "converted-statement"),
            FileCategory::Uncategorized => write!(f, "uncategorized"),
        }
    }
}

/// Name fragments that mark a PDF as a tax filing rather than a statement
const TAX_NAME_MARKERS: &[&str] = &["налог", "декларац", "910", "913", "920", "tax"];

/// Name fragments that mark a PDF as financial reporting
const FINANCIAL_NAME_MARKERS: &[&str] = &[
    "баланс",
    "фин",
    "отчет о прибыл",
    "оборотно-сальдов",
    "осв",
    "financial",
    "balance sheet",
];

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".bmp", ".tiff", ".webp"];

/// Derive the file category from the original name and mime type.
///
/// Spreadsheets, images and archives are auxiliary financial evidence; PDFs
/// split into taxes / financial / statements by name markers. Only the
/// `statements` PDFs are fed to the extractor.
pub fn categorize_upload(name: &str, mime: &str) -> FileCategory {
    let lower = name.to_lowercase();
    let mime = mime.to_ascii_lowercase();

    let is_pdf = mime == "application/pdf" || lower.ends_with(".pdf");
    if !is_pdf {
        let is_spreadsheet = lower.ends_with(".xlsx")
            || lower.ends_with(".xls")
            || mime.contains("spreadsheet")
            || mime.contains("ms-excel");
        let is_image =
            mime.starts_with("image/") || IMAGE_EXTENSIONS.iter().any(|e| lower.ends_with(e));
        let is_archive = lower.ends_with(".zip") || mime == "application/zip";

        if is_spreadsheet || is_image || is_archive {
            return FileCategory::Financial;
        }
        return FileCategory::Uncategorized;
    }

    if TAX_NAME_MARKERS.iter().any(|m| lower.contains(m)) {
        return FileCategory::Taxes;
    }
    if FINANCIAL_NAME_MARKERS.iter().any(|m| lower.contains(m)) {
        return FileCategory::Financial;
    }
    FileCategory::Statements
}

impl SessionFile {
    /// Insert a file record
    pub async fn insert(pool: &DatabasePool, new_file: &NewSessionFile) -> AppResult<SessionFile> {
        use crate::schema::session_files::dsl;

        let mut conn = pool.get().await?;

        let file = diesel::insert_into(dsl::session_files)
            .values(new_file)
            .get_result::<SessionFile>(&mut conn)
            .await?;

        Ok(file)
    }

    /// All files of one session, oldest first
    pub async fn for_session(pool: &DatabasePool, session_id: &str) -> AppResult<Vec<SessionFile>> {
        use crate::schema::session_files::dsl;

        let mut conn = pool.get().await?;

        let files = dsl::session_files
            .filter(dsl::session_id.eq(session_id))
            .order(dsl::uploaded_at.asc())
            .load::<SessionFile>(&mut conn)
            .await?;

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_pdf_is_a_statement() {
        assert_eq!(
            categorize_upload("stmt-A.pdf", "application/pdf"),
            FileCategory::Statements
        );
    }

    #[test]
    fn test_tax_named_pdf() {
        assert_eq!(
            categorize_upload("Налоговая декларация 910.pdf", "application/pdf"),
            FileCategory::Taxes
        );
        assert_eq!(
            categorize_upload("tax-return-2024.pdf", "application/pdf"),
            FileCategory::Taxes
        );
    }

    #[test]
    fn test_financial_named_pdf() {
        assert_eq!(
            categorize_upload("Баланс 2024.pdf", "application/pdf"),
            FileCategory::Financial
        );
    }

    #[test]
    fn test_auxiliary_files_are_financial() {
        assert_eq!(
            categorize_upload(
                "turnover.xlsx",
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            ),
            FileCategory::Financial
        );
        assert_eq!(categorize_upload("scan.png", "image/png"), FileCategory::Financial);
        assert_eq!(
            categorize_upload("bundle.zip", "application/zip"),
            FileCategory::Financial
        );
    }

    #[test]
    fn test_unknown_files_are_uncategorized() {
        assert_eq!(
            categorize_upload("notes.txt", "text/plain"),
            FileCategory::Uncategorized
        );
    }
}

//! PDF statement-extractor adapter.
//!
//! The external extractor converts statement PDFs into tabular credit
//! transactions. Two interchangeable transports implement the same contract:
//! a subprocess binary and an HTTP endpoint. The orchestrator only sees the
//! `StatementExtractor` trait.
//!
//! The extractor's stdout mixes log lines with the JSON payload; the JSON
//! block is recovered by scanning opening brackets from the end of the
//! output and taking the last block that parses into the expected shape.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use revlens_core::error::{AppError, AppResult};

/// Wall clock per file
pub const EXTRACTOR_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Emitted by the extractor when a statement holds no credit rows; a
/// successful empty result, not a failure.
pub const NO_CREDIT_ROWS_MARKER: &str = "No credit rows found";

/// One PDF handed to the extractor
#[derive(Debug, Clone)]
pub struct PdfPayload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Converted spreadsheet artifact some extractors return alongside the rows
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ExcelArtifact {
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub mime: String,
    /// Base64 payload; not persisted, only the metadata is recorded
    #[serde(default)]
    pub content: Option<String>,
}

/// Per-file result of an extraction batch
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct FileExtraction {
    #[serde(default)]
    pub source_file: String,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub transactions: Vec<Map<String, Value>>,
    #[serde(default)]
    pub excel_file: Option<ExcelArtifact>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Transport-agnostic extractor seam
#[async_trait]
pub trait StatementExtractor: Send + Sync {
    /// Extract credit transactions from a batch of PDFs. Individual file
    /// failures are reported per file; only a whole-batch breakdown errors.
    async fn extract(&self, files: Vec<PdfPayload>) -> AppResult<Vec<FileExtraction>>;
}

// ── Mixed log/JSON stdout recovery ────────────────────────────────────────────

/// Find the closing position matching the opening bracket at `start`.
/// String-aware: brackets inside JSON strings do not count.
fn matching_terminator(bytes: &[u8], start: usize) -> Option<usize> {
    let open = bytes[start];
    let close = match open {
        b'[' => b']',
        b'{' => b'}',
        _ => return None,
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Does a parsed candidate look like extractor output?
fn looks_like_extractor_payload(value: &Value) -> bool {
    let has_known_keys = |obj: &Map<String, Value>| {
        obj.contains_key("source_file")
            || obj.contains_key("transactions")
            || obj.contains_key("error")
            || obj.contains_key("metadata")
    };
    match value {
        Value::Object(obj) => has_known_keys(obj),
        Value::Array(items) => items.iter().all(|item| match item {
            Value::Object(obj) => has_known_keys(obj),
            _ => false,
        }),
        _ => false,
    }
}

/// Recover the JSON block from mixed log/JSON output.
///
/// Every `[`/`{` position is a candidate block start; the first candidate
/// whose matching terminator yields a parseable block of the expected shape
/// wins, which makes the outermost payload win over any array nested inside
/// it. Log lines that happen to start with a bracket fail either the parse
/// or the shape check. A relaxed fallback accepts any parseable
/// array/object so unexpected-but-valid payloads still surface.
pub fn recover_json_block(output: &str) -> Option<Value> {
    let bytes = output.as_bytes();

    let mut relaxed: Option<Value> = None;
    for (start, b) in bytes.iter().enumerate() {
        if *b != b'[' && *b != b'{' {
            continue;
        }
        let Some(end) = matching_terminator(bytes, start) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&output[start..=end]) else {
            continue;
        };
        if looks_like_extractor_payload(&value) {
            return Some(value);
        }
        if relaxed.is_none() && (value.is_array() || value.is_object()) {
            relaxed = Some(value);
        }
    }
    relaxed
}

/// Interpret recovered output for one source file.
fn parse_extractor_output(output: &str, file_name: &str) -> FileExtraction {
    if output.contains(NO_CREDIT_ROWS_MARKER) {
        return FileExtraction {
            source_file: file_name.to_string(),
            ..Default::default()
        };
    }

    let Some(value) = recover_json_block(output) else {
        return FileExtraction {
            source_file: file_name.to_string(),
            error: Some("Extractor produced no parseable JSON output".to_string()),
            ..Default::default()
        };
    };

    let mut items: Vec<FileExtraction> = match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        single => serde_json::from_value(single).ok().into_iter().collect(),
    };

    match items.len() {
        0 => FileExtraction {
            source_file: file_name.to_string(),
            error: Some("Extractor output did not match the expected shape".to_string()),
            ..Default::default()
        },
        1 => {
            let mut item = items.remove(0);
            if item.source_file.is_empty() {
                item.source_file = file_name.to_string();
            }
            item
        }
        _ => {
            // per-file invocation; prefer the element naming this file
            let position = items
                .iter()
                .position(|item| item.source_file == file_name)
                .unwrap_or(0);
            let mut item = items.remove(position);
            if item.source_file.is_empty() {
                item.source_file = file_name.to_string();
            }
            item
        }
    }
}

// ── Subprocess transport ──────────────────────────────────────────────────────

/// Runs the configured extractor binary once per file against a scratch copy
/// of the PDF. The scratch directory lives only for the duration of the call.
pub struct SubprocessExtractor {
    binary: PathBuf,
    timeout: Duration,
}

impl SubprocessExtractor {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            timeout: EXTRACTOR_TIMEOUT,
        }
    }

    pub fn with_timeout(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    async fn extract_one(&self, scratch: &tempfile::TempDir, file: &PdfPayload) -> FileExtraction {
        let safe_name: String = file
            .file_name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let path = scratch.path().join(&safe_name);

        let write_result = async {
            let mut handle = tokio::fs::File::create(&path).await?;
            handle.write_all(&file.bytes).await?;
            handle.flush().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = write_result {
            return FileExtraction {
                source_file: file.file_name.clone(),
                error: Some(format!("Failed to stage PDF for extraction: {}", e)),
                ..Default::default()
            };
        }

        let mut command = tokio::process::Command::new(&self.binary);
        command.arg(&path).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => {
                return FileExtraction {
                    source_file: file.file_name.clone(),
                    error: Some(format!(
                        "Extractor timed out after {}s",
                        self.timeout.as_secs()
                    )),
                    ..Default::default()
                };
            }
            Ok(Err(e)) => {
                return FileExtraction {
                    source_file: file.file_name.clone(),
                    error: Some(format!("Failed to launch extractor: {}", e)),
                    ..Default::default()
                };
            }
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() && !stdout.contains(NO_CREDIT_ROWS_MARKER) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return FileExtraction {
                source_file: file.file_name.clone(),
                error: Some(format!(
                    "Extractor exited with {}: {}",
                    output.status,
                    stderr.trim()
                )),
                ..Default::default()
            };
        }

        parse_extractor_output(&stdout, &file.file_name)
    }
}

#[async_trait]
impl StatementExtractor for SubprocessExtractor {
    async fn extract(&self, files: Vec<PdfPayload>) -> AppResult<Vec<FileExtraction>> {
        let scratch = tempfile::TempDir::new().map_err(|e| {
            AppError::UpstreamUnavailable(format!("Cannot allocate extractor scratch space: {}", e))
        })?;

        let mut results = Vec::with_capacity(files.len());
        for file in &files {
            tracing::debug!(file = %file.file_name, "Running statement extractor");
            results.push(self.extract_one(&scratch, file).await);
        }

        // scratch (and every staged PDF) is removed here on all paths
        drop(scratch);
        Ok(results)
    }
}

// ── HTTP transport ────────────────────────────────────────────────────────────

/// Same contract over an HTTP endpoint accepting multipart PDF uploads.
pub struct HttpExtractor {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpExtractor {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self {
            client,
            url,
            timeout: EXTRACTOR_TIMEOUT,
        }
    }

    pub fn with_timeout(client: reqwest::Client, url: String, timeout: Duration) -> Self {
        Self {
            client,
            url,
            timeout,
        }
    }
}

#[async_trait]
impl StatementExtractor for HttpExtractor {
    async fn extract(&self, files: Vec<PdfPayload>) -> AppResult<Vec<FileExtraction>> {
        let mut results = Vec::with_capacity(files.len());

        for file in files {
            let part = reqwest::multipart::Part::bytes(file.bytes.clone())
                .file_name(file.file_name.clone())
                .mime_str("application/pdf")
                .map_err(|e| AppError::InternalError(format!("Invalid mime: {}", e)))?;
            let form = reqwest::multipart::Form::new().part("files", part);

            let response = self
                .client
                .post(&self.url)
                .multipart(form)
                .timeout(self.timeout)
                .send()
                .await;

            let outcome = match response {
                Err(e) => FileExtraction {
                    source_file: file.file_name.clone(),
                    error: Some(format!("Extractor request failed: {}", e)),
                    ..Default::default()
                },
                Ok(response) if !response.status().is_success() => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    FileExtraction {
                        source_file: file.file_name.clone(),
                        error: Some(format!(
                            "Extractor returned {}: {}",
                            status,
                            body.chars().take(500).collect::<String>()
                        )),
                        ..Default::default()
                    }
                }
                Ok(response) => match response.text().await {
                    Err(e) => FileExtraction {
                        source_file: file.file_name.clone(),
                        error: Some(format!("Extractor response unreadable: {}", e)),
                        ..Default::default()
                    },
                    Ok(body) => parse_extractor_output(&body, &file.file_name),
                },
            };

            results.push(outcome);
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recover_clean_json_array() {
        let output = r#"[{"source_file": "a.pdf", "transactions": [{"Сумма": "500"}]}]"#;
        let value = recover_json_block(output).unwrap();
        assert!(value.is_array());
        assert_eq!(value[0]["source_file"], "a.pdf");
    }

    #[test]
    fn test_recover_json_between_log_lines() {
        let output = concat!(
            "[INFO] starting up\n",
            "[WARN] slow page render [page 3]\n",
            r#"[{"source_file": "a.pdf", "transactions": [{"Сумма": "500", "Дата": "04.03.2024"}]}]"#,
            "\n[INFO] done in 2.3s\n",
        );
        let value = recover_json_block(output).unwrap();
        assert_eq!(value[0]["source_file"], "a.pdf");
        assert_eq!(value[0]["transactions"][0]["Сумма"], "500");
    }

    #[test]
    fn test_recover_single_object() {
        let output = "log line\n{\"source_file\": \"b.pdf\", \"error\": \"Adobe limit\"}\ntrailer";
        let value = recover_json_block(output).unwrap();
        assert_eq!(value["error"], "Adobe limit");
    }

    #[test]
    fn test_recover_handles_brackets_inside_strings() {
        let output = r#"noise [{"source_file": "a.pdf", "transactions": [{"Назначение": "Оплата [счет 5]"}]}] tail"#;
        let value = recover_json_block(output).unwrap();
        assert_eq!(value[0]["transactions"][0]["Назначение"], "Оплата [счет 5]");
    }

    #[test]
    fn test_recover_nothing_parseable() {
        assert!(recover_json_block("plain logs only").is_none());
        assert!(recover_json_block("broken [1, 2").is_none());
    }

    #[test]
    fn test_parse_output_no_credit_rows_marker_is_success() {
        let result = parse_extractor_output("[INFO] No credit rows found\n", "a.pdf");
        assert!(result.error.is_none());
        assert!(result.transactions.is_empty());
        assert_eq!(result.source_file, "a.pdf");
    }

    #[test]
    fn test_parse_output_unparseable_is_per_file_error() {
        let result = parse_extractor_output("garbage without json", "a.pdf");
        assert!(result.error.is_some());
        assert_eq!(result.source_file, "a.pdf");
    }

    #[test]
    fn test_parse_output_assigns_missing_source_file() {
        let output = r#"{"transactions": [{"Сумма": "100"}]}"#;
        let result = parse_extractor_output(output, "stmt.pdf");
        assert_eq!(result.source_file, "stmt.pdf");
        assert_eq!(result.transactions.len(), 1);
    }

    #[test]
    fn test_parse_output_selects_matching_batch_element() {
        let output = json!([
            {"source_file": "other.pdf", "transactions": []},
            {"source_file": "mine.pdf", "transactions": [{"Сумма": "1"}]},
        ])
        .to_string();
        let result = parse_extractor_output(&output, "mine.pdf");
        assert_eq!(result.source_file, "mine.pdf");
        assert_eq!(result.transactions.len(), 1);
    }

    #[test]
    fn test_parse_output_error_element() {
        let output = r#"[{"source_file": "b.pdf", "error": "Adobe limit"}]"#;
        let result = parse_extractor_output(output, "b.pdf");
        assert_eq!(result.error.as_deref(), Some("Adobe limit"));
    }

    #[tokio::test]
    async fn test_subprocess_extractor_missing_binary_is_per_file_error() {
        let extractor =
            SubprocessExtractor::new(PathBuf::from("/nonexistent/statement-extractor"));
        let results = extractor
            .extract(vec![PdfPayload {
                file_name: "a.pdf".to_string(),
                bytes: b"%PDF-1.4".to_vec(),
            }])
            .await
            .expect("batch itself succeeds");
        assert_eq!(results.len(), 1);
        assert!(results[0].error.as_deref().unwrap().contains("launch"));
    }

    #[tokio::test]
    async fn test_subprocess_extractor_runs_binary() {
        // `cat` echoes the staged file path's content; feed it JSON directly
        let payload = r#"[{"source_file": "a.pdf", "transactions": [{"Сумма": "42"}]}]"#.as_bytes();
        let extractor = SubprocessExtractor::new(PathBuf::from("cat"));
        let results = extractor
            .extract(vec![PdfPayload {
                file_name: "a.pdf".to_string(),
                bytes: payload.to_vec(),
            }])
            .await
            .expect("batch succeeds");
        assert_eq!(results.len(), 1);
        assert!(results[0].error.is_none(), "{:?}", results[0].error);
        assert_eq!(results[0].transactions.len(), 1);
    }

    #[tokio::test]
    async fn test_http_extractor_against_mock() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"[{"source_file": "a.pdf", "transactions": [{"Сумма": "500"}]}]"#;
        let mock = server
            .mock("POST", "/extract")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let extractor = HttpExtractor::new(
            reqwest::Client::new(),
            format!("{}/extract", server.url()),
        );
        let results = extractor
            .extract(vec![PdfPayload {
                file_name: "a.pdf".to_string(),
                bytes: b"%PDF-1.4".to_vec(),
            }])
            .await
            .expect("batch succeeds");

        mock.assert_async().await;
        assert_eq!(results[0].transactions.len(), 1);
    }

    #[tokio::test]
    async fn test_http_extractor_server_error_is_per_file() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/extract")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let extractor = HttpExtractor::new(
            reqwest::Client::new(),
            format!("{}/extract", server.url()),
        );
        let results = extractor
            .extract(vec![PdfPayload {
                file_name: "a.pdf".to_string(),
                bytes: b"%PDF-1.4".to_vec(),
            }])
            .await
            .expect("batch succeeds");

        assert!(results[0].error.as_deref().unwrap().contains("500"));
    }
}

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a transaction's revenue/non-revenue label came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassificationSource {
    /// Keyword heuristic decided without review
    Heuristic,
    /// The LLM reviewer returned an explicit decision
    Agent,
    /// Sent for review but no decision came back; conservatively non-revenue
    AgentMissing,
}

impl std::fmt::Display for ClassificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassificationSource::Heuristic => write!(f, "heuristic"),
            ClassificationSource::Agent => write!(f, "agent"),
            ClassificationSource::AgentMissing => write!(f, "agent-missing"),
        }
    }
}

/// One credit-side entry extracted from a statement.
///
/// Transactions live only for the duration of a pipeline run; the durable
/// artifact is the aggregated report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementTransaction {
    /// Stable within a session: `{session_id}_{index}`, 1-based
    pub internal_id: String,
    /// Amount exactly as the extractor emitted it
    pub raw_amount: String,
    /// Canonical non-negative decimal derived from `raw_amount`
    pub amount: BigDecimal,
    pub value_date: Option<DateTime<Utc>>,
    pub purpose: String,
    pub sender: String,
    pub correspondent: String,
    pub bin: Option<String>,
    pub source: ClassificationSource,
    pub reason: String,
    pub possible_non_revenue: bool,
}

impl StatementTransaction {
    /// Combined lowercased text the keyword heuristic runs over
    pub fn classification_text(&self) -> String {
        let mut text = self.purpose.to_lowercase();
        if !self.sender.is_empty() {
            text.push(' ');
            text.push_str(&self.sender.to_lowercase());
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample() -> StatementTransaction {
        StatementTransaction {
            internal_id: "s_1".to_string(),
            raw_amount: "500 000".to_string(),
            amount: BigDecimal::from_str("500000").unwrap(),
            value_date: None,
            purpose: "Оплата по СФ №12".to_string(),
            sender: "ТОО Ромашка".to_string(),
            correspondent: String::new(),
            bin: None,
            source: ClassificationSource::Heuristic,
            reason: String::new(),
            possible_non_revenue: false,
        }
    }

    #[test]
    fn test_classification_text_combines_purpose_and_sender() {
        let tx = sample();
        let text = tx.classification_text();
        assert!(text.contains("оплата по сф №12"));
        assert!(text.contains("тоо ромашка"));
    }

    #[test]
    fn test_source_serializes_kebab_case() {
        let json = serde_json::to_string(&ClassificationSource::AgentMissing).unwrap();
        assert_eq!(json, "\"agent-missing\"");
        assert_eq!(ClassificationSource::AgentMissing.to_string(), "agent-missing");
    }
}

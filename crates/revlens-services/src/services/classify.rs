//! Keyword-based pre-classification of credit transactions.
//!
//! Deterministic partition into revenue / non-revenue / needs-review over the
//! combined purpose and sender text. The marker sets are closed; rule order
//! is significant: terminal-deposit markers dominate so that top-up wording
//! cannot relabel a terminal self-deposit as ambiguous.

use revlens_core::models::StatementTransaction;

/// Markers of cash self-deposits through payment terminals
const TERMINAL_MARKERS: &[&str] = &[
    "cash in",
    "cash-in",
    "терминал id",
    "наличность в терминалах",
    "пополнение через терминал",
    "внесение наличных через терминал",
    "внесение наличных через банкомат",
    "пополнение через банкомат",
];

/// Markers of credit movements that are not sales proceeds
const NON_REVENUE_MARKERS: &[&str] = &[
    "займ",
    "заем",
    "кредит",
    "loan",
    "ссуда",
    "возврат",
    "refund",
    "перевод собственных средств",
    "собственные средства",
    "перевод между счетами",
    "между своими счетами",
    "депозит",
    "deposit",
    "вклад",
    "дивиденд",
    "dividend",
    "заработная плата",
    "зарплата",
    "salary",
    "налог",
    "кпн",
    "ндс",
    "пеня",
    "штраф",
    "penalty",
    "неустойк",
    "госпошлин",
    "субсиди",
    "грант",
    "страхов",
    "insurance",
    "cashback",
    "кэшбэк",
    "вознаграждение по депозиту",
];

/// Markers of sales proceeds; matched against the purpose only
const REVENUE_MARKERS: &[&str] = &[
    "оплата",
    "плата за",
    "payment",
    "invoice",
    "счет-фактур",
    "счет на оплату",
    "сф №",
    "по счету",
    "по договору",
    "договор",
    "contract",
    "поставка",
    "delivery",
    "продаж",
    "реализаци",
    "услуг",
    "товар",
    "выполненные работы",
    "за работы",
    "выручка",
    "revenue",
    "kaspi",
    "wildberries",
    "ozon",
    "маркетплейс",
    "marketplace",
];

/// Top-up/transfer wording that needs counterparty context to judge
const TOPUP_MARKERS: &[&str] = &[
    "пополнение",
    "перевод",
    "перечисление",
    "top-up",
    "top up",
    "topup",
    "transfer",
];

/// Heuristic outcome for a single transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Revenue,
    NonRevenue,
    NeedsReview,
}

#[derive(Debug, Clone)]
pub struct HeuristicDecision {
    pub verdict: Verdict,
    pub reason: String,
}

fn find_marker<'a>(text: &str, markers: &[&'a str]) -> Option<&'a str> {
    markers.iter().find(|m| text.contains(*m)).copied()
}

/// Classify one transaction by the ordered keyword rules.
pub fn classify_transaction(tx: &StatementTransaction) -> HeuristicDecision {
    let purpose = tx.purpose.to_lowercase();
    let combined = tx.classification_text();

    // 1. Nothing to look at
    if purpose.trim().is_empty() && tx.sender.trim().is_empty() {
        return HeuristicDecision {
            verdict: Verdict::NeedsReview,
            reason: "no text".to_string(),
        };
    }

    // 2. Terminal self-deposits dominate every other rule
    if let Some(marker) = find_marker(&combined, TERMINAL_MARKERS) {
        return HeuristicDecision {
            verdict: Verdict::NonRevenue,
            reason: format!("terminal self-deposit: {}", marker),
        };
    }

    // 3. Explicit non-revenue wording
    if let Some(marker) = find_marker(&combined, NON_REVENUE_MARKERS) {
        return HeuristicDecision {
            verdict: Verdict::NonRevenue,
            reason: format!("non-revenue marker: {}", marker),
        };
    }

    // 4. Revenue wording in the purpose
    if let Some(marker) = find_marker(&purpose, REVENUE_MARKERS) {
        return HeuristicDecision {
            verdict: Verdict::Revenue,
            reason: format!("revenue marker: {}", marker),
        };
    }

    // 5. Top-up/transfer without terminal context
    if find_marker(&purpose, TOPUP_MARKERS).is_some() {
        return HeuristicDecision {
            verdict: Verdict::NeedsReview,
            reason: "needs context".to_string(),
        };
    }

    // 6. Nothing matched
    HeuristicDecision {
        verdict: Verdict::NeedsReview,
        reason: "no explicit markers".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use revlens_core::models::ClassificationSource;

    fn tx(purpose: &str, sender: &str) -> StatementTransaction {
        StatementTransaction {
            internal_id: "s_1".to_string(),
            raw_amount: "1000".to_string(),
            amount: BigDecimal::from(1000),
            value_date: None,
            purpose: purpose.to_string(),
            sender: sender.to_string(),
            correspondent: String::new(),
            bin: None,
            source: ClassificationSource::Heuristic,
            reason: String::new(),
            possible_non_revenue: false,
        }
    }

    #[test]
    fn test_empty_text_needs_review() {
        let decision = classify_transaction(&tx("", ""));
        assert_eq!(decision.verdict, Verdict::NeedsReview);
        assert_eq!(decision.reason, "no text");
    }

    #[test]
    fn test_terminal_deposit_is_non_revenue() {
        let decision = classify_transaction(&tx("Cash In Терминал ID 42", ""));
        assert_eq!(decision.verdict, Verdict::NonRevenue);
        assert!(decision.reason.starts_with("terminal self-deposit"));
    }

    #[test]
    fn test_terminal_rule_beats_topup_rule() {
        // "пополнение" alone is ambiguous, but terminal context decides
        let decision = classify_transaction(&tx("Пополнение через терминал 77", ""));
        assert_eq!(decision.verdict, Verdict::NonRevenue);
        assert!(decision.reason.starts_with("terminal self-deposit"));
    }

    #[test]
    fn test_non_revenue_markers() {
        for purpose in [
            "Возврат займа по договору 5",
            "Получение кредита",
            "Перевод собственных средств",
            "Дивиденды за 2023",
            "Заработная плата за март",
            "Возврат НДС",
        ] {
            let decision = classify_transaction(&tx(purpose, ""));
            assert_eq!(decision.verdict, Verdict::NonRevenue, "{}", purpose);
        }
    }

    #[test]
    fn test_revenue_markers() {
        for purpose in [
            "Оплата по СФ №12",
            "Оплата за услуги",
            "Оплата по договору",
            "Payment for invoice 77",
            "Выручка за смену",
        ] {
            let decision = classify_transaction(&tx(purpose, ""));
            assert_eq!(decision.verdict, Verdict::Revenue, "{}", purpose);
        }
    }

    #[test]
    fn test_sender_text_feeds_non_revenue_rules() {
        let decision = classify_transaction(&tx("Поступление средств", "АО Депозит-Банк"));
        assert_eq!(decision.verdict, Verdict::NonRevenue);
    }

    #[test]
    fn test_topup_needs_context() {
        let decision = classify_transaction(&tx("Пополнение счета от ИП Ахметов", ""));
        assert_eq!(decision.verdict, Verdict::NeedsReview);
        assert_eq!(decision.reason, "needs context");
    }

    #[test]
    fn test_unmarked_text_needs_review() {
        let decision = classify_transaction(&tx("Прочее поступление средств", ""));
        assert_eq!(decision.verdict, Verdict::NeedsReview);
        assert_eq!(decision.reason, "no explicit markers");
    }

    #[test]
    fn test_rule_order_non_revenue_before_revenue() {
        // carries both "возврат" and "оплата"; rule 3 wins
        let decision = classify_transaction(&tx("Возврат оплаты по СФ №9", ""));
        assert_eq!(decision.verdict, Verdict::NonRevenue);
    }
}

//! Ei's daily ceremony message — formatting only, no LLM involved.

/// One pending confirmation, already summarized by the enqueuing handler.
#[derive(Debug, Clone)]
pub struct PendingValidation {
    pub index: usize,
    pub summary: String,
    pub proposed_by: String,
}

/// Render the batched "Daily Confirmations" message. At most five items per
/// ceremony; the caller passes the batch it actually drained.
pub fn build_daily_ceremony_message(pending: &[PendingValidation]) -> String {
    let mut lines = vec![
        "Daily confirmations — a few things I'd like to check with you:".to_string(),
    ];
    for item in pending.iter().take(5) {
        lines.push(format!(
            "{}. {} (noted by {})",
            item.index, item.summary, item.proposed_by
        ));
    }
    lines.push(
        "For each: keep it shared, keep it just between you and that persona, \
         or drop it? Answer in your own words — e.g. \"keep 1, drop 2\"."
            .to_string(),
    );
    lines.join("\n")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(n: usize) -> Vec<PendingValidation> {
        (1..=n)
            .map(|i| PendingValidation {
                index: i,
                summary: format!("item {i}"),
                proposed_by: "muse".to_string(),
            })
            .collect()
    }

    #[test]
    fn lists_each_item_numbered() {
        let message = build_daily_ceremony_message(&pending(2));
        assert!(message.contains("1. item 1"));
        assert!(message.contains("2. item 2"));
        assert!(message.contains("noted by muse"));
    }

    #[test]
    fn caps_at_five_items() {
        let message = build_daily_ceremony_message(&pending(8));
        assert!(message.contains("5. item 5"));
        assert!(!message.contains("6. item 6"));
    }
}

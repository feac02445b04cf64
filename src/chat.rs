//! Prompt assembly for the market assistant and the LLM seam.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retrieval::ScoredRecord;

pub const SYSTEM_PROMPT: &str = "You are a crypto trading assistant.";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat message is empty")]
    EmptyMessage,
    #[error("chat backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyCount {
    pub flagged: usize,
    pub scored: usize,
}

/// Signals that are currently available; missing models are simply absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSummary {
    pub latest_close: Option<f64>,
    pub predictions: BTreeMap<String, f64>,
    pub anomalies: BTreeMap<String, AnomalyCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub reply: String,
    pub context: String,
    pub sources: Vec<ScoredRecord>,
}

/// External completion backend.
pub trait ChatLlm: Send + Sync {
    fn complete(&self, context: &str, message: &str) -> Result<String, ChatError>;
}

pub fn build_chat_context(summary: &MarketSummary, retrieved: &[ScoredRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{SYSTEM_PROMPT}");

    if let Some(close) = summary.latest_close {
        let _ = writeln!(out, "Latest close: {close:.2}");
    }
    for (kind, value) in &summary.predictions {
        let _ = writeln!(out, "Prediction ({kind}): {value:.2}");
    }
    for (kind, count) in &summary.anomalies {
        let _ = writeln!(
            out,
            "Anomalies ({kind}): {} of {} rows flagged",
            count.flagged, count.scored
        );
    }

    if !retrieved.is_empty() {
        let _ = writeln!(out, "Relevant notes:");
        for (idx, record) in retrieved.iter().enumerate() {
            let _ = writeln!(out, "[{}] ({:.3}) {}", idx + 1, record.score, record.text);
        }
    }
    out
}

/// Offline backend that echoes the assembled context back as the answer.
#[derive(Debug, Clone, Default)]
pub struct TemplateResponder;

impl ChatLlm for TemplateResponder {
    fn complete(&self, context: &str, message: &str) -> Result<String, ChatError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let facts: Vec<&str> = context
            .lines()
            .skip(1)
            .filter(|line| !line.trim().is_empty())
            .collect();
        if facts.is_empty() {
            return Ok(format!(
                "No market signals are available yet to answer \"{message}\". Train the models first."
            ));
        }
        Ok(format!(
            "Regarding \"{message}\":\n{}",
            facts
                .iter()
                .map(|line| format!("- {line}"))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_lists_signals_and_sources() {
        let mut summary = MarketSummary {
            latest_close: Some(64_250.5),
            ..MarketSummary::default()
        };
        summary.predictions.insert("random_forest".to_string(), 64_300.0);
        summary.anomalies.insert(
            "density".to_string(),
            AnomalyCount {
                flagged: 3,
                scored: 150,
            },
        );
        let sources = vec![ScoredRecord {
            score: 0.91,
            text: "Funding rates flipped negative".to_string(),
            metadata: BTreeMap::new(),
        }];

        let context = build_chat_context(&summary, &sources);
        assert!(context.starts_with(SYSTEM_PROMPT));
        assert!(context.contains("Prediction (random_forest): 64300.00"));
        assert!(context.contains("3 of 150 rows flagged"));
        assert!(context.contains("[1] (0.910) Funding rates flipped negative"));
    }

    #[test]
    fn template_responder_rejects_blank_message() {
        let responder = TemplateResponder;
        assert!(matches!(
            responder.complete(SYSTEM_PROMPT, "   "),
            Err(ChatError::EmptyMessage)
        ));
        let reply = responder.complete(SYSTEM_PROMPT, "what now?").unwrap();
        assert!(reply.contains("No market signals"));
    }
}

//! AI classification pipeline
//!
//! Builds a prompt from the taxonomy and the user's correction history,
//! asks the local LLM endpoint for a JSON verdict, and normalizes the
//! result into a [`Classification`]. A malformed reply gets one retry
//! with a tightened instruction; a second failure yields an empty
//! classification rather than blocking sync.

mod taxonomy;

pub use taxonomy::Taxonomy;

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use config::AiConfig;

use crate::models::{Classification, EmailAddress, Feedback, Priority};

/// Hard timeout on the LLM call
const LLM_TIMEOUT: Duration = Duration::from_secs(30);
/// Body excerpt included in the prompt
const MAX_BODY_CHARS: usize = 3000;
/// Few-shot examples included in the prompt
const MAX_EXAMPLES: usize = 5;
/// Tags kept after normalization
const MAX_TAGS: usize = 3;
/// Confidence assumed when the model omits it
const DEFAULT_CONFIDENCE: f32 = 0.8;

/// Everything the classifier needs to know about one message
#[derive(Debug, Clone)]
pub struct ClassifyInput {
    pub message_id: i64,
    pub subject: String,
    pub sender: EmailAddress,
    pub recipients: Vec<EmailAddress>,
    pub received_at: DateTime<Utc>,
    pub snippet: String,
    /// First part of the full body when already cached
    pub body: Option<String>,
    /// Correction history, most relevant first
    pub examples: Vec<Feedback>,
}

/// Seam between the sync engine and the model runtime
pub trait Classify: Send + Sync {
    fn classify(&self, input: &ClassifyInput) -> Result<Classification>;
}

/// Classifier backed by an Ollama-style local endpoint
pub struct LlmClassifier {
    endpoint: String,
    model: String,
    temperature: f32,
    taxonomy: Taxonomy,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'a str,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// The JSON shape the model is instructed to produce
#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    action_required: bool,
    #[serde(default)]
    can_archive: bool,
    #[serde(default)]
    confidence: Option<f32>,
}

impl LlmClassifier {
    pub fn new(ai: &AiConfig) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(LLM_TIMEOUT))
            .build()
            .new_agent();
        Self {
            endpoint: ai.endpoint.trim_end_matches('/').to_string(),
            model: ai.model.clone(),
            temperature: ai.temperature,
            taxonomy: Taxonomy::from_config(ai),
            agent,
        }
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    fn invoke(&self, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            format: "json",
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };
        let mut response = self
            .agent
            .post(&format!("{}/api/generate", self.endpoint))
            .send_json(&request)
            .context("LLM endpoint request failed")?;
        let parsed: GenerateResponse = response
            .body_mut()
            .read_json()
            .context("LLM endpoint returned a malformed envelope")?;
        Ok(parsed.response)
    }
}

impl Classify for LlmClassifier {
    fn classify(&self, input: &ClassifyInput) -> Result<Classification> {
        let prompt = build_prompt(input, &self.taxonomy, false);
        let reply = self.invoke(&prompt)?;

        let verdict = match parse_verdict(&reply) {
            Ok(v) => v,
            Err(first_error) => {
                warn!(
                    "Model reply for message {} was not valid JSON ({first_error}); retrying",
                    input.message_id
                );
                let tightened = build_prompt(input, &self.taxonomy, true);
                let reply = self.invoke(&tightened)?;
                match parse_verdict(&reply) {
                    Ok(v) => v,
                    Err(second_error) => {
                        warn!(
                            "Model reply for message {} invalid twice ({second_error}); storing empty classification",
                            input.message_id
                        );
                        return Ok(Classification::empty(input.message_id, &self.model));
                    }
                }
            }
        };

        Ok(classification_from_verdict(
            input.message_id,
            verdict,
            &self.taxonomy,
            &self.model,
        ))
    }
}

/// Assemble the prompt: instructions, taxonomy, correction history,
/// the email, and the output schema
fn build_prompt(input: &ClassifyInput, taxonomy: &Taxonomy, tightened: bool) -> String {
    let mut prompt = String::with_capacity(2048);

    prompt.push_str(
        "You are an email triage assistant. Read the email below and classify it: \
         choose the most fitting tags, judge its priority, decide whether the user \
         must act on it, and whether it could be archived without harm.\n\n",
    );

    prompt.push_str("Allowed tags:\n");
    for entry in taxonomy.entries() {
        prompt.push_str(&format!("- {}: {}\n", entry.name, entry.description));
    }

    if !input.examples.is_empty() {
        prompt.push_str("\nUser Preference History:\n");
        for example in input.examples.iter().take(MAX_EXAMPLES) {
            prompt.push_str(&format!(
                "- From: {} / Subject: {} / AI proposed: [{}] / User corrected to: [{}]\n",
                example.sender_domain,
                example.subject_pattern,
                example.original_tags.join(", "),
                example.corrected_tags.join(", "),
            ));
        }
    }

    prompt.push_str("\nEmail:\n");
    prompt.push_str(&format!("From: {}\n", input.sender.display()));
    if !input.recipients.is_empty() {
        let to = input
            .recipients
            .iter()
            .map(|r| r.display())
            .collect::<Vec<_>>()
            .join(", ");
        prompt.push_str(&format!("To: {to}\n"));
    }
    prompt.push_str(&format!("Date: {}\n", input.received_at.to_rfc3339()));
    prompt.push_str(&format!("Subject: {}\n", input.subject));
    prompt.push_str("Body:\n");
    match &input.body {
        Some(body) => {
            let excerpt: String = body.chars().take(MAX_BODY_CHARS).collect();
            prompt.push_str(&excerpt);
        }
        None => prompt.push_str(&input.snippet),
    }

    prompt.push_str(
        "\n\nRespond with a single JSON object of the form \
         {\"tags\": [\"tag\"], \"priority\": \"high\" or \"normal\", \
         \"action_required\": true or false, \"can_archive\": true or false, \
         \"confidence\": 0.0 to 1.0}. \
         Use at most 3 tags, all drawn from the allowed tags above.",
    );
    if tightened {
        prompt.push_str(
            "\nYour previous reply was not valid JSON. Output ONLY the JSON object, \
             with no prose, no code fences, and no explanation.",
        );
    }
    prompt
}

fn parse_verdict(reply: &str) -> Result<Verdict, serde_json::Error> {
    serde_json::from_str(reply.trim())
}

/// Normalize a verdict: tags lowercased, trimmed, deduplicated, filtered
/// to the taxonomy, and capped; absent confidence defaults to 0.8
fn classification_from_verdict(
    message_id: i64,
    verdict: Verdict,
    taxonomy: &Taxonomy,
    model: &str,
) -> Classification {
    let mut tags: Vec<String> = Vec::new();
    for raw in verdict.tags {
        let tag = raw.trim().to_ascii_lowercase();
        if tag.is_empty() || tags.contains(&tag) {
            continue;
        }
        if !taxonomy.contains(&tag) {
            warn!("Model emitted tag {tag:?} outside the taxonomy; dropping");
            continue;
        }
        tags.push(tag);
        if tags.len() >= MAX_TAGS {
            break;
        }
    }

    let priority = match verdict.priority.as_deref() {
        Some("high") => Priority::High,
        _ => Priority::Normal,
    };
    let confidence = verdict
        .confidence
        .unwrap_or(DEFAULT_CONFIDENCE)
        .clamp(0.0, 1.0);

    Classification {
        message_id,
        tags,
        priority,
        action_required: verdict.action_required,
        can_archive: verdict.can_archive,
        confidence,
        model: model.to_string(),
        classified_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_with_examples(examples: Vec<Feedback>) -> ClassifyInput {
        ClassifyInput {
            message_id: 1,
            subject: "Invoice #1047 due".to_string(),
            sender: EmailAddress::new("billing@acme.com"),
            recipients: vec![EmailAddress::new("me@example.com")],
            received_at: Utc::now(),
            snippet: "Your invoice is attached.".to_string(),
            body: None,
            examples,
        }
    }

    fn example(domain: &str, original: &[&str], corrected: &[&str]) -> Feedback {
        Feedback {
            id: 1,
            account_id: "a1".to_string(),
            message_id: Some(1),
            sender_domain: domain.to_string(),
            subject_pattern: "build failed for run #".to_string(),
            original_tags: original.iter().map(|s| s.to_string()).collect(),
            corrected_tags: corrected.iter().map(|s| s.to_string()).collect(),
            context: String::new(),
            created_at: Utc::now(),
            used_count: 0,
        }
    }

    #[test]
    fn test_prompt_contains_taxonomy_and_email() {
        let taxonomy = Taxonomy::from_config(&AiConfig::default());
        let prompt = build_prompt(&input_with_examples(vec![]), &taxonomy, false);
        assert!(prompt.contains("- finance:"));
        assert!(prompt.contains("Subject: Invoice #1047 due"));
        assert!(prompt.contains("billing@acme.com"));
        assert!(!prompt.contains("User Preference History"));
    }

    #[test]
    fn test_prompt_includes_preference_history() {
        let taxonomy = Taxonomy::from_config(&AiConfig::default());
        let examples = vec![
            example("github.com", &["dev"], &["dev", "work"]),
            example("github.com", &["dev"], &["dev", "work"]),
        ];
        let prompt = build_prompt(&input_with_examples(examples), &taxonomy, false);
        assert!(prompt.contains("User Preference History"));
        assert_eq!(prompt.matches("User corrected to: [dev, work]").count(), 2);
    }

    #[test]
    fn test_tightened_prompt_adds_instruction() {
        let taxonomy = Taxonomy::from_config(&AiConfig::default());
        let prompt = build_prompt(&input_with_examples(vec![]), &taxonomy, true);
        assert!(prompt.contains("ONLY the JSON object"));
    }

    #[test]
    fn test_verdict_normalization() {
        let taxonomy = Taxonomy::from_config(&AiConfig::default());
        let verdict: Verdict = serde_json::from_str(
            r#"{"tags": [" Finance ", "invoice", "finance", "made-up", "work", "dev"],
                "priority": "high", "action_required": true,
                "can_archive": false, "confidence": 0.92}"#,
        )
        .unwrap();
        let c = classification_from_verdict(7, verdict, &taxonomy, "test-model");
        assert_eq!(c.tags, vec!["finance", "invoice", "work"]);
        assert_eq!(c.priority, Priority::High);
        assert!(c.action_required);
        assert_eq!(c.confidence, 0.92);
        assert_eq!(c.message_id, 7);
    }

    #[test]
    fn test_confidence_defaults_and_clamps() {
        let taxonomy = Taxonomy::from_config(&AiConfig::default());
        let verdict: Verdict = serde_json::from_str(r#"{"tags": ["work"]}"#).unwrap();
        let c = classification_from_verdict(1, verdict, &taxonomy, "m");
        assert_eq!(c.confidence, 0.8);

        let verdict: Verdict =
            serde_json::from_str(r#"{"tags": ["work"], "confidence": 3.5}"#).unwrap();
        let c = classification_from_verdict(1, verdict, &taxonomy, "m");
        assert_eq!(c.confidence, 1.0);
    }

    #[test]
    fn test_unknown_priority_falls_back_to_normal() {
        let taxonomy = Taxonomy::from_config(&AiConfig::default());
        let verdict: Verdict =
            serde_json::from_str(r#"{"tags": [], "priority": "urgent"}"#).unwrap();
        let c = classification_from_verdict(1, verdict, &taxonomy, "m");
        assert_eq!(c.priority, Priority::Normal);
    }

    #[test]
    fn test_parse_verdict_rejects_prose() {
        assert!(parse_verdict("Sure! Here is the JSON: {\"tags\": []}").is_err());
        assert!(parse_verdict(r#"{"tags": []}"#).is_ok());
    }
}

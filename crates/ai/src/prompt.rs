//! Prompt construction and response parsing for incident summarization.
//!
//! The prompt layer only ever sees redacted events; callers run the PII
//! redactor before bundling.

use serde::Deserialize;

use opspulse_core::{Event, Incident};

use crate::error::AiError;

/// Role preamble sent as the system message.
pub const SYSTEM_PROMPT: &str = "You are a senior SRE incident analyst. You receive clustered \
operational events and produce concise, actionable incident summaries. Base every statement on \
the provided events; do not invent services, metrics, or causes. Respond with a single JSON \
object and nothing else.";

/// One incident plus the (redacted) events backing it.
#[derive(Debug, Clone)]
pub struct IncidentBundle {
    pub incident: Incident,
    pub events: Vec<Event>,
}

/// Parsed model output for one incident.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentSummary {
    /// Present in batch responses, absent in single-incident ones.
    #[serde(default)]
    pub incident_id: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub impact: String,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
}

impl IncidentSummary {
    /// Collapse into the text stored on the incident: summary plus an
    /// impact sentence when the model provided one.
    pub fn summary_text(&self) -> String {
        if self.impact.trim().is_empty() {
            self.summary.clone()
        } else {
            format!("{}\n\nImpact: {}", self.summary, self.impact)
        }
    }
}

fn describe_incident(bundle: &IncidentBundle, out: &mut String) {
    let incident = &bundle.incident;
    let services: Vec<&str> = incident
        .affected_services
        .iter()
        .map(|s| s.as_str())
        .collect();
    let (first, last) = bundle
        .events
        .iter()
        .fold(None::<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)>, |acc, e| {
            Some(match acc {
                None => (e.timestamp, e.timestamp),
                Some((lo, hi)) => (lo.min(e.timestamp), hi.max(e.timestamp)),
            })
        })
        .unwrap_or((incident.created_at, incident.updated_at));
    let max_severity = bundle
        .events
        .iter()
        .map(|e| e.severity.get())
        .max()
        .unwrap_or(incident.severity_score);

    out.push_str(&format!(
        "Incident {id}\n\
         Services: {services}\n\
         Time range: {first} .. {last}\n\
         Event count: {count}\n\
         Max severity: {max_severity}\n\
         Events (redacted):\n{events}\n\n",
        id = incident.incident_id,
        services = services.join(", "),
        first = first.to_rfc3339(),
        last = last.to_rfc3339(),
        count = bundle.events.len(),
        events = serde_json::to_string_pretty(&bundle.events)
            .unwrap_or_else(|_| "[]".to_string()),
    ));
}

/// Batch prompt: several incidents, one JSON object back.
pub fn build_batch_prompt(bundles: &[IncidentBundle]) -> String {
    let mut out = String::from(
        "Analyze the following incidents and summarize each one.\n\n",
    );
    for bundle in bundles {
        describe_incident(bundle, &mut out);
    }
    out.push_str(
        "Respond with exactly one JSON object of the form:\n\
         {\"incidents\": [{\"incidentId\": \"...\", \"summary\": \"...\", \
         \"rootCause\": \"...\", \"impact\": \"...\", \"suggestedActions\": [\"...\"]}]}\n\
         Include every incident id listed above exactly once.",
    );
    out
}

/// Single-incident prompt: same fields, flat object.
pub fn build_single_prompt(bundle: &IncidentBundle) -> String {
    let mut out = String::from("Analyze the following incident and summarize it.\n\n");
    describe_incident(bundle, &mut out);
    out.push_str(
        "Respond with exactly one JSON object of the form:\n\
         {\"summary\": \"...\", \"rootCause\": \"...\", \"impact\": \"...\", \
         \"suggestedActions\": [\"...\"]}",
    );
    out
}

/// Pull the JSON object out of a reply that may carry code fences or prose.
fn extract_json(text: &str) -> Result<&str, AiError> {
    let start = text
        .find('{')
        .ok_or_else(|| AiError::Parse("no JSON object in response".to_string()))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| AiError::Parse("unterminated JSON object".to_string()))?;
    if end < start {
        return Err(AiError::Parse("malformed JSON object".to_string()));
    }
    Ok(&text[start..=end])
}

pub fn parse_batch_response(text: &str) -> Result<Vec<IncidentSummary>, AiError> {
    #[derive(Deserialize)]
    struct BatchResponse {
        incidents: Vec<IncidentSummary>,
    }
    let json = extract_json(text)?;
    let parsed: BatchResponse =
        serde_json::from_str(json).map_err(|e| AiError::Parse(e.to_string()))?;
    Ok(parsed.incidents)
}

pub fn parse_single_response(text: &str) -> Result<IncidentSummary, AiError> {
    let json = extract_json(text)?;
    serde_json::from_str(json).map_err(|e| AiError::Parse(e.to_string()))
}

/// Deterministic local summary used whenever the model is unavailable or
/// skipped an incident.
pub fn fallback_summary(incident: &Incident) -> IncidentSummary {
    let services: Vec<&str> = incident
        .affected_services
        .iter()
        .map(|s| s.as_str())
        .collect();
    IncidentSummary {
        incident_id: Some(incident.incident_id.to_string()),
        summary: format!(
            "{} events detected across {}. AI summary unavailable.",
            incident.event_ids.len(),
            services.join(", "),
        ),
        root_cause: "Not determined (automatic analysis unavailable).".to_string(),
        impact: String::new(),
        suggested_actions: vec![
            "Review the raw events attached to this incident".to_string(),
            "Check the affected services' dashboards and recent deploys".to_string(),
            "Escalate to the on-call owner if errors persist".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    use opspulse_core::{EventId, Severity};

    fn bundle() -> IncidentBundle {
        let incident = Incident::new(
            vec![EventId::new(), EventId::new()],
            4,
            BTreeSet::from(["orders".to_string(), "billing".to_string()]),
            "2 DeadlockDetected events from orders. Severity: HIGH".to_string(),
        );
        let events = vec![
            Event::new("orders", Severity::clamped(4), json!({"errorType": "DeadlockDetected"})),
            Event::new("orders", Severity::clamped(2), json!({"errorType": "DeadlockDetected"})),
        ];
        IncidentBundle { incident, events }
    }

    #[test]
    fn batch_prompt_lists_ids_and_shape() {
        let b = bundle();
        let id = b.incident.incident_id.to_string();
        let prompt = build_batch_prompt(std::slice::from_ref(&b));
        assert!(prompt.contains(&id));
        assert!(prompt.contains("Event count: 2"));
        assert!(prompt.contains("Max severity: 4"));
        assert!(prompt.contains("\"incidents\""));
        assert!(prompt.contains("billing, orders"));
    }

    #[test]
    fn parses_batch_response_with_code_fences() {
        let text = "```json\n{\"incidents\": [{\"incidentId\": \"abc\", \"summary\": \"db deadlocks\", \"rootCause\": \"lock contention\", \"impact\": \"checkout latency\", \"suggestedActions\": [\"add retry\"]}]}\n```";
        let parsed = parse_batch_response(text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].incident_id.as_deref(), Some("abc"));
        assert_eq!(parsed[0].suggested_actions, vec!["add retry"]);
        assert_eq!(
            parsed[0].summary_text(),
            "db deadlocks\n\nImpact: checkout latency"
        );
    }

    #[test]
    fn parses_single_response_without_id() {
        let text = "{\"summary\": \"s\", \"rootCause\": \"r\", \"impact\": \"\", \"suggestedActions\": []}";
        let parsed = parse_single_response(text).unwrap();
        assert!(parsed.incident_id.is_none());
        assert_eq!(parsed.summary_text(), "s");
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(parse_batch_response("the service is down, sorry").is_err());
        assert!(parse_batch_response("{\"incidents\": 7}").is_err());
    }

    #[test]
    fn fallback_matches_expected_shape() {
        let b = bundle();
        let fallback = fallback_summary(&b.incident);
        assert_eq!(
            fallback.summary,
            "2 events detected across billing, orders. AI summary unavailable."
        );
        assert_eq!(fallback.suggested_actions.len(), 3);
        assert!(!fallback.root_cause.is_empty());
    }
}

//! Research Workflow: a concrete six-step instantiation of the workflow
//! engine — clarify, search, synthesize, structure, write, finalize —
//! wired onto the `BackendRouter`.
//!
//! Grounded in `research_workflow.py::build_research_workflow`'s step
//! sequence (clarify -> gather -> synthesize -> structure -> write ->
//! finalize), re-expressed as plain async functions over `BackendRouter`
//! instead of the original's bespoke `AgentWorkflow.add_step` builder.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::backend::router::BackendRouter;
use crate::backend::GenerateTextParams;
use crate::error::GatewayError;
use crate::workflow::{step_fn, StepContext, Workflow, WorkflowStep};

const CLARIFY_SYSTEM_PROMPT: &str = "You restate the user's research question more precisely, flagging and correcting any loaded or biased framing. Respond with only the restated question.";

/// Heuristic gate for "short and unambiguous": fewer than 10 words and no
/// loaded-terms hit. The loaded-terms list is a small, deliberately
/// conservative set of words that tend to signal a leading or
/// emotionally-charged framing.
const LOADED_TERMS: &[&str] = &["best", "worst", "always", "never", "obviously", "clearly"];

fn is_short_and_unambiguous(query: &str) -> bool {
    let word_count = query.split_whitespace().count();
    let lower = query.to_lowercase();
    word_count < 10 && !LOADED_TERMS.iter().any(|term| lower.contains(term))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub uri: String,
    pub snippet: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub heading: String,
    pub prompts: Vec<String>,
}

/// Entry input to the workflow: the raw user query. `clarified_query`
/// starts out equal to `raw_query` so a skipped clarify step leaves
/// downstream steps a usable input.
pub fn initial_input(raw_query: &str) -> serde_json::Value {
    json!({ "raw_query": raw_query, "clarified_query": raw_query })
}

fn input_error(step: &str) -> GatewayError {
    GatewayError::Internal(format!("research workflow step '{step}' received malformed input"))
}

/// An operator-supplied `Modification::Direction`, if one was merged into
/// the context before this step ran.
fn ctx_direction(ctx: &StepContext) -> Option<&str> {
    ctx.get("direction").and_then(|v| v.as_str())
}

/// An operator-supplied `Modification::Parameters` object, if one was
/// merged into the context before this step ran.
fn ctx_parameters(ctx: &StepContext) -> Option<&serde_json::Value> {
    ctx.get("parameters")
}

async fn clarify_step(
    router: Arc<BackendRouter>,
    model: String,
    input: serde_json::Value,
    ctx: StepContext,
) -> Result<serde_json::Value, GatewayError> {
    let raw_query = input
        .get("raw_query")
        .and_then(|v| v.as_str())
        .ok_or_else(|| input_error("clarify"))?;

    let system_prompt = match ctx_direction(&ctx) {
        Some(direction) => format!("{CLARIFY_SYSTEM_PROMPT} Additional operator guidance: {direction}"),
        None => CLARIFY_SYSTEM_PROMPT.to_string(),
    };

    let (output, backend_used) = router
        .generate_text(&model, raw_query, Some(&system_prompt), &GenerateTextParams::default())
        .await?;

    Ok(json!({
        "raw_query": raw_query,
        "clarified_query": output.text.trim(),
        "backend_used": { "clarify": backend_used },
    }))
}

async fn search_step(
    router: Arc<BackendRouter>,
    max_results: usize,
    input: serde_json::Value,
    ctx: StepContext,
) -> Result<serde_json::Value, GatewayError> {
    let clarified_query = input
        .get("clarified_query")
        .and_then(|v| v.as_str())
        .ok_or_else(|| input_error("search"))?
        .to_string();
    let region = ctx_parameters(&ctx).and_then(|p| p.get("region")).and_then(|v| v.as_str());

    let (results, backend_used) = router.search_web(&clarified_query, max_results, region, true).await?;
    let hits: Vec<SearchHit> = results
        .into_iter()
        .map(|r| SearchHit {
            title: r.title,
            uri: r.uri,
            snippet: r.snippet,
            score: r.score,
        })
        .collect();

    let mut out = input;
    out["search_results"] = serde_json::to_value(&hits)?;
    out["backend_used"]["search"] = json!(backend_used);
    Ok(out)
}

fn render_search_document(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|h| format!("- {} ({}): {}", h.title, h.uri, h.snippet))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `Modification::Parameters({"summary_target_length": "brief"})` asks for a
/// noticeably shorter synthesis than the default; anything else (or no
/// parameters at all) falls back to the unconstrained prose synthesis.
fn wants_brief_summary(ctx: &StepContext) -> bool {
    ctx_parameters(ctx)
        .and_then(|p| p.get("summary_target_length"))
        .and_then(|v| v.as_str())
        == Some("brief")
}

async fn synthesize_step(
    router: Arc<BackendRouter>,
    model: String,
    input: serde_json::Value,
    ctx: StepContext,
) -> Result<serde_json::Value, GatewayError> {
    let clarified_query = input
        .get("clarified_query")
        .and_then(|v| v.as_str())
        .ok_or_else(|| input_error("synthesize"))?;
    let hits: Vec<SearchHit> = serde_json::from_value(
        input.get("search_results").cloned().ok_or_else(|| input_error("synthesize"))?,
    )?;
    let document = render_search_document(&hits);
    let instruction = if wants_brief_summary(&ctx) {
        "Write a brief synthesis of what these sources establish, at most 3 sentences."
    } else {
        "Write a prose synthesis of what these sources establish."
    };
    let mut prompt = format!("Research question: {clarified_query}\n\nSources:\n{document}\n\n{instruction}");
    if let Some(direction) = ctx_direction(&ctx) {
        prompt.push_str(&format!("\n\nAdditional operator guidance: {direction}"));
    }

    let (output, backend_used) = router
        .generate_text(&model, &prompt, None, &GenerateTextParams::default())
        .await?;

    let mut out = input;
    out["synthesis"] = json!(output.text);
    out["backend_used"]["synthesize"] = json!(backend_used);
    Ok(out)
}

async fn structure_step(
    router: Arc<BackendRouter>,
    model: String,
    input: serde_json::Value,
    ctx: StepContext,
) -> Result<serde_json::Value, GatewayError> {
    let synthesis = input
        .get("synthesis")
        .and_then(|v| v.as_str())
        .ok_or_else(|| input_error("structure"))?;
    let mut prompt = format!(
        "Based on this synthesis, propose a sectioned outline. Respond as JSON: an array of {{\"heading\": string, \"prompts\": [string]}}.\n\nSynthesis:\n{synthesis}"
    );
    if let Some(direction) = ctx_direction(&ctx) {
        prompt.push_str(&format!("\n\nAdditional operator guidance: {direction}"));
    }

    let (output, backend_used) = router
        .generate_text(&model, &prompt, None, &GenerateTextParams::default())
        .await?;

    let sections: Vec<Section> = serde_json::from_str(output.text.trim()).unwrap_or_else(|_| {
        vec![Section {
            heading: "Findings".to_string(),
            prompts: vec![synthesis.to_string()],
        }]
    });

    let mut out = input;
    out["sections"] = serde_json::to_value(&sections)?;
    out["backend_used"]["structure"] = json!(backend_used);
    Ok(out)
}

async fn write_step(
    router: Arc<BackendRouter>,
    model: String,
    input: serde_json::Value,
    ctx: StepContext,
) -> Result<serde_json::Value, GatewayError> {
    let sections: Vec<Section> = serde_json::from_value(
        input.get("sections").cloned().ok_or_else(|| input_error("write"))?,
    )?;
    let brief = wants_brief_summary(&ctx);
    let extra_direction = ctx_direction(&ctx);

    let mut written = Vec::with_capacity(sections.len());
    let mut last_backend = String::new();
    for section in &sections {
        let length_hint = if brief { "one short paragraph" } else { "a few paragraphs" };
        let mut prompt = format!(
            "Expand this section heading into {}: {}\nGuidance: {}",
            length_hint,
            section.heading,
            section.prompts.join("; ")
        );
        if let Some(direction) = extra_direction {
            prompt.push_str(&format!("\nAdditional operator guidance: {direction}"));
        }
        let (output, backend_used) = router
            .generate_text(&model, &prompt, None, &GenerateTextParams::default())
            .await?;
        last_backend = backend_used;
        written.push(format!("## {}\n\n{}", section.heading, output.text.trim()));
    }

    let mut out = input;
    out["written_sections"] = json!(written);
    out["backend_used"]["write"] = json!(last_backend);
    Ok(out)
}

async fn finalize_step(
    router: Arc<BackendRouter>,
    model: String,
    input: serde_json::Value,
    ctx: StepContext,
) -> Result<serde_json::Value, GatewayError> {
    let clarified_query = input
        .get("clarified_query")
        .and_then(|v| v.as_str())
        .ok_or_else(|| input_error("finalize"))?
        .to_string();
    let written_sections: Vec<String> = serde_json::from_value(
        input.get("written_sections").cloned().ok_or_else(|| input_error("finalize"))?,
    )?;
    let hits: Vec<SearchHit> =
        serde_json::from_value(input.get("search_results").cloned().ok_or_else(|| input_error("finalize"))?)?;

    let body = written_sections.join("\n\n");
    let mut abstract_prompt = format!("Write a one-paragraph abstract for this research document:\n\n{body}");
    if let Some(direction) = ctx_direction(&ctx) {
        abstract_prompt.push_str(&format!("\n\nAdditional operator guidance: {direction}"));
    }
    let (abstract_output, backend_used) = router
        .generate_text(&model, &abstract_prompt, None, &GenerateTextParams::default())
        .await?;

    let references = hits
        .iter()
        .enumerate()
        .map(|(i, h)| format!("[{}] {} — {}", i + 1, h.title, h.uri))
        .collect::<Vec<_>>()
        .join("\n");

    let document = format!(
        "# {clarified_query}\n\n## Abstract\n\n{}\n\n{body}\n\n## References\n\n{references}",
        abstract_output.text.trim()
    );

    let mut out = input;
    out["document"] = json!(document);
    out["backend_used"]["finalize"] = json!(backend_used);
    Ok(out)
}

/// Builds the six-step research `Workflow`, each step bound to the given
/// router and model.
pub fn build_research_workflow(router: Arc<BackendRouter>, model: impl Into<String>, search_max_results: usize) -> Workflow {
    let model = model.into();

    let clarify_router = router.clone();
    let clarify_model = model.clone();
    let clarify = WorkflowStep::new(
        "clarify",
        step_fn(move |input, ctx| clarify_step(clarify_router.clone(), clarify_model.clone(), input, ctx)),
    )
    .with_retries(2)
    .with_skip_condition(Arc::new(|input, _ctx| {
        input
            .get("raw_query")
            .and_then(|v| v.as_str())
            .map(is_short_and_unambiguous)
            .unwrap_or(false)
    }));

    let search_router = router.clone();
    let search = WorkflowStep::new(
        "search",
        step_fn(move |input, ctx| search_step(search_router.clone(), search_max_results, input, ctx)),
    )
    .with_retries(3);

    let synthesize_router = router.clone();
    let synthesize_model = model.clone();
    let synthesize = WorkflowStep::new(
        "synthesize",
        step_fn(move |input, ctx| synthesize_step(synthesize_router.clone(), synthesize_model.clone(), input, ctx)),
    )
    .with_retries(2);

    let structure_router = router.clone();
    let structure_model = model.clone();
    let structure = WorkflowStep::new(
        "structure",
        step_fn(move |input, ctx| structure_step(structure_router.clone(), structure_model.clone(), input, ctx)),
    )
    .with_retries(2);

    let write_router = router.clone();
    let write_model = model.clone();
    let write = WorkflowStep::new(
        "write",
        step_fn(move |input, ctx| write_step(write_router.clone(), write_model.clone(), input, ctx)),
    )
    .with_retries(2);

    let finalize_router = router.clone();
    let finalize_model = model;
    let finalize = WorkflowStep::new(
        "finalize",
        step_fn(move |input, ctx| finalize_step(finalize_router.clone(), finalize_model.clone(), input, ctx)),
    )
    .with_retries(1);

    Workflow::new("research", vec![clarify, search, synthesize, structure, write, finalize])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::adapter::{BackendAdapter, GenerateTextOutput, SearchResult};
    use crate::backend::{BackendDescriptor, SelectionPolicy};
    use crate::capability::Capability;
    use crate::telemetry::UsageLog;
    use crate::workflow::{ExecutionStatus, WorkflowEngine};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    struct StubLlm;
    struct StubSearch;

    #[async_trait]
    impl BackendAdapter for StubLlm {
        fn id(&self) -> &str {
            "stub-llm"
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::GenerateText]
        }
        async fn generate_text(
            &self,
            prompt: &str,
            _system: Option<&str>,
            _model: &str,
            _params: &GenerateTextParams,
        ) -> Result<GenerateTextOutput, GatewayError> {
            if prompt.contains("sectioned outline") {
                return Ok(GenerateTextOutput {
                    text: serde_json::to_string(&vec![Section {
                        heading: "Background".into(),
                        prompts: vec!["cover the basics".into()],
                    }])
                    .unwrap(),
                });
            }
            Ok(GenerateTextOutput {
                text: format!("generated from: {}", prompt.chars().take(40).collect::<String>()),
            })
        }
    }

    #[async_trait]
    impl BackendAdapter for StubSearch {
        fn id(&self) -> &str {
            "stub-search"
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::SearchWeb]
        }
        async fn search_web(
            &self,
            query: &str,
            _max_results: usize,
            _region: Option<&str>,
            _safesearch: bool,
        ) -> Result<Vec<SearchResult>, GatewayError> {
            Ok(vec![SearchResult {
                title: format!("Result for {query}"),
                uri: "https://example.invalid/1".into(),
                snippet: "a relevant snippet".into(),
                score: 0.9,
            }])
        }
    }

    fn test_router() -> Arc<BackendRouter> {
        let mut policies = HashMap::new();
        policies.insert(
            Capability::GenerateText,
            SelectionPolicy::new(vec!["stub-llm".into()], true),
        );
        policies.insert(
            Capability::SearchWeb,
            SelectionPolicy::new(vec!["stub-search".into()], true),
        );
        Arc::new(BackendRouter::new(
            vec![Arc::new(StubLlm), Arc::new(StubSearch)],
            vec![
                BackendDescriptor::new("stub-llm", Capability::GenerateText, true, 1),
                BackendDescriptor::new("stub-search", Capability::SearchWeb, true, 1),
            ],
            policies,
            Arc::new(UsageLog::in_memory()),
            Duration::from_secs(30),
            3,
        ))
    }

    #[tokio::test]
    async fn full_research_workflow_produces_a_document_with_references() {
        let router = test_router();
        let workflow = build_research_workflow(router, "m1", 5);
        let engine = WorkflowEngine::new();
        let exec = engine
            .run_to_completion(workflow, initial_input("what is the capital of wherever"))
            .await
            .unwrap();

        assert_eq!(exec.status, ExecutionStatus::Completed);
        let output = exec.final_output.unwrap();
        let document = output.get("document").and_then(|v| v.as_str()).unwrap();
        assert!(document.contains("## Abstract"));
        assert!(document.contains("## References"));
        assert!(document.contains("Background"));
    }

    #[tokio::test]
    async fn short_unambiguous_query_skips_clarification() {
        let router = test_router();
        let workflow = build_research_workflow(router, "m1", 5);
        let engine = WorkflowEngine::new();
        let exec = engine
            .run_to_completion(workflow, initial_input("rust async runtimes"))
            .await
            .unwrap();
        assert_eq!(exec.records[0].label, "clarify");
        assert_eq!(exec.records[0].status, crate::workflow::StepRecordStatus::Skipped);
    }

    #[test]
    fn loaded_terms_disable_the_short_query_skip_heuristic() {
        assert!(is_short_and_unambiguous("rust async runtimes"));
        assert!(!is_short_and_unambiguous("what is clearly the best async runtime"));
    }
}

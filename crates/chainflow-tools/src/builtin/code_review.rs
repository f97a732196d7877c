//! Rule-based code review steps.
//!
//! Each tool reads `data.source_code` (and whatever earlier steps wrote) and
//! adds its findings to the state. Together they form the default review
//! chain `extract -> complexity -> issues -> suggest -> evaluate`.

use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::Regex;
use tracing::debug;

use chainflow_core::error::Result;
use chainflow_core::graph::GraphDefinition;
use chainflow_core::traits::Tool;
use chainflow_core::types::WorkflowState;

use crate::registry::ToolRegistry;

/// Lines at which the complexity heuristic saturates.
const COMPLEXITY_SATURATION_LINES: f64 = 200.0;
const COMPLEXITY_SPLIT_THRESHOLD: f64 = 0.7;
const DEFAULT_THRESHOLD: f64 = 0.8;

/// Issue rules: (needle, issue text, suggestion).
const ISSUE_RULES: &[(&str, &str, &str)] = &[
    (
        "print(",
        "Debug prints found",
        "Remove debug print statements or use logging instead",
    ),
    (
        "TODO",
        "TODO comments present",
        "Resolve or track TODO items before production",
    ),
    (
        "eval(",
        "Use of eval detected",
        "Avoid eval; consider safer alternatives",
    ),
];

fn def_pattern() -> &'static Regex {
    static DEF: OnceLock<Regex> = OnceLock::new();
    DEF.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(")
            .expect("function pattern is valid")
    })
}

fn source(state: &WorkflowState) -> &str {
    state.get_str("source_code").unwrap_or("")
}

pub struct ExtractFunctionsTool;

impl Tool for ExtractFunctionsTool {
    fn name(&self) -> &str {
        "extract_functions"
    }

    fn description(&self) -> &str {
        "Collect function names defined in data.source_code into data.functions."
    }

    fn execute(&self, mut state: WorkflowState) -> BoxFuture<'_, Result<WorkflowState>> {
        Box::pin(async move {
            let names: Vec<String> = def_pattern()
                .captures_iter(source(&state))
                .map(|c| c[1].to_string())
                .collect();
            debug!(count = names.len(), "Functions extracted");
            state.set("functions", serde_json::json!(names));
            Ok(state)
        })
    }
}

pub struct CheckComplexityTool;

impl Tool for CheckComplexityTool {
    fn name(&self) -> &str {
        "check_complexity"
    }

    fn description(&self) -> &str {
        "Estimate complexity from source length into data.complexity_score (0..1)."
    }

    fn execute(&self, mut state: WorkflowState) -> BoxFuture<'_, Result<WorkflowState>> {
        Box::pin(async move {
            let lines = source(&state).lines().count() as f64;
            let score = (lines / COMPLEXITY_SATURATION_LINES).min(1.0);
            state.set("complexity_score", serde_json::json!(score));
            Ok(state)
        })
    }
}

pub struct DetectIssuesTool;

impl Tool for DetectIssuesTool {
    fn name(&self) -> &str {
        "detect_issues"
    }

    fn description(&self) -> &str {
        "Flag debug prints, TODO comments and eval calls into data.issues."
    }

    fn execute(&self, mut state: WorkflowState) -> BoxFuture<'_, Result<WorkflowState>> {
        Box::pin(async move {
            let src = source(&state);
            let issues: Vec<&str> = ISSUE_RULES
                .iter()
                .filter(|(needle, _, _)| src.contains(needle))
                .map(|(_, issue, _)| *issue)
                .collect();
            let count = issues.len();
            state.set("issues", serde_json::json!(issues));
            state.set("issue_count", serde_json::json!(count));
            Ok(state)
        })
    }
}

pub struct SuggestImprovementsTool;

impl Tool for SuggestImprovementsTool {
    fn name(&self) -> &str {
        "suggest_improvements"
    }

    fn description(&self) -> &str {
        "Turn complexity and detected issues into data.suggestions."
    }

    fn execute(&self, mut state: WorkflowState) -> BoxFuture<'_, Result<WorkflowState>> {
        Box::pin(async move {
            let mut suggestions: Vec<&str> = Vec::new();

            if state.get_f64("complexity_score").unwrap_or(0.0) > COMPLEXITY_SPLIT_THRESHOLD {
                suggestions.push("Consider splitting large functions into smaller units");
            }

            for issue in state.get_str_list("issues") {
                if let Some((_, _, suggestion)) =
                    ISSUE_RULES.iter().find(|(_, text, _)| *text == issue)
                {
                    suggestions.push(*suggestion);
                }
            }

            state.set("suggestions", serde_json::json!(suggestions));
            Ok(state)
        })
    }
}

pub struct EvaluateQualityTool;

impl Tool for EvaluateQualityTool {
    fn name(&self) -> &str {
        "evaluate_quality"
    }

    fn description(&self) -> &str {
        "Score the review and set done when quality_score reaches data.quality_threshold."
    }

    fn execute(&self, mut state: WorkflowState) -> BoxFuture<'_, Result<WorkflowState>> {
        Box::pin(async move {
            let complexity = state.get_f64("complexity_score").unwrap_or(0.0);
            let issue_count = state.get_u64("issue_count").unwrap_or(0) as f64;
            let threshold = state
                .get_f64("quality_threshold")
                .unwrap_or(DEFAULT_THRESHOLD);

            // Score first; `done` is derived from the stored score.
            let score = 1.0 - 0.4 * complexity - 0.1 * issue_count;
            state.quality_score = score.clamp(0.0, 1.0);
            state.done = state.quality_score >= threshold;

            debug!(
                quality_score = state.quality_score,
                threshold,
                done = state.done,
                "Quality evaluated"
            );
            Ok(state)
        })
    }
}

/// Register every review tool.
pub fn register_all(registry: &ToolRegistry) {
    registry.register(ExtractFunctionsTool);
    registry.register(CheckComplexityTool);
    registry.register(DetectIssuesTool);
    registry.register(SuggestImprovementsTool);
    registry.register(EvaluateQualityTool);
}

/// The five-node review chain bound to the built-in tools.
pub fn default_review_graph(threshold: f64) -> GraphDefinition {
    GraphDefinition::new("extract")
        .with_node("extract", "extract_functions")
        .with_node("complexity", "check_complexity")
        .with_node("issues", "detect_issues")
        .with_node("suggest", "suggest_improvements")
        .with_node("evaluate", "evaluate_quality")
        .with_edge("extract", "complexity")
        .with_edge("complexity", "issues")
        .with_edge("issues", "suggest")
        .with_edge("suggest", "evaluate")
        .with_threshold(threshold)
}

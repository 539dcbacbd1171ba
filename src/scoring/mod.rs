//! Confidence scoring: model output → ranked, validated suggestions.
//!
//! The scorer is stateless apart from optional per-model quality priors.
//! Given the same response and context it produces identical adjusted
//! confidences, quality scores, and ranks.

use std::collections::HashMap;

use chrono::Utc;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::types::{AnalysisKind, Suggestion, ValidationFlag};

/// Characters that are illegal in filenames on the supported platforms.
const ILLEGAL_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Maximum accepted candidate length, in characters.
const MAX_VALUE_CHARS: usize = 100;

/// Confidence penalty for illegal filename characters.
const ILLEGAL_CHARACTERS_PENALTY: i16 = 20;

/// Confidence penalty for over-long values.
const VALUE_TOO_LONG_PENALTY: i16 = 10;

/// Confidence penalty for a rename that changes the extension.
const EXTENSION_MISMATCH_PENALTY: i16 = 15;

/// Confidence penalty for empty values.
const EMPTY_VALUE_PENALTY: i16 = 40;

/// Expected model response shape.
#[derive(Debug, Deserialize)]
struct RawResponse {
    candidates: Vec<RawCandidate>,
}

/// One candidate in a model response. `confidence` arrives as a number in
/// [0, 100]; out-of-range values are clamped.
#[derive(Debug, Deserialize)]
struct RawCandidate {
    #[serde(alias = "name")]
    value: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

/// Context for scoring one task result.
#[derive(Debug, Clone)]
pub struct ScoreContext {
    /// File the result belongs to.
    pub file_id: i64,
    /// File name including extension, for rename validation.
    pub file_name: String,
    /// Lowercase source extension without the dot; empty when absent.
    pub file_extension: String,
    /// Request the task belonged to.
    pub request_id: Uuid,
    /// Analysis kind of the task.
    pub kind: AnalysisKind,
    /// Model that produced the response.
    pub model: String,
    /// Inference wall-clock time.
    pub execution_time_ms: u64,
}

/// Per-(model, kind) confidence adjustments learned from past quality.
///
/// Positive values boost a model's candidates for a kind; negative values
/// dampen them. Empty by default.
#[derive(Debug, Clone, Default)]
pub struct ModelQualityPriors {
    entries: HashMap<(String, AnalysisKind), i16>,
}

impl ModelQualityPriors {
    /// Set the adjustment for a (model, kind) pair.
    pub fn set(&mut self, model: impl Into<String>, kind: AnalysisKind, adjustment: i16) {
        self.entries.insert((model.into(), kind), adjustment);
    }

    /// Adjustment for a (model, kind) pair; zero when unset.
    pub fn adjustment(&self, model: &str, kind: AnalysisKind) -> i16 {
        self.entries
            .get(&(model.to_owned(), kind))
            .copied()
            .unwrap_or(0)
    }
}

/// Converts raw model responses into ranked [`Suggestion`]s.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer {
    priors: ModelQualityPriors,
}

impl ConfidenceScorer {
    /// Scorer with quality priors.
    pub fn with_priors(priors: ModelQualityPriors) -> Self {
        Self { priors }
    }

    /// Parse, validate, score, and rank one model response.
    ///
    /// Returns ranked suggestions; an unparseable response yields a single
    /// unranked record carrying the `parse-error` flag.
    pub fn score(&self, ctx: &ScoreContext, response: &str) -> Vec<Suggestion> {
        let parsed: RawResponse = match serde_json::from_str(response) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(
                    file_id = ctx.file_id,
                    kind = %ctx.kind,
                    error = %e,
                    "model response unparseable"
                );
                return vec![self.parse_failure(ctx, &e.to_string())];
            }
        };

        let mut scored: Vec<(usize, Suggestion)> = parsed
            .candidates
            .into_iter()
            .enumerate()
            .map(|(index, candidate)| (index, self.score_candidate(ctx, &candidate)))
            .collect();

        // Rank by adjusted confidence, then quality, then original order.
        scored.sort_by(|(ai, a), (bi, b)| {
            b.adjusted_confidence
                .cmp(&a.adjusted_confidence)
                .then_with(|| {
                    b.quality
                        .partial_cmp(&a.quality)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| ai.cmp(bi))
        });

        let mut suggestions: Vec<Suggestion> = scored
            .into_iter()
            .enumerate()
            .map(|(position, (_, mut suggestion))| {
                suggestion.rank_position =
                    u32::try_from(position.saturating_add(1)).unwrap_or(u32::MAX);
                suggestion
            })
            .collect();

        // Recommend the best-ranked candidate with a clean flag set.
        if let Some(first_clean) = suggestions.iter_mut().find(|s| s.flags.is_empty()) {
            first_clean.recommended = true;
        }

        suggestions
    }

    fn score_candidate(&self, ctx: &ScoreContext, candidate: &RawCandidate) -> Suggestion {
        let flags = validate_candidate(ctx, &candidate.value);
        let original = clamp_confidence(candidate.confidence);
        let prior = self.priors.adjustment(&ctx.model, ctx.kind);
        let adjusted = adjust_confidence(original, &flags, prior);
        let quality = quality_score(adjusted, candidate.reasoning.len(), flags.len());

        Suggestion {
            file_id: ctx.file_id,
            request_id: ctx.request_id,
            kind: ctx.kind,
            value: candidate.value.clone(),
            original_confidence: original,
            adjusted_confidence: adjusted,
            quality,
            reasoning: candidate.reasoning.clone(),
            model: ctx.model.clone(),
            execution_time_ms: ctx.execution_time_ms,
            rank_position: 0,
            recommended: false,
            flags,
            created_at: Utc::now(),
        }
    }

    fn parse_failure(&self, ctx: &ScoreContext, detail: &str) -> Suggestion {
        Suggestion {
            file_id: ctx.file_id,
            request_id: ctx.request_id,
            kind: ctx.kind,
            value: String::new(),
            original_confidence: 0,
            adjusted_confidence: 0,
            quality: 0.0,
            reasoning: format!("response did not parse: {detail}"),
            model: ctx.model.clone(),
            execution_time_ms: ctx.execution_time_ms,
            rank_position: 0,
            recommended: false,
            flags: vec![ValidationFlag::ParseError],
            created_at: Utc::now(),
        }
    }
}

/// Validate one candidate value, returning its flags in a fixed order.
fn validate_candidate(ctx: &ScoreContext, value: &str) -> Vec<ValidationFlag> {
    let mut flags = Vec::new();

    if value.trim().is_empty() {
        flags.push(ValidationFlag::EmptyValue);
        return flags;
    }
    if value.contains(ILLEGAL_FILENAME_CHARS) {
        flags.push(ValidationFlag::IllegalCharacters);
    }
    if value.chars().count() > MAX_VALUE_CHARS {
        flags.push(ValidationFlag::ValueTooLong);
    }
    if ctx.kind == AnalysisKind::RenameSuggestions && extension_differs(ctx, value) {
        flags.push(ValidationFlag::ExtensionMismatch);
    }

    flags
}

/// Whether a proposed filename carries a different extension than the
/// source file. Only meaningful for rename suggestions.
fn extension_differs(ctx: &ScoreContext, value: &str) -> bool {
    if ctx.file_extension.is_empty() {
        return false;
    }
    match value.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => !ext.eq_ignore_ascii_case(&ctx.file_extension),
        _ => true,
    }
}

fn clamp_confidence(raw: f64) -> u8 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    // Clamped to [0, 100] first, so the cast is exact.
    let clamped = raw.clamp(0.0, 100.0).round() as u8;
    clamped
}

/// Apply per-flag penalties and the model prior, clamped to [0, 100].
fn adjust_confidence(original: u8, flags: &[ValidationFlag], prior: i16) -> u8 {
    let mut adjusted = i16::from(original);
    for flag in flags {
        adjusted = adjusted.saturating_sub(match flag {
            ValidationFlag::IllegalCharacters => ILLEGAL_CHARACTERS_PENALTY,
            ValidationFlag::ValueTooLong => VALUE_TOO_LONG_PENALTY,
            ValidationFlag::ExtensionMismatch => EXTENSION_MISMATCH_PENALTY,
            ValidationFlag::EmptyValue => EMPTY_VALUE_PENALTY,
            ValidationFlag::ParseError => 0,
        });
    }
    adjusted = adjusted.saturating_add(prior);
    u8::try_from(adjusted.clamp(0, 100)).unwrap_or(0)
}

/// Composite quality in [0, 1]: adjusted confidence dominates, reasoning
/// length contributes with diminishing returns, flags subtract.
fn quality_score(adjusted: u8, reasoning_len: usize, flag_count: usize) -> f64 {
    let confidence_part = f64::from(adjusted) / 100.0;
    #[allow(clippy::cast_precision_loss)] // reasoning lengths are small
    let len = reasoning_len as f64;
    let reasoning_part = len / (len + 160.0);
    #[allow(clippy::cast_precision_loss)] // flag counts are tiny
    let flag_penalty = 0.1 * flag_count as f64;
    (0.7 * confidence_part + 0.3 * reasoning_part - flag_penalty).clamp(0.0, 1.0)
}

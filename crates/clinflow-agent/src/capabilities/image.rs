use base64::Engine;
use futures::future::BoxFuture;
use serde_json::json;

use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::state::{ImageAnalysis, LesionClass, StatePatch, WorkflowState};
use clinflow_core::types::{CompletionRequest, ImageKind, ToolCallRecord};

use super::fields::{f64_field, str_field};
use super::{task_header, Capability, CapabilityContext, IMAGE_ANALYSIS};

/// Below this confidence a benign call still warrants referral.
const CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Vision-model screening of the attached image for malignancy.
pub struct ImageAnalysisCapability;

/// Value following `label` in a "Key: value, Key: value" context string.
fn context_value<'a>(context: &'a str, label: &str) -> Option<&'a str> {
    let (_, rest) = context.split_once(label)?;
    let value = rest.split(',').next()?.trim();
    (!value.is_empty()).then_some(value)
}

fn parse_class(raw: &str) -> LesionClass {
    match raw.to_ascii_lowercase().as_str() {
        "benign" => LesionClass::Benign,
        "malignant" => LesionClass::Malignant,
        _ => LesionClass::Unknown,
    }
}

pub(crate) fn monitoring_recommendation(class: LesionClass, confidence: f64) -> &'static str {
    if class == LesionClass::Malignant {
        "Immediate biopsy and dermatology referral required"
    } else if class == LesionClass::Unknown || confidence < CONFIDENCE_THRESHOLD {
        "Close monitoring recommended - re-evaluate in 3 months or earlier if changes"
    } else {
        "Routine monitoring - annual skin check recommended"
    }
}

pub(crate) fn requires_referral(class: LesionClass, confidence: f64) -> bool {
    class != LesionClass::Benign || confidence < CONFIDENCE_THRESHOLD
}

impl ImageAnalysisCapability {
    fn prompt(state: &WorkflowState, kind: ImageKind) -> String {
        let context = &state.input().patient_context;
        let age = context_value(context, "Age:").unwrap_or("unknown");
        let sex = context_value(context, "Gender:").unwrap_or("unknown");
        let role = match kind {
            ImageKind::Skin => "You are a dermatology expert analyzing a dermoscopic skin lesion image.",
            ImageKind::Xray => "You are a radiology expert analyzing a chest X-ray image.",
            ImageKind::General => "You are a clinical expert analyzing a medical image.",
        };
        format!(
            "{}\n{}\nPatient: {} year old {}\nPresenting complaint: {}\n\n\
             Analyze the image for signs of malignancy. In your reasoning, describe:\n\
             1. Key visual features (asymmetry, border, color, diameter, evolution)\n\
             2. Concerning features if present (irregular pigmentation, ulceration, etc.)\n\
             3. Clinical recommendation (monitoring frequency, biopsy indication, urgency)\n\n\
             Return ONLY valid JSON:\n\
             {{\"classification\": \"benign\" or \"malignant\", \"confidence\": 0.0-1.0, \
             \"reasoning\": \"detailed analysis of features and clinical recommendation\"}}\nJSON:",
            task_header(IMAGE_ANALYSIS),
            role,
            age,
            sex,
            state.input().symptoms,
        )
    }
}

impl Capability for ImageAnalysisCapability {
    fn name(&self) -> &str {
        IMAGE_ANALYSIS
    }

    fn description(&self) -> &str {
        "Image screening for malignancy using the vision model"
    }

    fn use_when(&self) -> &str {
        "When an image is provided for screening"
    }

    fn is_complete(&self, state: &WorkflowState) -> bool {
        state.image_analysis.is_some()
    }

    fn is_eligible(&self, state: &WorkflowState) -> bool {
        state.has_image()
    }

    fn execute<'a>(
        &'a self,
        state: &'a WorkflowState,
        ctx: &'a CapabilityContext,
    ) -> BoxFuture<'a, Result<StatePatch>> {
        Box::pin(async move {
            let image = state
                .input()
                .image
                .as_ref()
                .ok_or_else(|| ClinflowError::InvalidInput("no image attached".into()))?;
            ctx.step_start(
                state,
                IMAGE_ANALYSIS,
                "Scanning Image with AI",
                "Vision model analyzing the attached image",
            );

            let bytes = tokio::fs::read(&image.path).await?;
            let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
            let request = CompletionRequest::text(Self::prompt(state, image.kind)).with_image(encoded);
            let obj = ctx.invoke_vision_json(IMAGE_ANALYSIS, request).await?;

            let classification = str_field(&obj, "classification")
                .map(|raw| parse_class(&raw))
                .ok_or_else(|| ClinflowError::LlmParse("classification missing".into()))?;
            let confidence = f64_field(&obj, "confidence").unwrap_or(0.5).clamp(0.0, 1.0);
            let reasoning =
                str_field(&obj, "reasoning").unwrap_or_else(|| "No detailed analysis provided".into());
            let analysis = ImageAnalysis {
                classification,
                confidence,
                reasoning,
                monitoring_recommendation: monitoring_recommendation(classification, confidence)
                    .to_string(),
                requires_referral: requires_referral(classification, confidence),
                urgent: classification == LesionClass::Malignant,
                fallback: false,
            };

            ctx.step_complete(
                state,
                IMAGE_ANALYSIS,
                "Image Analyzed",
                json!({
                    "classification": analysis.classification,
                    "confidence": (analysis.confidence * 100.0).round() / 100.0,
                    "requires_referral": analysis.requires_referral,
                }),
            );

            let output = format!(
                "Classification: {:?} (confidence: {:.2})\nMonitoring: {}\nReferral needed: {}",
                analysis.classification,
                analysis.confidence,
                analysis.monitoring_recommendation,
                analysis.requires_referral
            );
            let headline = format!(
                "Image screening: {:?} (confidence: {:.2})",
                analysis.classification, analysis.confidence
            );
            let findings = format!("Analysis: {}", analysis.reasoning);
            let recommendation = format!("Recommendation: {}", analysis.monitoring_recommendation);
            Ok(StatePatch {
                image_analysis: Some(analysis),
                ..StatePatch::new()
            }
            .with_message(headline)
            .with_message(findings)
            .with_message(recommendation)
            .with_tool_call(ToolCallRecord::new(
                IMAGE_ANALYSIS,
                format!("Image: {}", image.path),
                output,
            )))
        })
    }

    fn fallback(
        &self,
        state: &WorkflowState,
        error: &ClinflowError,
        ctx: &CapabilityContext,
    ) -> StatePatch {
        ctx.step_fallback(state, IMAGE_ANALYSIS, "Image Scan (Fallback)", error);
        StatePatch {
            image_analysis: Some(ImageAnalysis {
                classification: LesionClass::Unknown,
                confidence: 0.0,
                reasoning: format!("Error: {}", error),
                monitoring_recommendation: monitoring_recommendation(LesionClass::Unknown, 0.0)
                    .to_string(),
                requires_referral: true,
                urgent: false,
                fallback: true,
            }),
            ..StatePatch::new()
        }
        .with_message("WARNING: Image analysis failed; recommend specialist review")
        .with_tool_call(ToolCallRecord::new(IMAGE_ANALYSIS, state.encounter_id(), "fallback"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capabilities::test_support::context;
    use clinflow_test_utils::{replies, skin_encounter, write_test_image, ScriptedBackend};

    #[test]
    fn test_context_value() {
        let ctx = "Age: 58, Gender: male, Name: Test";
        assert_eq!(context_value(ctx, "Age:"), Some("58"));
        assert_eq!(context_value(ctx, "Gender:"), Some("male"));
        assert_eq!(context_value(ctx, "Weight:"), None);
    }

    #[test]
    fn test_referral_rules() {
        assert!(requires_referral(LesionClass::Malignant, 0.95));
        assert!(requires_referral(LesionClass::Unknown, 0.95));
        assert!(requires_referral(LesionClass::Benign, 0.5));
        assert!(!requires_referral(LesionClass::Benign, 0.9));
        assert_eq!(
            monitoring_recommendation(LesionClass::Benign, 0.9),
            "Routine monitoring - annual skin check recommended"
        );
    }

    #[tokio::test]
    async fn test_malignant_image_sends_base64_to_vision_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_image(&dir);
        let backend = Arc::new(
            ScriptedBackend::new().reply(&task_header(IMAGE_ANALYSIS), replies::SKIN_MALIGNANT),
        );
        let ctx = context(backend.clone());
        let state = WorkflowState::new(skin_encounter(&path)).unwrap();

        let analysis = ImageAnalysisCapability
            .execute(&state, &ctx)
            .await
            .unwrap()
            .image_analysis
            .unwrap();
        assert_eq!(analysis.classification, LesionClass::Malignant);
        assert!(analysis.urgent);
        assert!(analysis.requires_referral);

        let request = &backend.requests()[0];
        assert_eq!(request.images, vec!["/9j/4AAQ".to_string()]);
        assert!(request.prompt.contains("24 year old female"));
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let backend = Arc::new(ScriptedBackend::new());
        let ctx = context(backend.clone());
        let state =
            WorkflowState::new(skin_encounter(std::path::Path::new("/nonexistent/lesion.jpg")))
                .unwrap();
        assert!(ImageAnalysisCapability.execute(&state, &ctx).await.is_err());
        assert!(backend.requests().is_empty());
    }
}

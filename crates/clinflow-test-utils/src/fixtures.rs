use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::json;

use clinflow_core::config::{AppConfig, ModelConfig};
use clinflow_core::state::{EncounterInput, ImageRef, VitalSign};
use clinflow_core::types::ImageKind;

fn vital(value: serde_json::Value, unit: &str) -> VitalSign {
    VitalSign {
        value,
        unit: Some(unit.to_string()),
    }
}

/// Crushing chest pain with low oxygen saturation.
pub fn emergency_encounter() -> EncounterInput {
    let mut vitals = BTreeMap::new();
    vitals.insert("blood_pressure".to_string(), vital(json!("88/54"), "mmHg"));
    vitals.insert("heart_rate".to_string(), vital(json!(128), "bpm"));
    vitals.insert("spo2".to_string(), vital(json!(86), "%"));
    EncounterInput {
        encounter_id: "enc-emergency".into(),
        patient_id: "pat-001".into(),
        patient_context: "Age: 58, Gender: male, Name: Test Patient".into(),
        symptoms: "Crushing chest pain radiating to left arm, sweating, short of breath".into(),
        vitals,
        medical_history: Some("Hypertension, smoker".into()),
        image: None,
    }
}

/// Mild cough, normal vitals, no image.
pub fn routine_encounter() -> EncounterInput {
    let mut vitals = BTreeMap::new();
    vitals.insert("temperature".to_string(), vital(json!(37.4), "C"));
    vitals.insert("spo2".to_string(), vital(json!(98), "%"));
    EncounterInput {
        encounter_id: "enc-routine".into(),
        patient_id: "pat-002".into(),
        patient_context: "Age: 24, Gender: female, Name: Test Patient".into(),
        symptoms: "Dry cough for three days, no fever".into(),
        vitals,
        medical_history: None,
        image: None,
    }
}

/// Routine encounter with a skin lesion image at `path`.
pub fn skin_encounter(path: &Path) -> EncounterInput {
    EncounterInput {
        encounter_id: "enc-skin".into(),
        symptoms: "Changing mole on upper back".into(),
        image: Some(ImageRef {
            path: path.display().to_string(),
            kind: ImageKind::Skin,
        }),
        ..routine_encounter()
    }
}

/// Write a small fake image file and return its path.
pub fn write_test_image(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("lesion.jpg");
    std::fs::write(&path, [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10]).unwrap();
    path
}

pub fn test_config() -> AppConfig {
    AppConfig::for_model(ModelConfig::ollama("medgemma-chw"))
}

/// Canned model replies, shaped the way the clinical prompts ask for them.
pub mod replies {
    pub fn assessment(triage: &str) -> String {
        format!(
            r#"{{"triage_level": "{}", "differential_diagnoses": ["Acute coronary syndrome", "Pulmonary embolism"], "red_flags": ["Chest pain", "Hypoxia"], "recommended_investigations": ["ECG", "Troponin"]}}"#,
            triage
        )
    }

    pub const ASSESSMENT_ROUTINE: &str = r#"<start_of_turn>model
{"triage_level": "ROUTINE", "differential_diagnoses": ["Viral upper respiratory infection"], "red_flags": [], "recommended_investigations": []}<end_of_turn>"#;

    pub const EMERGENCY: &str = r#"{"emergency_level": "CRITICAL", "immediate_actions": ["Give aspirin 300mg chewed", "Keep patient seated"], "call_for_help": "Call ambulance now", "monitoring": "Pulse and breathing every 5 minutes"}"#;

    pub const RISK: &str = r#"```json
{"risk_level": "LOW", "risk_factors": [], "chronic_conditions": [], "recommendations": ["Hydration"]}
```"#;

    pub const REFERRAL_NOT_NEEDED: &str =
        r#"{"referral_needed": false, "referral_type": "None", "referral_urgency": "ROUTINE"}"#;

    pub const REFERRAL_CARDIOLOGY: &str =
        r#"{"referral_needed": true, "referral_type": "Cardiology", "referral_urgency": "URGENT"}"#;

    pub const TREATMENT: &str = r#"{"medications": [{"name": "Paracetamol", "dose": "500mg", "frequency": "every 6 hours"}], "care_plan_goals": ["Symptom relief", "Return if fever develops"]}"#;

    pub const SOAP: &str = r#"{"subjective": "Dry cough for three days", "objective": "Afebrile, SpO2 98%"}
{"assessment": "Likely viral URTI", "plan": "Supportive care, review in 1-2 weeks"}"#;

    pub const SKIN_MALIGNANT: &str = r#"{"classification": "malignant", "confidence": 0.91, "reasoning": "Asymmetric lesion with irregular border"}"#;

    pub const SKIN_BENIGN: &str = r#"{"classification": "benign", "confidence": 0.88, "reasoning": "Symmetric, uniform pigmentation"}"#;

    pub fn route(next: &str) -> String {
        format!(
            r#"{{"next_action": "{}", "reasoning": "scripted routing"}}"#,
            next
        )
    }
}

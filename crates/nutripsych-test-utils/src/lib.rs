//! Shared fixtures for nutripsych tests: sample food records, valid task
//! payloads, and a mock backend that answers every pipeline prompt.

use nutripsych_common::food::StandardNutrients;
use nutripsych_common::FoodRecord;
use nutripsych_llm::mock::MockBackend;
use nutripsych_llm::{LlmError, LlmRequest};
use serde_json::{json, Value};

// ── Records ───────────────────────────────────────────────────────────────────

pub fn salmon_record() -> FoodRecord {
    let mut r = FoodRecord::new("salmon_wild", "Salmon, wild", "Finfish and Shellfish Products");
    r.standard_nutrients = StandardNutrients {
        calories: Some(182.0),
        protein_g: Some(25.4),
        fat_g: Some(8.1),
        calcium_mg: Some(15.0),
        iron_mg: Some(1.0),
        magnesium_mg: Some(37.0),
        potassium_mg: Some(628.0),
        sodium_mg: Some(56.0),
        zinc_mg: Some(0.8),
        ..Default::default()
    };
    r
}

pub fn spinach_record() -> FoodRecord {
    let mut r = FoodRecord::new("spinach_raw", "Spinach, raw", "Vegetables and Vegetable Products");
    r.standard_nutrients = StandardNutrients {
        calories: Some(23.0),
        protein_g: Some(2.9),
        carbohydrates_g: Some(3.6),
        fiber_g: Some(2.2),
        calcium_mg: Some(99.0),
        iron_mg: Some(2.7),
        magnesium_mg: Some(79.0),
        vitamin_c_mg: Some(28.1),
        ..Default::default()
    };
    r
}

pub fn walnut_record() -> FoodRecord {
    let mut r = FoodRecord::new("walnuts", "Walnuts, english", "Nut and Seed Products");
    r.standard_nutrients = StandardNutrients {
        calories: Some(654.0),
        protein_g: Some(15.2),
        fat_g: Some(65.2),
        fiber_g: Some(6.7),
        magnesium_mg: Some(158.0),
        zinc_mg: Some(3.1),
        ..Default::default()
    };
    r
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Valid brain-nutrient payload. Every confidence sits in 5–7, below the
/// cited band.
pub fn brain_nutrients_payload() -> Value {
    json!({
        "tryptophan_mg": 260.0, "tryptophan_mg_confidence": 7,
        "tyrosine_mg": 870.0, "tyrosine_mg_confidence": 6,
        "vitamin_b6_mg": 0.82, "vitamin_b6_mg_confidence": 6,
        "folate_mcg": 25.0, "folate_mcg_confidence": 5,
        "vitamin_b12_mcg": 3.2, "vitamin_b12_mcg_confidence": 7,
        "vitamin_d_mcg": 11.0, "vitamin_d_mcg_confidence": 5,
        "magnesium_mg": 37.0, "magnesium_mg_confidence": 7,
        "zinc_mg": 0.8, "zinc_mg_confidence": 6,
        "iron_mg": 1.0, "iron_mg_confidence": 6,
        "selenium_mcg": 36.5, "selenium_mcg_confidence": 6,
        "choline_mg": 90.0, "choline_mg_confidence": 5,
        "omega3": {
            "total_g": 2.5, "total_g_confidence": 6,
            "epa_mg": 860.0, "epa_mg_confidence": 6,
            "dha_mg": 1100.0, "dha_mg_confidence": 6,
            "ala_mg": 95.0, "ala_mg_confidence": 5
        }
    })
}

pub fn bioactive_payload() -> Value {
    json!({
        "polyphenols_mg": 0.0, "polyphenols_mg_confidence": 6,
        "flavonoids_mg": 0.0, "flavonoids_mg_confidence": 6,
        "anthocyanins_mg": 0.0, "anthocyanins_mg_confidence": 7,
        "carotenoids_mg": 0.5, "carotenoids_mg_confidence": 5,
        "probiotics_cfu": null, "probiotics_cfu_confidence": null,
        "prebiotic_fiber_g": 0.0, "prebiotic_fiber_g_confidence": 7
    })
}

/// Impacts payload with one entry per `(confidence, citation count)`.
/// Entries without citations omit the field entirely.
pub fn impacts_payload(entries: &[(f64, usize)]) -> Value {
    let impacts: Vec<Value> = entries
        .iter()
        .enumerate()
        .map(|(i, (confidence, cited))| {
            let mut impact = json!({
                "impact_type": format!("mood_depression_{i}"),
                "direction": "positive",
                "mechanism": "EPA and DHA reduce neuroinflammation",
                "strength": 6,
                "confidence": confidence,
                "time_to_effect": "long_term",
                "research_context": "meta-analysis of randomised trials"
            });
            if *cited > 0 {
                let citations: Vec<String> = (0..*cited).map(|n| format!("doi:10.1000/omega3.{n}")).collect();
                impact["citations"] = json!(citations);
            }
            impact
        })
        .collect();
    json!({ "impacts": impacts })
}

pub fn interactions_payload() -> Value {
    json!({
        "interactions": [{
            "nutrients": ["vitamin_d", "magnesium"],
            "interaction_type": "cofactor",
            "pathway": "vitamin D activation",
            "mechanism": "Magnesium is required by the hydroxylases that activate vitamin D",
            "mental_health_relevance": "low vitamin D status is associated with depressive symptoms",
            "confidence": 6
        }]
    })
}

// ── Mock pipeline backend ─────────────────────────────────────────────────────

/// Which pipeline prompt a user message belongs to: a task label
/// (`brain_nutrients`, …) or `confidence_calibration`.
pub fn prompt_kind(user_prompt: &str) -> Option<&'static str> {
    let p = user_prompt.trim_start();
    if p.starts_with("Recalibrate the confidence") {
        Some("confidence_calibration")
    } else if p.starts_with("Predict the brain-relevant") {
        Some("brain_nutrients")
    } else if p.starts_with("Estimate the bioactive") {
        Some("bioactive_compounds")
    } else if p.contains("mental health impacts of") {
        Some("mental_health_impacts")
    } else if p.contains("nutrient interactions") {
        Some("nutrient_interactions")
    } else {
        None
    }
}

/// Well-formed prediction reply for a task label, wrapped in a little prose.
pub fn canned_reply(kind: &str) -> Option<String> {
    let payload = match kind {
        "brain_nutrients" => brain_nutrients_payload(),
        "bioactive_compounds" => bioactive_payload(),
        "mental_health_impacts" => impacts_payload(&[(7.0, 1), (5.0, 0)]),
        "nutrient_interactions" => interactions_payload(),
        _ => return None,
    };
    Some(format!("Here is the estimate.\n```json\n{payload}\n```"))
}

/// The data block of a calibration prompt.
pub fn generated_data(user_prompt: &str) -> Option<Value> {
    let start = user_prompt.find("Generated data:")?;
    let rest = &user_prompt[start..];
    let brace = rest.find('{')?;
    serde_json::Deserializer::from_str(&rest[brace..]).into_iter::<Value>().next()?.ok()
}

/// Calibration reply that returns the generated data with `adjust` applied
/// and the given notes attached.
pub fn calibration_reply(user_prompt: &str, notes: &[&str], adjust: impl Fn(&mut Value)) -> Option<String> {
    let mut data = generated_data(user_prompt)?;
    adjust(&mut data);
    data["calibration_notes"] = json!(notes);
    Some(data.to_string())
}

/// Answers every pipeline prompt with a valid reply. Calibration echoes
/// its input unchanged.
pub fn pipeline_backend() -> MockBackend {
    MockBackend::new("mock-pipeline").with_responder(pipeline_reply)
}

pub fn pipeline_reply(req: &LlmRequest) -> Result<String, LlmError> {
    let prompt = req.user_prompt();
    let reply = match prompt_kind(prompt) {
        Some("confidence_calibration") => calibration_reply(prompt, &["values consistent with USDA data"], |_| {}),
        Some(kind) => canned_reply(kind),
        None => None,
    };
    reply.ok_or_else(|| LlmError::Unavailable(format!("unexpected prompt: {}", prompt.chars().take(60).collect::<String>())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_data_is_found_after_label() {
        let prompt = "Recalibrate the confidence scores of this brain_nutrients data for X.\n\nGenerated data:\n{\"a\": {\"b\": 1}}\n\nReference data:\n{\"c\": 2}";
        assert_eq!(prompt_kind(prompt), Some("confidence_calibration"));
        assert_eq!(generated_data(prompt), Some(json!({"a": {"b": 1}})));
    }

    #[test]
    fn test_impacts_payload_citations() {
        let p = impacts_payload(&[(9.0, 2), (4.0, 0)]);
        assert_eq!(p["impacts"][0]["citations"].as_array().map(Vec::len), Some(2));
        assert!(p["impacts"][1].get("citations").is_none());
    }
}

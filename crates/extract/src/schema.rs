use chrono::{DateTime, Utc};
use ingest::CrmContext;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;

use crate::taxonomy::InsightType;

/// One insight object exactly as the model emitted it, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawInsight {
    pub insight_type: String,
    pub insight_subtype: String,
    pub module: Option<String>,
    pub summary: String,
    pub verbatim_quote: Option<String>,
    pub confidence: f64,
    pub competitor_name: Option<String>,
    pub competitor_relationship: Option<String>,
    pub feature_name: Option<String>,
    pub gap_description: Option<String>,
    pub gap_priority: Option<String>,
    pub faq_topic: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPriority {
    MustHave,
    NiceToHave,
    Dealbreaker,
}

impl GapPriority {
    pub const ALL: [GapPriority; 3] = [
        GapPriority::MustHave,
        GapPriority::NiceToHave,
        GapPriority::Dealbreaker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GapPriority::MustHave => "must_have",
            GapPriority::NiceToHave => "nice_to_have",
            GapPriority::Dealbreaker => "dealbreaker",
        }
    }
}

impl fmt::Display for GapPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GapPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GapPriority::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown gap priority '{}'", s))
    }
}

/// Who produced an insight: filled in by the pipeline, not the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub model_used: String,
    pub prompt_version: String,
    /// Absent for direct (sample) requests.
    pub batch_id: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// A validated, taxonomy-coded insight ready for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub content_hash: String,
    pub transcript_id: String,
    pub transcript_chunk: u32,

    pub insight_type: InsightType,
    pub insight_subtype: String,
    pub module: Option<String>,

    pub summary: String,
    pub verbatim_quote: Option<String>,
    pub confidence: f64,

    pub competitor_name: Option<String>,
    pub competitor_relationship: Option<String>,
    pub feature_name: Option<String>,
    pub gap_description: Option<String>,
    pub gap_priority: Option<GapPriority>,
    pub faq_topic: Option<String>,

    #[serde(flatten)]
    pub crm: CrmContext,

    pub model_used: String,
    pub prompt_version: String,
    pub batch_id: Option<String>,
    pub processed_at: DateTime<Utc>,
}

fn nullable_string(description: &str) -> Value {
    json!({ "type": ["string", "null"], "description": description })
}

/// Strict structured-output schema sent as `response_format`.
///
/// Every property is required; optional ones are nullable instead. The model
/// cannot add properties.
pub fn response_format() -> Value {
    let types: Vec<&str> = InsightType::ALL.iter().map(|t| t.as_str()).collect();
    let mut priorities: Vec<Value> = GapPriority::ALL.iter().map(|p| json!(p.as_str())).collect();
    priorities.push(Value::Null);

    let insight = json!({
        "type": "object",
        "properties": {
            "insight_type": { "type": "string", "enum": types },
            "insight_subtype": { "type": "string", "description": "Taxonomy code scoped to insight_type" },
            "module": nullable_string("Module code"),
            "summary": { "type": "string" },
            "verbatim_quote": nullable_string("Literal quote from the transcript"),
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
            "competitor_name": nullable_string("Normalized competitor name"),
            "competitor_relationship": nullable_string("Competitive relationship code"),
            "feature_name": nullable_string("Feature code, lowercase_with_underscores"),
            "gap_description": nullable_string("What the prospect needs"),
            "gap_priority": { "type": ["string", "null"], "enum": priorities },
            "faq_topic": nullable_string("FAQ topic code")
        },
        "required": [
            "insight_type", "insight_subtype", "module", "summary", "verbatim_quote",
            "confidence", "competitor_name", "competitor_relationship", "feature_name",
            "gap_description", "gap_priority", "faq_topic"
        ],
        "additionalProperties": false
    });

    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "insight_extraction",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "insights": { "type": "array", "items": insight }
                },
                "required": ["insights"],
                "additionalProperties": false
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_requires_every_property() {
        let format = response_format();
        let item = &format["json_schema"]["schema"]["properties"]["insights"]["items"];

        let properties: Vec<&String> = item["properties"].as_object().unwrap().keys().collect();
        let required: Vec<&str> = item["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();

        assert_eq!(properties.len(), required.len());
        for p in properties {
            assert!(required.contains(&p.as_str()), "{} not required", p);
        }
        assert_eq!(item["additionalProperties"], json!(false));
        assert_eq!(format["json_schema"]["strict"], json!(true));
    }

    #[test]
    fn test_raw_insight_rejects_unknown_fields() {
        let json = r#"{
            "insight_type": "pain", "insight_subtype": "budget", "module": null,
            "summary": "s", "verbatim_quote": null, "confidence": 0.5,
            "competitor_name": null, "competitor_relationship": null,
            "feature_name": null, "gap_description": null, "gap_priority": null,
            "faq_topic": null, "sentiment": "bad"
        }"#;
        assert!(serde_json::from_str::<RawInsight>(json).is_err());
    }

    #[test]
    fn test_gap_priority_closed_set() {
        assert_eq!("dealbreaker".parse::<GapPriority>(), Ok(GapPriority::Dealbreaker));
        assert!("urgent".parse::<GapPriority>().is_err());
    }
}

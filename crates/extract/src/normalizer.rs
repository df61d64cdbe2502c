use ingest::{RequestKey, TranscriptUnit};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::registry::FeatureRegistry;
use crate::schema::{GapPriority, Insight, Provenance, RawInsight};
use crate::taxonomy::{FeatureNameEntry, InsightType, Taxonomy};

/// lowercase words joined by single underscores
static FEATURE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(_[a-z0-9]+)*$").expect("feature pattern is a valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParseErrorKind {
    MalformedResponse,
    UnknownInsightType,
    UnknownSubtype,
    MissingModule,
    UnknownModule,
    InvalidFeatureName,
    InvalidInsight,
}

impl ParseErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseErrorKind::MalformedResponse => "malformed_response",
            ParseErrorKind::UnknownInsightType => "unknown_insight_type",
            ParseErrorKind::UnknownSubtype => "unknown_subtype",
            ParseErrorKind::MissingModule => "missing_module",
            ParseErrorKind::UnknownModule => "unknown_module",
            ParseErrorKind::InvalidFeatureName => "invalid_feature_name",
            ParseErrorKind::InvalidInsight => "invalid_insight",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("malformed response for {key}: {reason}")]
    MalformedResponse { key: RequestKey, reason: String },

    #[error("unknown insight type '{0}'")]
    UnknownInsightType(String),

    #[error("unknown {insight_type} subtype '{subtype}'")]
    UnknownSubtype {
        insight_type: InsightType,
        subtype: String,
    },

    #[error("product_gap insight has no module")]
    MissingModule,

    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("invalid feature name '{0}'")]
    InvalidFeatureName(String),

    #[error("invalid insight: {0}")]
    InvalidInsight(String),
}

impl ParseError {
    pub fn kind(&self) -> ParseErrorKind {
        match self {
            ParseError::MalformedResponse { .. } => ParseErrorKind::MalformedResponse,
            ParseError::UnknownInsightType(_) => ParseErrorKind::UnknownInsightType,
            ParseError::UnknownSubtype { .. } => ParseErrorKind::UnknownSubtype,
            ParseError::MissingModule => ParseErrorKind::MissingModule,
            ParseError::UnknownModule(_) => ParseErrorKind::UnknownModule,
            ParseError::InvalidFeatureName(_) => ParseErrorKind::InvalidFeatureName,
            ParseError::InvalidInsight(_) => ParseErrorKind::InvalidInsight,
        }
    }
}

/// Everything parsed out of one raw response, in emission order.
#[derive(Debug)]
pub struct ParseOutput {
    pub key: RequestKey,
    pub items: Vec<Result<Insight, ParseError>>,
    /// Insights whose confidence was clamped into [0, 1].
    pub clamped: usize,
    /// Feature codes first seen in this response.
    pub new_features: Vec<FeatureNameEntry>,
}

impl ParseOutput {
    /// The whole response failed to decode; its request stays unresolved.
    pub fn is_malformed(&self) -> bool {
        self.items
            .iter()
            .any(|item| matches!(item, Err(ParseError::MalformedResponse { .. })))
    }

    pub fn split(self) -> (Vec<Insight>, Vec<ParseError>) {
        let mut insights = Vec::new();
        let mut errors = Vec::new();
        for item in self.items {
            match item {
                Ok(insight) => insights.push(insight),
                Err(e) => errors.push(e),
            }
        }
        (insights, errors)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    insights: Vec<Value>,
}

/// Validates model output against a taxonomy snapshot and turns it into
/// persistable insights.
///
/// Holds no per-response state, so responses can be parsed concurrently; the
/// only shared write is feature registration.
pub struct ResponseNormalizer {
    taxonomy: Arc<Taxonomy>,
    registry: Arc<FeatureRegistry>,
}

impl ResponseNormalizer {
    pub fn new(taxonomy: Arc<Taxonomy>, registry: Arc<FeatureRegistry>) -> Self {
        Self { taxonomy, registry }
    }

    pub fn registry(&self) -> &FeatureRegistry {
        &self.registry
    }

    pub fn parse(&self, raw: &str, unit: &TranscriptUnit, provenance: &Provenance) -> ParseOutput {
        let key = unit.key();
        let mut output = ParseOutput {
            key: key.clone(),
            items: Vec::new(),
            clamped: 0,
            new_features: Vec::new(),
        };

        let envelope: Envelope = match serde_json::from_str(raw.trim()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(key = %key, error = %e, "Malformed model response");
                output.items.push(Err(ParseError::MalformedResponse {
                    key,
                    reason: e.to_string(),
                }));
                return output;
            }
        };

        for value in envelope.insights {
            let item = self.normalize(value, unit, provenance, &mut output);
            if let Err(e) = &item {
                debug!(key = %key, kind = e.kind().as_str(), error = %e, "Dropped insight");
            }
            output.items.push(item);
        }
        output
    }

    fn normalize(
        &self,
        value: Value,
        unit: &TranscriptUnit,
        provenance: &Provenance,
        output: &mut ParseOutput,
    ) -> Result<Insight, ParseError> {
        let type_code = value
            .get("insight_type")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::InvalidInsight("missing insight_type".into()))?;
        let insight_type: InsightType = type_code
            .trim()
            .parse()
            .map_err(|_| ParseError::UnknownInsightType(type_code.to_string()))?;

        let raw: RawInsight =
            serde_json::from_value(value).map_err(|e| ParseError::InvalidInsight(e.to_string()))?;

        let summary = raw.summary.trim().to_string();
        if summary.is_empty() {
            return Err(ParseError::InvalidInsight("empty summary".into()));
        }

        let relationship = clean(raw.competitor_relationship)
            .filter(|r| self.taxonomy.relationship_known(r));
        let mut subtype = raw.insight_subtype.trim().to_string();
        if insight_type == InsightType::CompetitiveSignal && !self.taxonomy.relationship_known(&subtype) {
            if let Some(r) = &relationship {
                subtype = r.clone();
            }
        }
        if !self.taxonomy.subtype_known(insight_type, &subtype) {
            return Err(ParseError::UnknownSubtype {
                insight_type,
                subtype,
            });
        }

        let module = match (insight_type, clean(raw.module)) {
            (InsightType::ProductGap, None) => return Err(ParseError::MissingModule),
            (InsightType::ProductGap, Some(m)) if !self.taxonomy.module_known(&m) => {
                return Err(ParseError::UnknownModule(m));
            }
            (_, Some(m)) if !self.taxonomy.module_known(&m) => {
                warn!(key = %unit.key(), module = %m, "Dropping unknown module from insight");
                None
            }
            (_, module) => module,
        };
        let module = match (insight_type, module) {
            (InsightType::Pain, None) => self.taxonomy.pain_module(&subtype).map(str::to_string),
            (InsightType::DealFriction, Some(m)) => {
                debug!(key = %unit.key(), module = %m, "Deal friction carries no module");
                None
            }
            (_, module) => module,
        };

        if raw.confidence.is_nan() {
            return Err(ParseError::InvalidInsight("confidence is not a number".into()));
        }
        let confidence = raw.confidence.clamp(0.0, 1.0);
        if confidence != raw.confidence {
            warn!(key = %unit.key(), confidence = raw.confidence, "Clamped confidence into [0, 1]");
            output.clamped += 1;
        }

        let mut insight = Insight {
            content_hash: content_hash(&unit.transcript_id, unit.chunk_index, insight_type, &subtype, &summary),
            transcript_id: unit.transcript_id.clone(),
            transcript_chunk: unit.chunk_index,
            insight_type,
            insight_subtype: subtype.clone(),
            module,
            summary,
            verbatim_quote: clean(raw.verbatim_quote),
            confidence,
            competitor_name: None,
            competitor_relationship: None,
            feature_name: None,
            gap_description: None,
            gap_priority: None,
            faq_topic: None,
            crm: unit.crm_context.clone(),
            model_used: provenance.model_used.clone(),
            prompt_version: provenance.prompt_version.clone(),
            batch_id: provenance.batch_id.clone(),
            processed_at: provenance.processed_at,
        };

        match insight_type {
            InsightType::CompetitiveSignal => {
                insight.competitor_name = raw
                    .competitor_name
                    .as_deref()
                    .and_then(|name| self.taxonomy.normalize_competitor(name));
                insight.competitor_relationship = relationship.or(Some(subtype));
            }
            InsightType::ProductGap => {
                insight.gap_priority = match clean(raw.gap_priority) {
                    Some(p) => Some(p.parse::<GapPriority>().map_err(ParseError::InvalidInsight)?),
                    None => None,
                };
                insight.gap_description = clean(raw.gap_description);
                insight.feature_name = match clean(raw.feature_name) {
                    Some(code) => Some(self.check_feature(code, &insight.module, output)?),
                    None => None,
                };
            }
            InsightType::Faq => {
                insight.faq_topic = clean(raw.faq_topic)
                    .filter(|t| self.taxonomy.subtype_known(InsightType::Faq, t))
                    .or(Some(subtype));
            }
            InsightType::Pain | InsightType::DealFriction => {}
        }

        Ok(insight)
    }

    /// Known codes pass; a novel code must be slug-shaped and is registered.
    fn check_feature(
        &self,
        code: String,
        module: &Option<String>,
        output: &mut ParseOutput,
    ) -> Result<String, ParseError> {
        if self.registry.is_known(&code) {
            return Ok(code);
        }
        if !FEATURE_PATTERN.is_match(&code) {
            return Err(ParseError::InvalidFeatureName(code));
        }
        let entry = FeatureNameEntry::discovered(&code, module.clone());
        if self.registry.register(entry.clone()) {
            output.new_features.push(entry);
        }
        Ok(code)
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != "null")
}

/// Dedup fingerprint: sha256 over transcript, chunk, classification and the
/// whitespace-normalized summary.
pub fn content_hash(
    transcript_id: &str,
    chunk_index: u32,
    insight_type: InsightType,
    insight_subtype: &str,
    summary: &str,
) -> String {
    let normalized = summary.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{}|{}|{}|{}",
            transcript_id, chunk_index, insight_type, insight_subtype, normalized
        )
        .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

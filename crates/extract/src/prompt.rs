use anyhow::{Context, Result};
use ingest::{RequestKey, TranscriptUnit};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::info;

use crate::taxonomy::Taxonomy;

const BUILTIN_FEW_SHOT: &str = include_str!("../../../data/few_shot_examples.json");

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v(\d+)\.(\d+)(?:\+qa(\d+))?$").expect("version pattern is a valid regex")
});

#[derive(Debug, Error, PartialEq)]
#[error("invalid prompt version '{0}', expected vMAJOR.MINOR[+qaN]")]
pub struct PromptVersionError(pub String);

/// `vMAJOR.MINOR[+qaN]`, stored on every insight it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromptVersion {
    pub major: u32,
    pub minor: u32,
    pub qa_revision: Option<u32>,
}

impl PromptVersion {
    pub fn parse(s: &str) -> Result<Self, PromptVersionError> {
        let caps = VERSION_PATTERN
            .captures(s.trim())
            .ok_or_else(|| PromptVersionError(s.to_string()))?;
        let number = |i: usize| -> Result<Option<u32>, PromptVersionError> {
            caps.get(i)
                .map(|m| m.as_str().parse::<u32>())
                .transpose()
                .map_err(|_| PromptVersionError(s.to_string()))
        };

        Ok(Self {
            major: number(1)?.unwrap_or_default(),
            minor: number(2)?.unwrap_or_default(),
            qa_revision: number(3)?,
        })
    }

    /// The effective version for a run: the configured base, tagged with the
    /// QA revision when refinement rules are active.
    pub fn resolve(base: &str, refinements: Option<&Refinements>) -> Result<Self, PromptVersionError> {
        let version = Self::parse(base)?;
        Ok(match refinements {
            Some(r) if r.is_active() => version.with_qa_revision(r.revision),
            _ => version,
        })
    }

    pub fn bump_major(self) -> Self {
        Self {
            major: self.major + 1,
            minor: 0,
            qa_revision: None,
        }
    }

    pub fn bump_minor(self) -> Self {
        Self {
            minor: self.minor + 1,
            qa_revision: None,
            ..self
        }
    }

    pub fn with_qa_revision(self, revision: u32) -> Self {
        Self {
            qa_revision: Some(revision),
            ..self
        }
    }
}

impl fmt::Display for PromptVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)?;
        if let Some(qa) = self.qa_revision {
            write!(f, "+qa{}", qa)?;
        }
        Ok(())
    }
}

/// Extra rules produced by the QA review loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Refinements {
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub additional_rules: Vec<String>,
}

impl Refinements {
    /// `Ok(None)` when the file does not exist. A file that exists but does
    /// not parse is an error, never silently ignored.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read refinements file: {:?}", path))?;
        let refinements: Refinements = serde_json::from_str(&content)
            .context(format!("Failed to parse refinements file: {:?}", path))?;
        info!(
            revision = refinements.revision,
            rules = refinements.additional_rules.len(),
            "Loaded prompt refinements"
        );
        Ok(Some(refinements))
    }

    pub fn is_active(&self) -> bool {
        !self.additional_rules.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub transcript: String,
    pub response: Value,
}

impl FewShotExample {
    pub fn builtin() -> Result<Vec<Self>> {
        serde_json::from_str(BUILTIN_FEW_SHOT).context("Failed to parse built-in few-shot examples")
    }

    pub fn load(path: &Path) -> Result<Vec<Self>> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read few-shot examples: {:?}", path))?;
        serde_json::from_str(&content).context(format!("Failed to parse few-shot examples: {:?}", path))
    }
}

/// A prompt pair addressed to one transcript chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRequest {
    pub key: RequestKey,
    /// Shared by every request of a run.
    pub system_prompt: Arc<str>,
    pub user_prompt: String,
}

/// Renders the run-wide system prompt once and a user prompt per chunk.
///
/// Output depends only on the constructor inputs, so rebuilding a request on
/// resume reproduces it byte for byte.
pub struct PromptBuilder {
    system_prompt: Arc<str>,
}

impl PromptBuilder {
    pub fn new(
        taxonomy: &Taxonomy,
        refinements: Option<&Refinements>,
        few_shot: &[FewShotExample],
        summary_language: &str,
    ) -> Result<Self> {
        let system_prompt = build_system_prompt(taxonomy, refinements, few_shot, summary_language)?;
        Ok(Self {
            system_prompt: Arc::from(system_prompt),
        })
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn user_prompt(&self, unit: &TranscriptUnit) -> String {
        let fields = unit.crm_context.labelled_fields();
        let context = if fields.is_empty() {
            "- No CRM context available".to_string()
        } else {
            fields
                .iter()
                .map(|(label, value)| format!("- {}: {}", label, value))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            r#"## Deal context

{}

## Transcript

{}"#,
            context, unit.text
        )
    }

    pub fn build(&self, unit: &TranscriptUnit) -> ExtractionRequest {
        ExtractionRequest {
            key: unit.key(),
            system_prompt: Arc::clone(&self.system_prompt),
            user_prompt: self.user_prompt(unit),
        }
    }
}

fn build_system_prompt(
    taxonomy: &Taxonomy,
    refinements: Option<&Refinements>,
    few_shot: &[FewShotExample],
    summary_language: &str,
) -> Result<String> {
    let mut sections = vec![
        header(summary_language),
        modules_section(taxonomy),
        pains_section(taxonomy),
        code_table(
            "Product gap subtypes",
            "Every product_gap carries one of these as `insight_subtype`.",
            &taxonomy.product_gap_subtypes,
        ),
        code_table(
            "Deal friction subtypes",
            "Things that block or slow the purchase.",
            &taxonomy.deal_friction_subtypes,
        ),
        code_table(
            "FAQ topics",
            "For faq, `insight_subtype` and `faq_topic` are both the topic code.",
            &taxonomy.faq_topics,
        ),
        code_table(
            "Competitive relationships",
            "For competitive_signal, `insight_subtype` and `competitor_relationship` are both the relationship code.",
            &taxonomy.competitive_relationships,
        ),
        features_section(taxonomy),
        competitors_section(taxonomy),
        output_section(),
        few_shot_section(few_shot)?,
    ];

    if let Some(r) = refinements.filter(|r| r.is_active()) {
        let mut lines = vec![
            "# Additional rules (QA)\n".to_string(),
            "These rules come from reviewing earlier extractions. Apply them with particular care:\n"
                .to_string(),
        ];
        for (i, rule) in r.additional_rules.iter().enumerate() {
            lines.push(format!("{}. {}", i + 1, rule));
        }
        sections.push(lines.join("\n"));
    }

    Ok(sections.join("\n\n"))
}

fn header(summary_language: &str) -> String {
    format!(
        r#"# Instructions

You are an expert B2B sales analyst for HR software. Extract structured insights from a sales call transcript.

Extract EVERY insight in the transcript. Classify each one as exactly ONE type:

| Type | Code | When to use it |
|------|------|----------------|
| Pain | `pain` | The prospect describes a current problem in their own organization |
| Product gap | `product_gap` | The prospect asks for a specific capability the product lacks or covers poorly |
| Competitive signal | `competitive_signal` | A competitor is mentioned (in use, being evaluated, being replaced) |
| Deal friction | `deal_friction` | Something slows or blocks the purchase |
| FAQ | `faq` | The prospect asks a general question about the product |

Pain vs product gap: a problem the prospect lives with today is a pain; a concrete feature request is a product_gap. Emit both only when the transcript contains both.
FAQ vs product gap: asking whether a capability exists is faq; a confirmed missing capability is product_gap. When unsure, prefer faq.
Deal friction vs pain: a problem in the prospect's organization is a pain; something blocking this purchase is deal_friction.

Module rules:
- `pain`: optional, where the pain happens
- `product_gap`: REQUIRED, the module that would cover the gap
- `competitive_signal`: optional, only when the competitor covers a specific module
- `deal_friction`: never set
- `faq`: optional, only when the question is about a specific module

Rules:
1. Use ONLY codes listed in this taxonomy. The one exception is `feature_name`: when no listed feature fits, create a new code in lowercase_with_underscores form.
2. Write each `summary` in {}, 1-2 sentences.
3. Include `verbatim_quote` whenever possible.
4. `confidence` ranges from 0 to 1 (1 = certain, 0.5 = inferred from context).
5. Do not invent insights that are not in the transcript. Omit types with no insights."#,
        summary_language
    )
}

fn modules_section(taxonomy: &Taxonomy) -> String {
    let mut lines = vec![
        "# Taxonomy: modules\n".to_string(),
        "| Module code | Display name | HR category | Status |".to_string(),
        "|---|---|---|---|".to_string(),
    ];
    for m in &taxonomy.modules {
        let category = taxonomy.category_display(&m.hr_category).unwrap_or(&m.hr_category);
        lines.push(format!(
            "| `{}` | {} | {} | {} |",
            m.code, m.display_name, category, m.status
        ));
    }

    lines.push("\n## Module aliases".to_string());
    lines.push("Map any of these mentions to the module shown:\n".to_string());
    for m in &taxonomy.modules {
        let aliases: Vec<&str> = taxonomy
            .module_aliases
            .iter()
            .filter(|a| a.module == m.code)
            .map(|a| a.alias.as_str())
            .collect();
        if !aliases.is_empty() {
            lines.push(format!("- **{}** (`{}`): {}", m.display_name, m.code, aliases.join(", ")));
        }
    }
    lines.join("\n")
}

fn pains_section(taxonomy: &Taxonomy) -> String {
    let mut lines = vec![
        format!("# Taxonomy: pain subtypes ({})\n", taxonomy.pain_subtypes.len()),
        "A pain subtype names the PATTERN of the problem. `module` separately records WHERE it happens. When a subtype is linked to a module, use that module.".to_string(),
    ];

    let mut themes: Vec<&str> = Vec::new();
    for p in &taxonomy.pain_subtypes {
        if !themes.contains(&p.theme.as_str()) {
            themes.push(&p.theme);
        }
    }

    for theme in themes {
        lines.push(format!("\n## Theme: `{}`", theme));
        lines.push("| Code | Display name | Module | Description |".to_string());
        lines.push("|---|---|---|---|".to_string());
        for p in taxonomy.pain_subtypes.iter().filter(|p| p.theme == theme) {
            lines.push(format!(
                "| `{}` | {} | {} | {} |",
                p.code,
                p.display_name,
                p.module.as_deref().unwrap_or("-"),
                p.description
            ));
        }
    }
    lines.join("\n")
}

fn code_table(title: &str, note: &str, entries: &[crate::taxonomy::CodeEntry]) -> String {
    let mut lines = vec![
        format!("# Taxonomy: {}\n", title),
        format!("{}\n", note),
        "| Code | Display name | Description |".to_string(),
        "|---|---|---|".to_string(),
    ];
    for e in entries {
        lines.push(format!(
            "| `{}` | {} | {} |",
            e.code,
            e.display_name,
            e.description.as_deref().unwrap_or("")
        ));
    }
    lines.join("\n")
}

fn features_section(taxonomy: &Taxonomy) -> String {
    let mut lines = vec![
        "# Taxonomy: product gap feature names\n".to_string(),
        "Use these codes when they fit. Otherwise create a new lowercase_with_underscores code.\n"
            .to_string(),
        "| Code | Display name | Suggested module |".to_string(),
        "|---|---|---|".to_string(),
    ];
    for f in &taxonomy.features {
        lines.push(format!(
            "| `{}` | {} | {} |",
            f.code,
            f.display_name,
            f.suggested_module.as_deref().unwrap_or("-")
        ));
    }
    lines.push(
        "\n**gap_priority:** `must_have` (required), `nice_to_have` (would help), `dealbreaker` (will not buy without it)"
            .to_string(),
    );
    lines.join("\n")
}

fn competitors_section(taxonomy: &Taxonomy) -> String {
    let mut lines = vec![
        "# Known competitors\n".to_string(),
        "Normalize `competitor_name` to this list. If the competitor is not listed, use the name as the prospect said it.\n"
            .to_string(),
    ];

    let mut regions: Vec<&str> = taxonomy.competitors.iter().map(|c| c.region.as_str()).collect();
    regions.sort_unstable();
    regions.dedup();

    for region in regions {
        let mut names: Vec<&str> = taxonomy
            .competitors
            .iter()
            .filter(|c| c.region == region)
            .map(|c| c.name.as_str())
            .collect();
        names.sort_unstable();
        lines.push(format!("- {}: {}", region.to_uppercase().replace('_', " "), names.join(", ")));
    }
    lines.join("\n")
}

fn output_section() -> String {
    r#"# Output format

Respond with a JSON object holding a list of insights. Every insight carries every field; use null where a field does not apply.

```
{
  "insights": [
    {
      "insight_type": "pain|product_gap|competitive_signal|deal_friction|faq",
      "insight_subtype": "<taxonomy code>",
      "module": "<module code or null>",
      "summary": "<1-2 sentence summary>",
      "verbatim_quote": "<literal quote or null>",
      "confidence": 0.0,
      "competitor_name": "<normalized name or null>",
      "competitor_relationship": "<relationship code or null>",
      "feature_name": "<feature code or null>",
      "gap_description": "<gap description or null>",
      "gap_priority": "must_have|nice_to_have|dealbreaker|null",
      "faq_topic": "<faq topic code or null>"
    }
  ]
}
```

Required per type:
- pain: insight_subtype (pain code), summary, confidence; module when it applies
- product_gap: insight_subtype (product gap subtype), module (REQUIRED), feature_name, gap_description, gap_priority
- competitive_signal: insight_subtype = relationship code, competitor_name, competitor_relationship
- deal_friction: insight_subtype (friction code), summary, confidence
- faq: insight_subtype = topic code, faq_topic, summary"#
        .to_string()
}

fn few_shot_section(examples: &[FewShotExample]) -> Result<String> {
    let mut lines = vec!["# Examples".to_string()];
    for (i, example) in examples.iter().enumerate() {
        let response = serde_json::to_string_pretty(&example.response)
            .context("Failed to render few-shot response")?;
        lines.push(format!(
            "\n## Example {}\n\nTranscript: \"{}\"\n\nExpected response:\n```json\n{}\n```",
            i + 1,
            example.transcript,
            response
        ));
    }
    Ok(lines.join("\n"))
}

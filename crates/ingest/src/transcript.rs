use serde::{Deserialize, Serialize};

/// Deal and company fields joined onto a transcript by the read source.
///
/// Every field is optional: columns added to (or missing from) the transcript
/// view deserialize as `None` rather than failing the record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrmContext {
    pub deal_id: Option<String>,
    pub deal_name: Option<String>,
    pub company_name: Option<String>,
    #[serde(alias = "deal_region")]
    pub region: Option<String>,
    #[serde(alias = "deal_country")]
    pub country: Option<String>,
    pub industry: Option<String>,
    pub company_size: Option<String>,
    pub segment: Option<String>,
    pub amount: Option<f64>,
    pub deal_stage: Option<String>,
    pub deal_owner: Option<String>,
    pub call_owner: Option<String>,
    pub call_date: Option<String>,
}

impl CrmContext {
    /// Labelled, non-empty fields in a fixed order, for prompt framing.
    pub fn labelled_fields(&self) -> Vec<(&'static str, String)> {
        let text = [
            ("Deal", &self.deal_name),
            ("Company", &self.company_name),
            ("Region", &self.region),
            ("Country", &self.country),
            ("Industry", &self.industry),
            ("Company size", &self.company_size),
            ("Segment", &self.segment),
            ("Stage", &self.deal_stage),
            ("Deal owner", &self.deal_owner),
            ("Call owner", &self.call_owner),
            ("Call date", &self.call_date),
        ];

        let mut fields: Vec<(&'static str, String)> = text
            .into_iter()
            .filter_map(|(label, value)| {
                value
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| (label, v.to_string()))
            })
            .collect();

        if let Some(amount) = self.amount {
            fields.push(("Amount", format!("{:.2}", amount)));
        }
        fields
    }
}

/// One row of the transcript view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRecord {
    #[serde(alias = "id")]
    pub transcript_id: String,
    #[serde(default, alias = "text")]
    pub transcript_text: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(flatten)]
    pub crm: CrmContext,
}

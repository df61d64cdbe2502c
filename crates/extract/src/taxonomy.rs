use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

const BUILTIN_TAXONOMY: &str = include_str!("../../../data/taxonomy.json");

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("Failed to read taxonomy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid taxonomy JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Inconsistent taxonomy: {0}")]
    Inconsistent(String),
}

/// The five closed classification types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Pain,
    ProductGap,
    CompetitiveSignal,
    DealFriction,
    Faq,
}

impl InsightType {
    pub const ALL: [InsightType; 5] = [
        InsightType::Pain,
        InsightType::ProductGap,
        InsightType::CompetitiveSignal,
        InsightType::DealFriction,
        InsightType::Faq,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InsightType::Pain => "pain",
            InsightType::ProductGap => "product_gap",
            InsightType::CompetitiveSignal => "competitive_signal",
            InsightType::DealFriction => "deal_friction",
            InsightType::Faq => "faq",
        }
    }
}

impl fmt::Display for InsightType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InsightType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InsightType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown insight type '{}'", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeEntry {
    pub code: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub code: String,
    pub display_name: String,
    pub hr_category: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleAlias {
    pub alias: String,
    pub module: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PainSubtype {
    pub code: String,
    pub display_name: String,
    pub theme: String,
    #[serde(default)]
    pub module: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competitor {
    pub name: String,
    pub region: String,
}

/// A product-gap feature code. Seeds ship with the taxonomy; the rest are
/// discovered in model output and registered at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureNameEntry {
    pub code: String,
    pub display_name: String,
    #[serde(default)]
    pub suggested_module: Option<String>,
    #[serde(default)]
    pub is_seed: bool,
}

impl FeatureNameEntry {
    /// A runtime-discovered feature, titled from its code.
    pub fn discovered(code: &str, suggested_module: Option<String>) -> Self {
        Self {
            code: code.to_string(),
            display_name: display_name_for(code),
            suggested_module,
            is_seed: false,
        }
    }
}

/// `missing_sso_support` -> `Missing Sso Support`
pub fn display_name_for(code: &str) -> String {
    code.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Deserialize)]
struct TaxonomyData {
    version: String,
    insight_types: Vec<CodeEntry>,
    hr_categories: Vec<CodeEntry>,
    modules: Vec<ModuleEntry>,
    #[serde(default)]
    module_aliases: Vec<ModuleAlias>,
    pain_subtypes: Vec<PainSubtype>,
    product_gap_subtypes: Vec<CodeEntry>,
    deal_friction_subtypes: Vec<CodeEntry>,
    faq_topics: Vec<CodeEntry>,
    competitive_relationships: Vec<CodeEntry>,
    #[serde(default)]
    competitors: Vec<Competitor>,
    #[serde(default)]
    seed_features: Vec<FeatureNameEntry>,
}

/// Immutable snapshot of the reference codes for one run.
///
/// Discovered feature names are merged in with [`Taxonomy::with_features`]
/// when the snapshot is built; a snapshot is never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    pub version: String,
    pub insight_types: Vec<CodeEntry>,
    pub hr_categories: Vec<CodeEntry>,
    pub modules: Vec<ModuleEntry>,
    pub module_aliases: Vec<ModuleAlias>,
    pub pain_subtypes: Vec<PainSubtype>,
    pub product_gap_subtypes: Vec<CodeEntry>,
    pub deal_friction_subtypes: Vec<CodeEntry>,
    pub faq_topics: Vec<CodeEntry>,
    pub competitive_relationships: Vec<CodeEntry>,
    pub competitors: Vec<Competitor>,
    /// Seeds in file order, then discovered codes sorted by code.
    pub features: Vec<FeatureNameEntry>,

    subtypes: HashMap<InsightType, HashSet<String>>,
    module_codes: HashSet<String>,
    feature_codes: HashSet<String>,
    pain_modules: HashMap<String, String>,
}

impl Taxonomy {
    /// The reference dataset compiled into the crate.
    pub fn builtin() -> Result<Self, TaxonomyError> {
        Self::from_json_str(BUILTIN_TAXONOMY)
    }

    pub fn from_json_str(json: &str) -> Result<Self, TaxonomyError> {
        let data: TaxonomyData = serde_json::from_str(json)?;
        Self::from_data(data)
    }

    pub fn load(path: &Path) -> Result<Self, TaxonomyError> {
        let json = std::fs::read_to_string(path).map_err(|source| TaxonomyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    fn from_data(data: TaxonomyData) -> Result<Self, TaxonomyError> {
        let declared: BTreeSet<&str> = data.insight_types.iter().map(|t| t.code.as_str()).collect();
        let expected: BTreeSet<&str> = InsightType::ALL.iter().map(|t| t.as_str()).collect();
        if declared != expected {
            return Err(TaxonomyError::Inconsistent(format!(
                "insight types {:?} do not match {:?}",
                declared, expected
            )));
        }

        let categories: HashSet<&str> = data.hr_categories.iter().map(|c| c.code.as_str()).collect();
        let mut module_codes = HashSet::new();
        for module in &data.modules {
            if !categories.contains(module.hr_category.as_str()) {
                return Err(TaxonomyError::Inconsistent(format!(
                    "module '{}' references unknown category '{}'",
                    module.code, module.hr_category
                )));
            }
            if !module_codes.insert(module.code.clone()) {
                return Err(TaxonomyError::Inconsistent(format!(
                    "duplicate module code '{}'",
                    module.code
                )));
            }
        }

        let check_module = |owner: &str, module: &str| {
            if module_codes.contains(module) {
                Ok(())
            } else {
                Err(TaxonomyError::Inconsistent(format!(
                    "{} references unknown module '{}'",
                    owner, module
                )))
            }
        };
        for alias in &data.module_aliases {
            check_module(&format!("alias '{}'", alias.alias), &alias.module)?;
        }
        let mut pain_modules = HashMap::new();
        for pain in &data.pain_subtypes {
            if let Some(module) = &pain.module {
                check_module(&format!("pain subtype '{}'", pain.code), module)?;
                pain_modules.insert(pain.code.clone(), module.clone());
            }
        }

        let codes = |entries: &[CodeEntry]| -> HashSet<String> {
            entries.iter().map(|e| e.code.clone()).collect()
        };
        let mut subtypes: HashMap<InsightType, HashSet<String>> = HashMap::new();
        subtypes.insert(
            InsightType::Pain,
            data.pain_subtypes.iter().map(|p| p.code.clone()).collect(),
        );
        subtypes.insert(InsightType::ProductGap, codes(&data.product_gap_subtypes));
        subtypes.insert(InsightType::CompetitiveSignal, codes(&data.competitive_relationships));
        subtypes.insert(InsightType::DealFriction, codes(&data.deal_friction_subtypes));
        subtypes.insert(InsightType::Faq, codes(&data.faq_topics));

        let features: Vec<FeatureNameEntry> = data
            .seed_features
            .into_iter()
            .map(|f| FeatureNameEntry { is_seed: true, ..f })
            .collect();
        let feature_codes = features.iter().map(|f| f.code.clone()).collect();

        Ok(Self {
            version: data.version,
            insight_types: data.insight_types,
            hr_categories: data.hr_categories,
            modules: data.modules,
            module_aliases: data.module_aliases,
            pain_subtypes: data.pain_subtypes,
            product_gap_subtypes: data.product_gap_subtypes,
            deal_friction_subtypes: data.deal_friction_subtypes,
            faq_topics: data.faq_topics,
            competitive_relationships: data.competitive_relationships,
            competitors: data.competitors,
            features,
            subtypes,
            module_codes,
            feature_codes,
            pain_modules,
        })
    }

    /// A new snapshot with previously discovered features merged in.
    ///
    /// Codes already present are ignored. The merged entries are ordered by
    /// code so the snapshot does not depend on discovery order.
    pub fn with_features(&self, discovered: impl IntoIterator<Item = FeatureNameEntry>) -> Self {
        let mut merged = self.clone();
        let mut extra: Vec<FeatureNameEntry> = discovered
            .into_iter()
            .filter(|f| !self.feature_codes.contains(&f.code))
            .collect();
        extra.sort_by(|a, b| a.code.cmp(&b.code));
        extra.dedup_by(|a, b| a.code == b.code);

        for feature in extra {
            merged.feature_codes.insert(feature.code.clone());
            merged.features.push(feature);
        }
        merged
    }

    pub fn subtype_known(&self, insight_type: InsightType, code: &str) -> bool {
        self.subtypes
            .get(&insight_type)
            .is_some_and(|codes| codes.contains(code))
    }

    pub fn module_known(&self, code: &str) -> bool {
        self.module_codes.contains(code)
    }

    pub fn feature_known(&self, code: &str) -> bool {
        self.feature_codes.contains(code)
    }

    pub fn relationship_known(&self, code: &str) -> bool {
        self.subtype_known(InsightType::CompetitiveSignal, code)
    }

    /// The module a pain subtype is linked to, if any.
    pub fn pain_module(&self, pain_code: &str) -> Option<&str> {
        self.pain_modules.get(pain_code).map(String::as_str)
    }

    /// Canonical competitor name: case-insensitive exact match first, then
    /// containment in either direction, otherwise the cleaned input.
    pub fn normalize_competitor(&self, raw: &str) -> Option<String> {
        let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if cleaned.is_empty() {
            return None;
        }
        let lower = cleaned.to_lowercase();

        if let Some(c) = self.competitors.iter().find(|c| c.name.to_lowercase() == lower) {
            return Some(c.name.clone());
        }
        if let Some(c) = self.competitors.iter().find(|c| {
            let known = c.name.to_lowercase();
            known.contains(&lower) || lower.contains(&known)
        }) {
            return Some(c.name.clone());
        }
        Some(cleaned)
    }

    pub fn category_display(&self, code: &str) -> Option<&str> {
        self.hr_categories
            .iter()
            .find(|c| c.code == code)
            .map(|c| c.display_name.as_str())
    }

    pub fn seed_features(&self) -> impl Iterator<Item = &FeatureNameEntry> {
        self.features.iter().filter(|f| f.is_seed)
    }
}

pub mod normalizer;
pub mod prompt;
pub mod registry;
pub mod schema;
pub mod taxonomy;

pub use normalizer::{ParseError, ParseErrorKind, ParseOutput, ResponseNormalizer, content_hash};
pub use prompt::{
    ExtractionRequest, FewShotExample, PromptBuilder, PromptVersion, PromptVersionError, Refinements,
};
pub use registry::FeatureRegistry;
pub use schema::{GapPriority, Insight, Provenance, RawInsight, response_format};
pub use taxonomy::{FeatureNameEntry, InsightType, Taxonomy, TaxonomyError};

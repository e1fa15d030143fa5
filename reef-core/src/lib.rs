pub mod crd;
pub mod error;
pub mod labels;

pub use error::OsdError;

/// Comma-separated list of canonical label selectors which match the
/// Reef Operator's labelling scheme.
pub const REEF_OPERATOR_LABEL_SELECTORS: &str = "app=reef-osd,reef.rs/controlled-by=reef-operator";

//! Install configuration, feature registry, and phase numbering for Stackwright.
//!
//! This crate defines the schema layer: TOML install configuration parsing and
//! validation (`InstallConfig`), host auto-detection (`HostFacts`), the static
//! optional-feature registry with its exclusion rules (`ExclusionList`), and
//! the ordered, fraction-friendly `PhaseNumber` used to sequence phases.

pub mod config;
pub mod detect;
pub mod features;
pub mod types;

pub use config::{
    parse_config_file, parse_config_str, ConfigError, CredentialsSection, Environment,
    IdentitySection, InstallConfig, NetworkSection, PerformanceSection, REDACTED,
};
pub use detect::HostFacts;
pub use features::{
    categories, category_of, find_feature, is_excluded, ExclusionList, Feature, UnknownExclusion,
    CATEGORY_PREFIX, FEATURES,
};
pub use types::PhaseNumber;

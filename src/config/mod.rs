//! Configuration types and loading

mod loader;
mod types;

pub use loader::{default_config_json, load_config, load_config_str, load_config_with_env};
pub use types::{
    BandwidthSection, Config, DelaySection, LogSection, LossSection, PercentileSection,
    ProfileConfig, RouterSection, TunSection, ValueSpec,
};

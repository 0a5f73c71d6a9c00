//! Configuration system for kensa
//!
//! Settings come from a configuration file found by walking up from the
//! working directory (see [`ConfigLoader::auto_discover`]); command line flags
//! are merged over it with [`KensaConfiguration::merge_with`].
//!
//! ## Example Configuration
//!
//! ```yaml
//! server:
//!   baseUrl: https://fhir.example.org/r4
//!   timeoutSeconds: 30
//! run:
//!   patientIds: ["85", "355"]
//!   postSearch: true
//! metadata:
//!   paths: [metadata]
//! terminology:
//!   valueSetDirectories: [terminology]
//! ```

mod kensa_config;
mod loader;

pub use kensa_config::{
    DEFAULT_TIMEOUT_SECONDS, KensaConfiguration, MetadataConfiguration, RunConfiguration,
    ServerConfiguration, TerminologyConfiguration,
};
pub use loader::{CONFIG_FILE_NAMES, ConfigLoader};

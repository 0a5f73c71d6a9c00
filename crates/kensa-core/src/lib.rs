//! Kensa Core
//!
//! Conformance testing engine for FHIR profile servers. Profile metadata is
//! compiled into ordered test plans, which the execution harness runs
//! against a live server.

pub mod classifier;
pub mod client;
pub mod config;
pub mod error;
pub mod fhir_path;
pub mod harness;
pub mod metadata;
pub mod plan;
pub mod resolver;
pub mod result;
pub mod retry;
pub mod terminology;
pub mod validation;

// Re-export commonly used types
pub use classifier::{ClassifiedProfile, DelayedReference, classify, delayed_references, is_delayed};
pub use client::{FhirClient, FhirResponse, HttpFhirClient, SearchMethod, SearchParams};
pub use config::{ConfigLoader, KensaConfiguration};
pub use error::{ErrorKind, KensaError};
pub use harness::{
    RunOptions, SequenceReport, SequenceRunner, SuiteReport, SuiteRunner, TestOutcome, TestResult,
};
pub use metadata::{MetadataSet, ProfileMetadata};
pub use plan::{TestSpecification, compile, compile_all};
pub use result::Result;
pub use terminology::{InMemoryTerminology, TerminologyError, TerminologyValidator};

/// Initialize the tracing subscriber for logging
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("kensa=info,kensa_core=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true),
        )
        .init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

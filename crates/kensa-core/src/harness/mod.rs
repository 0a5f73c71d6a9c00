//! Execution harness
//!
//! Interprets compiled [`TestSpecification`]s against a server. Each profile
//! runs as a sequence: its tests execute strictly in plan order against a
//! private [`SequenceState`], and every step either continues or ends the
//! test with a [`StepSignal`]. A signal ends only the current test.
//!
//! [`SuiteRunner`] runs the sequences of non-delayed profiles concurrently,
//! then runs delayed profiles with the references the first wave discovered.

mod checks;
mod must_support;
mod search;
mod state;

pub use must_support::missing_must_support;
pub use state::{DiscoveredReferences, PatientSearch, SequenceState, TestContext};

use crate::classifier::is_delayed;
use crate::client::FhirClient;
use crate::error::KensaError;
use crate::metadata::{MetadataSet, ProfileMetadata};
use crate::plan::{Guard, Step, TestSpecification, compile_all};
use crate::terminology::{TerminologyValidator, registry};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Terminal outcome of one test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Pass,
    Fail,
    Skip,
    Omit,
    Todo,
}

impl TestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestOutcome::Pass => "pass",
            TestOutcome::Fail => "fail",
            TestOutcome::Skip => "skip",
            TestOutcome::Omit => "omit",
            TestOutcome::Todo => "todo",
        }
    }
}

impl std::fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a test: pending, running, then one terminal outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    Pending,
    Running,
    Finished(TestOutcome),
}

impl TestState {
    pub fn start(self) -> Self {
        match self {
            TestState::Pending => TestState::Running,
            other => other,
        }
    }

    pub fn finish(self, outcome: TestOutcome) -> Self {
        match self {
            TestState::Running => TestState::Finished(outcome),
            other => other,
        }
    }

    pub fn outcome(&self) -> Option<TestOutcome> {
        match self {
            TestState::Finished(outcome) => Some(*outcome),
            _ => None,
        }
    }
}

/// Early end of a test, raised by a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepSignal {
    Fail(String),
    Skip(String),
    Omit(String),
    Todo(String),
}

impl StepSignal {
    fn into_outcome(self) -> (TestOutcome, String) {
        match self {
            StepSignal::Fail(message) => (TestOutcome::Fail, message),
            StepSignal::Skip(message) => (TestOutcome::Skip, message),
            StepSignal::Omit(message) => (TestOutcome::Omit, message),
            StepSignal::Todo(message) => (TestOutcome::Todo, message),
        }
    }
}

/// Transport and decoding errors fail the current test
impl From<KensaError> for StepSignal {
    fn from(error: KensaError) -> Self {
        StepSignal::Fail(error.to_string())
    }
}

pub type StepResult = std::result::Result<(), StepSignal>;

/// Result of one test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub key: String,
    pub title: String,
    pub outcome: TestOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub optional: bool,
}

/// Results of one profile's sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceReport {
    pub profile: String,
    pub resource_type: String,
    pub results: Vec<TestResult>,
    /// References to delayed profiles found by this sequence
    #[serde(default, skip_serializing_if = "DiscoveredReferences::is_empty")]
    pub discovered: DiscoveredReferences,
}

impl SequenceReport {
    pub fn count(&self, outcome: TestOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn result(&self, key: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.key == key)
    }

    /// A required test failed
    pub fn failed(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.outcome == TestOutcome::Fail && !r.optional)
    }
}

/// A profile whose plan could not be compiled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileFailure {
    pub profile: String,
    pub message: String,
}

/// Results of a whole suite run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteReport {
    pub sequences: Vec<SequenceReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compile_failures: Vec<CompileFailure>,
}

impl SuiteReport {
    pub fn failed(&self) -> bool {
        !self.compile_failures.is_empty() || self.sequences.iter().any(SequenceReport::failed)
    }

    pub fn sequence(&self, profile: &str) -> Option<&SequenceReport> {
        self.sequences.iter().find(|s| s.profile == profile)
    }
}

/// Run-time settings shared by every sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub patient_ids: Vec<String>,
    /// Overrides the reference limit compiled into plans
    pub max_references: Option<usize>,
    /// Repeat first searches with POST
    pub post_search: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            patient_ids: Vec::new(),
            max_references: None,
            post_search: true,
        }
    }
}

/// Runs one profile's plan
pub struct SequenceRunner<'a> {
    pub(crate) profile: &'a ProfileMetadata,
    plan: &'a [TestSpecification],
    pub(crate) client: &'a dyn FhirClient,
    pub(crate) options: &'a RunOptions,
    /// References to this profile's resource type found by other sequences
    pub(crate) incoming: Vec<String>,
    pub(crate) capabilities: Option<Value>,
    terminology: Option<Arc<dyn TerminologyValidator>>,
}

impl<'a> SequenceRunner<'a> {
    pub fn new(
        profile: &'a ProfileMetadata,
        plan: &'a [TestSpecification],
        client: &'a dyn FhirClient,
        options: &'a RunOptions,
    ) -> Self {
        Self {
            profile,
            plan,
            client,
            options,
            incoming: Vec::new(),
            capabilities: None,
            terminology: None,
        }
    }

    pub fn with_incoming(mut self, references: Vec<String>) -> Self {
        self.incoming = references;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Option<Value>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Validator for binding checks; the process-wide one when not set
    pub fn with_terminology(mut self, validator: Arc<dyn TerminologyValidator>) -> Self {
        self.terminology = Some(validator);
        self
    }

    pub(crate) fn terminology(&self) -> Option<Arc<dyn TerminologyValidator>> {
        self.terminology.clone().or_else(registry::get)
    }

    pub(crate) fn resource_type(&self) -> &str {
        &self.profile.resource_type
    }

    pub async fn run(&self) -> SequenceReport {
        info!("Running {} ({} tests)", self.profile.canonical_name, self.plan.len());
        let mut state = SequenceState::default();
        let mut results = Vec::with_capacity(self.plan.len());

        for test in self.plan {
            let mut ctx = TestContext::default();
            let lifecycle = TestState::Pending.start();

            let (outcome, message) = match self.run_test(test, &mut state, &mut ctx).await {
                Ok(()) => (TestOutcome::Pass, None),
                Err(signal) => {
                    let (outcome, message) = signal.into_outcome();
                    (outcome, Some(message))
                }
            };
            let lifecycle = lifecycle.finish(outcome);
            debug!("{} -> {:?}", test.key, lifecycle);
            match outcome {
                TestOutcome::Fail => warn!(
                    "{} {}: {}",
                    test.key,
                    outcome,
                    message.as_deref().unwrap_or_default()
                ),
                _ => info!("{} {}", test.key, outcome),
            }

            results.push(TestResult {
                key: test.key.clone(),
                title: test.title.clone(),
                outcome,
                message,
                warnings: ctx.warnings,
                optional: test.optional,
            });
        }

        SequenceReport {
            profile: self.profile.canonical_name.clone(),
            resource_type: self.profile.resource_type.clone(),
            results,
            discovered: state.discovered,
        }
    }

    async fn run_test(
        &self,
        test: &TestSpecification,
        state: &mut SequenceState,
        ctx: &mut TestContext,
    ) -> StepResult {
        for step in &test.procedure.steps {
            match step {
                Step::SkipIf(guard) => {
                    if let Some(message) = self.guard_holds(guard, state) {
                        return Err(StepSignal::Skip(message));
                    }
                }
                Step::OmitIf(guard) => {
                    if let Some(message) = self.guard_holds(guard, state) {
                        return Err(StepSignal::Omit(message));
                    }
                }
                Step::Search(search) => search::run(self, search, state, ctx).await?,
                Step::Read(read) => checks::read(self, read, state, ctx).await?,
                Step::Validate(validation) => checks::validate(self, validation, state, ctx)?,
                Step::Capture(capture) => checks::capture(capture, state, ctx),
                Step::Assert(assertion) => checks::assert(assertion, state, ctx)?,
                Step::Todo(message) => return Err(StepSignal::Todo(message.clone())),
            }
        }
        Ok(())
    }

    /// Message describing why the guard holds, if it does
    fn guard_holds(&self, guard: &Guard, state: &SequenceState) -> Option<String> {
        let resource_type = self.resource_type();
        match guard {
            Guard::Always { message } => Some(message.clone()),
            Guard::NoResourcesFound => (!state.resources_found).then(|| {
                format!(
                    "No {resource_type} resources appear to be available. \
                     Please use patients with more information."
                )
            }),
            Guard::NoDiscoveredReferences => self.incoming.is_empty().then(|| {
                format!("No {resource_type} references found from the prior searches")
            }),
            Guard::NoExternalReferences { path } => {
                let external = state.resources.iter().any(|resource| {
                    checks::references_at(resource, path)
                        .iter()
                        .any(|reference| !reference.starts_with('#'))
                });
                (!external).then(|| {
                    format!("No {resource_type} resources reference an external resource at {path}")
                })
            }
            Guard::NoIncludedResources { resource_type } => state
                .included(resource_type)
                .is_empty()
                .then(|| format!("No {resource_type} resources were included in search results")),
        }
    }
}

/// Runs every profile of a metadata set
pub struct SuiteRunner<'a> {
    metadata: &'a MetadataSet,
    client: &'a dyn FhirClient,
    options: RunOptions,
    terminology: Option<Arc<dyn TerminologyValidator>>,
}

impl<'a> SuiteRunner<'a> {
    pub fn new(metadata: &'a MetadataSet, client: &'a dyn FhirClient, options: RunOptions) -> Self {
        Self {
            metadata,
            client,
            options,
            terminology: None,
        }
    }

    pub fn with_terminology(mut self, validator: Arc<dyn TerminologyValidator>) -> Self {
        self.terminology = Some(validator);
        self
    }

    async fn fetch_capabilities(&self) -> Option<Value> {
        match self.client.capabilities().await {
            Ok(response) if response.is_success() => Some(response.body),
            Ok(response) => {
                warn!("CapabilityStatement request returned status {}", response.status);
                None
            }
            Err(error) => {
                warn!("Could not fetch CapabilityStatement: {}", error);
                None
            }
        }
    }

    fn sequence<'s>(
        &'s self,
        profile: &'s ProfileMetadata,
        plan: &'s [TestSpecification],
        capabilities: &Option<Value>,
    ) -> SequenceRunner<'s> {
        let runner = SequenceRunner::new(profile, plan, self.client, &self.options)
            .with_capabilities(capabilities.clone());
        match &self.terminology {
            Some(validator) => runner.with_terminology(validator.clone()),
            None => runner,
        }
    }

    pub async fn run(&self) -> SuiteReport {
        let capabilities = self.fetch_capabilities().await;

        let mut compile_failures = Vec::new();
        let mut immediate = Vec::new();
        let mut delayed = Vec::new();
        for (profile, (name, compiled)) in self
            .metadata
            .profiles()
            .iter()
            .zip(compile_all(self.metadata))
        {
            match compiled {
                Ok(plan) if is_delayed(profile, self.metadata) => delayed.push((profile, plan)),
                Ok(plan) => immediate.push((profile, plan)),
                Err(error) => {
                    warn!("Skipping {}: {}", name, error);
                    compile_failures.push(CompileFailure {
                        profile: name,
                        message: error.to_string(),
                    });
                }
            }
        }

        let mut sequences = join_all(
            immediate
                .iter()
                .map(|(profile, plan)| {
                    let runner = self.sequence(profile, plan, &capabilities);
                    async move { runner.run().await }
                }),
        )
        .await;

        let mut discovered = DiscoveredReferences::new();
        for report in &sequences {
            state::merge_references(&mut discovered, &report.discovered);
        }

        // Delayed profiles can reference each other, so they run in order
        for (profile, plan) in &delayed {
            let incoming = discovered
                .get(&profile.resource_type)
                .cloned()
                .unwrap_or_default();
            let report = self
                .sequence(profile, plan, &capabilities)
                .with_incoming(incoming)
                .run()
                .await;
            state::merge_references(&mut discovered, &report.discovered);
            sequences.push(report);
        }

        let order = |report: &SequenceReport| {
            self.metadata
                .profiles()
                .iter()
                .position(|p| p.canonical_name == report.profile)
                .unwrap_or(usize::MAX)
        };
        sequences.sort_by_key(order);

        SuiteReport {
            sequences,
            compile_failures,
        }
    }
}

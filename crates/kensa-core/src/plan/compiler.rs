//! Test plan compiler
//!
//! Turns one profile's metadata into its ordered list of tests:
//!
//! 1. delayed profiles: one read test over references discovered elsewhere
//! 2. otherwise one search test per SHALL search, then per SHOULD search
//! 3. chained searches (PractitionerRole only)
//! 4. interactions
//! 5. `_include` and 6. `_revinclude`
//! 7. binding conformance (plus Medications for MedicationRequest)
//! 8. must-support
//! 9. multiple-or searches (not delayed)
//! 10. reference resolution
//!
//! Compilation is pure: the same metadata always yields the same plan.

use super::{
    Assertion, Capture, Guard, Procedure, ReadStep, SearchStep, Step, TestSpecification,
    Validation,
};
use crate::classifier::{delayed_references, is_delayed};
use crate::error::KensaError;
use crate::metadata::{
    Expectation, InteractionCode, MetadataSet, ProfileMetadata, SearchParameterDescriptor,
    relative_path,
};
use crate::resolver::select_strategy;
use crate::result::Result;
use crate::retry::StatusRetry;
use tracing::debug;

/// Upper bound on references read by the reference-resolution test
pub const DEFAULT_MAX_REFERENCES: usize = 50;

const SEARCH_LINK: &str = "https://www.hl7.org/fhir/R4/search.html";

/// A test before it is numbered
struct Draft {
    suffix: String,
    title: String,
    description: String,
    optional: bool,
    link: Option<String>,
    steps: Vec<Step>,
}

impl Draft {
    fn new(suffix: impl Into<String>, title: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            suffix: suffix.into(),
            title: title.into(),
            description: String::new(),
            optional: false,
            link: None,
            steps,
        }
    }

    fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    fn link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }
}

struct PlanBuilder<'a> {
    profile: &'a ProfileMetadata,
    tests: Vec<TestSpecification>,
}

impl<'a> PlanBuilder<'a> {
    fn new(profile: &'a ProfileMetadata) -> Self {
        Self {
            profile,
            tests: Vec::new(),
        }
    }

    fn push(&mut self, draft: Draft) {
        let key = format!("{}_{}_test", self.profile.canonical_name, draft.suffix);
        debug!("{}: emitting {}", self.profile.canonical_name, key);
        self.tests.push(TestSpecification {
            key,
            index: self.tests.len() + 1,
            title: draft.title,
            description: draft.description,
            optional: draft.optional,
            link: draft.link.or_else(|| Some(self.profile.profile_url.clone())),
            procedure: Procedure::new(draft.steps),
        });
    }

    fn finish(self) -> Vec<TestSpecification> {
        self.tests
    }
}

/// Compile the ordered test plan of `profile`
///
/// Fails only for metadata that cannot be turned into a plan; such an error
/// concerns this profile alone.
pub fn compile(profile: &ProfileMetadata, all: &MetadataSet) -> Result<Vec<TestSpecification>> {
    let delayed = is_delayed(profile, all);
    let mut plan = PlanBuilder::new(profile);

    if delayed {
        plan.push(read_dependent_test(profile, all));
    } else {
        for expectation in [Expectation::Shall, Expectation::Should] {
            for search in profile.searches.iter().filter(|s| s.expectation == expectation) {
                if !is_resolvable(profile, search) {
                    debug!(
                        "{}: no definition for search by {}, not tested",
                        profile.canonical_name,
                        search.joined_names("+")
                    );
                    continue;
                }
                let is_first = profile.is_first_search(search);
                plan.push(search_test(profile, all, search, is_first));
            }
        }
    }

    for test in chained_search_tests(profile)? {
        plan.push(test);
    }

    for test in interaction_tests(profile, delayed) {
        plan.push(test);
    }

    // Delayed profiles repeat their reads as an `_id` search
    let searchable = delayed || profile.first_search().is_some();
    if !profile.include_params.is_empty() && searchable {
        plan.push(include_test(profile, all));
    }
    if !profile.revinclude_params.is_empty() && searchable {
        plan.push(revinclude_test(profile));
    }

    plan.push(conformance_test(profile));
    if profile.resource_type == "MedicationRequest" {
        plan.push(medication_conformance_test(profile, all));
    }

    plan.push(must_support_test(profile));

    if !delayed {
        for test in multiple_or_tests(profile) {
            plan.push(test);
        }
    }

    plan.push(references_test(profile));

    Ok(plan.finish())
}

/// Compile every profile; one profile's error does not stop the others
pub fn compile_all(all: &MetadataSet) -> Vec<(String, Result<Vec<TestSpecification>>)> {
    all.profiles()
        .iter()
        .map(|profile| (profile.canonical_name.clone(), compile(profile, all)))
        .collect()
}

fn is_resolvable(profile: &ProfileMetadata, search: &SearchParameterDescriptor) -> bool {
    !search.names.is_empty()
        && search.names.iter().all(|name| {
            profile.search_definition(name).is_some()
                || name == "patient"
                || (name == "_id" && profile.resource_type == "Patient")
        })
}

/// Lowercase, `_`-separated form of a name for use in keys
fn key_fragment(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

fn read_dependent_test(profile: &ProfileMetadata, all: &MetadataSet) -> Draft {
    let resource_type = &profile.resource_type;
    let steps = if profile.supports(InteractionCode::Read) {
        let mut steps = vec![
            Step::SkipIf(Guard::NoDiscoveredReferences),
            Step::Read(ReadStep::DiscoveredReferences),
            Step::Capture(Capture::Resources),
        ];
        let references = delayed_references(profile, all);
        if !references.is_empty() {
            steps.push(Step::Capture(Capture::DelayedReferences { references }));
        }
        steps
    } else {
        vec![Step::SkipIf(Guard::Always {
            message: format!("This server does not support {resource_type} read operation(s)"),
        })]
    };

    Draft::new(
        "read",
        format!(
            "Server returns correct {resource_type} resource from {resource_type} read interaction"
        ),
        steps,
    )
    .description(format!(
        "Reads every {resource_type} referenced by resources found while testing other profiles. \
         The test is skipped when no such references were found."
    ))
}

fn search_test(
    profile: &ProfileMetadata,
    all: &MetadataSet,
    search: &SearchParameterDescriptor,
    is_first: bool,
) -> Draft {
    let names = search.names.clone();
    let strategy = select_strategy(profile, search, is_first, false);
    let status_retry = StatusRetry::for_search(profile, &names).is_some();

    let mut steps = Vec::new();
    if !is_first {
        steps.push(Step::SkipIf(Guard::NoResourcesFound));
    }
    steps.push(Step::Search(SearchStep::Primary {
        names: names.clone(),
        strategy,
        status_retry,
        first: is_first,
    }));
    if is_first {
        steps.push(Step::Capture(Capture::Resources));
        let references = delayed_references(profile, all);
        if !references.is_empty() {
            steps.push(Step::Capture(Capture::DelayedReferences { references }));
        }
    }
    steps.push(Step::Validate(Validation::SearchResults));
    if is_first {
        steps.push(Step::Search(SearchStep::PostEquivalence));
        if search.includes("patient") {
            steps.push(Step::Search(SearchStep::ReferenceVariant {
                param: "patient".to_string(),
            }));
        }
    }

    for name in &names {
        let Some(definition) = profile.search_definition(name) else {
            continue;
        };
        if definition.value_type.is_token() {
            steps.push(Step::Search(SearchStep::SystemQualified { param: name.clone() }));
        }
        if definition.value_type.is_date() {
            for comparator in definition.tested_comparators() {
                steps.push(Step::Search(SearchStep::Comparator {
                    param: name.clone(),
                    comparator,
                }));
            }
        }
    }

    let joined = search.joined_names("+");
    let mut description = format!(
        "A server {} support searching by {} on the {} resource.",
        search.expectation.as_str(),
        joined,
        profile.resource_type
    );
    if is_first {
        description.push_str(
            " This test seeds every later test of the profile: resources it finds are captured, \
             and when none are found later tests are skipped.",
        );
    }

    let suffix = format!(
        "search_by_{}",
        names.iter().map(|n| key_fragment(n)).collect::<Vec<_>>().join("_")
    );
    Draft::new(
        suffix,
        format!(
            "Server returns valid results for {} search by {}",
            profile.resource_type, joined
        ),
        steps,
    )
    .description(description)
    .optional(search.expectation != Expectation::Shall)
    .link(SEARCH_LINK)
}

fn chained_search_tests(profile: &ProfileMetadata) -> Result<Vec<Draft>> {
    let mut tests = Vec::new();
    for name in profile.searched_param_names() {
        let Some(definition) = profile.search_definition(name) else {
            continue;
        };
        for chain in &definition.chain {
            if profile.resource_type != "PractitionerRole" {
                return Err(KensaError::construction(
                    &profile.canonical_name,
                    format!(
                        "chained search by {}.{} is only supported for PractitionerRole, not {}",
                        name, chain.chain, profile.resource_type
                    ),
                ));
            }
            let steps = vec![
                Step::SkipIf(Guard::NoResourcesFound),
                Step::Search(SearchStep::Chained {
                    param: name.to_string(),
                    chain: chain.chain.clone(),
                    target: chain.target.clone(),
                    target_path: chain.path.clone(),
                    value_type: chain.value_type.clone(),
                }),
            ];
            tests.push(
                Draft::new(
                    format!(
                        "chained_search_by_{}_{}",
                        key_fragment(name),
                        key_fragment(&chain.chain)
                    ),
                    format!(
                        "Server returns valid results for {} chained search by {}.{}",
                        profile.resource_type, name, chain.chain
                    ),
                    steps,
                )
                .description(format!(
                    "Searches {} by a {} property of the referenced {}.",
                    profile.resource_type, chain.chain, chain.target
                ))
                .optional(chain.expectation != Expectation::Shall)
                .link(SEARCH_LINK),
            );
        }
    }
    Ok(tests)
}

fn interaction_tests(profile: &ProfileMetadata, delayed: bool) -> Vec<Draft> {
    let resource_type = &profile.resource_type;
    profile
        .interactions
        .iter()
        .filter(|i| i.expectation.is_tested())
        .filter(|i| match i.code {
            InteractionCode::SearchType | InteractionCode::Create => false,
            InteractionCode::Read => !delayed,
            _ => true,
        })
        .map(|interaction| {
            let name = interaction.code.display_name();
            let steps = match interaction.code {
                InteractionCode::Update | InteractionCode::Patch | InteractionCode::Delete => {
                    vec![Step::Todo(format!(
                        "The {name} interaction is not exercised; server data is never modified"
                    ))]
                }
                code => vec![
                    Step::SkipIf(Guard::NoResourcesFound),
                    Step::Read(ReadStep::Interaction { code }),
                ],
            };
            Draft::new(
                key_fragment(name),
                format!(
                    "Server returns correct {resource_type} resource from {resource_type} {name} \
                     interaction"
                ),
                steps,
            )
            .description(format!(
                "A server {} support the {resource_type} {name} interaction.",
                interaction.expectation.as_str()
            ))
            .optional(interaction.expectation != Expectation::Shall)
        })
        .collect()
}

/// Target resource type and element path of an `_include` parameter
fn include_target(profile: &ProfileMetadata, all: &MetadataSet, include: &str) -> (String, String) {
    let param = include.rsplit(':').next().unwrap_or(include);
    let reference = profile.references.iter().find(|reference| {
        let last = relative_path(&reference.path)
            .rsplit('.')
            .next()
            .unwrap_or_default();
        last.strip_suffix("[x]").unwrap_or(last) == param
    });

    let target = reference
        .and_then(|r| r.profiles.iter().find_map(|url| all.by_url(url)))
        .map(|p| p.resource_type.clone())
        .unwrap_or_else(|| capitalize(param));
    let path = reference
        .map(|r| relative_path(&r.path).to_string())
        .unwrap_or_else(|| param.to_string());
    (target, path)
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn include_test(profile: &ProfileMetadata, all: &MetadataSet) -> Draft {
    let mut steps = vec![Step::SkipIf(Guard::NoResourcesFound)];
    let mut targets = Vec::new();
    for include in &profile.include_params {
        let (target, path) = include_target(profile, all, include);
        let include = if include.contains(':') {
            include.clone()
        } else {
            format!("{}:{}", profile.resource_type, include)
        };
        steps.push(Step::OmitIf(Guard::NoExternalReferences { path }));
        steps.push(Step::Search(SearchStep::Include {
            include,
            target: target.clone(),
        }));
        steps.push(Step::Assert(Assertion::IncludedFound {
            target: target.clone(),
        }));
        targets.push(target);
    }

    Draft::new(
        "include",
        format!(
            "Server returns the appropriate resource(s) when {} is searched with _include={}",
            profile.resource_type,
            profile.include_params.join(",")
        ),
        steps,
    )
    .description(format!(
        "Repeats the first search (an _id search for read resources) with _include and \
         checks that {} resources are included at least once. Omitted when no {} references \
         an external resource.",
        targets.join(", "),
        profile.resource_type
    ))
    .link(SEARCH_LINK)
}

fn revinclude_test(profile: &ProfileMetadata) -> Draft {
    let mut steps = vec![Step::SkipIf(Guard::NoResourcesFound)];
    let mut sources = Vec::new();
    for revinclude in &profile.revinclude_params {
        let source = revinclude
            .split(':')
            .next()
            .unwrap_or(revinclude)
            .to_string();
        steps.push(Step::Search(SearchStep::Revinclude {
            revinclude: revinclude.clone(),
            source: source.clone(),
        }));
        steps.push(Step::Capture(Capture::Revincluded {
            resource_type: source.clone(),
        }));
        steps.push(Step::Assert(Assertion::RevincludedFound {
            source: source.clone(),
        }));
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    let suffix = format!(
        "{}_revinclude",
        sources.iter().map(|s| key_fragment(s)).collect::<Vec<_>>().join("_")
    );
    Draft::new(
        suffix,
        format!(
            "Server returns {} resources from {} search with _revinclude={}",
            sources.join(", "),
            profile.resource_type,
            profile.revinclude_params.join(",")
        ),
        steps,
    )
    .description(format!(
        "Repeats the first search (an _id search for read resources) with _revinclude and \
         checks that at least one {} is returned.",
        sources.join(" or ")
    ))
    .link(SEARCH_LINK)
}

fn conformance_test(profile: &ProfileMetadata) -> Draft {
    let resource_type = &profile.resource_type;
    Draft::new(
        "validation",
        format!(
            "{resource_type} resources returned during previous tests conform to the {}",
            profile.display_title()
        ),
        vec![
            Step::SkipIf(Guard::NoResourcesFound),
            Step::Validate(Validation::Bindings {
                bindings: profile.bindings.clone(),
                required_concepts: profile.required_concepts.clone(),
            }),
        ],
    )
    .description(format!(
        "Checks the required and extensible terminology bindings of every {resource_type} found."
    ))
}

fn medication_conformance_test(profile: &ProfileMetadata, all: &MetadataSet) -> Draft {
    let (medication, bindings) = match all.by_resource_type("Medication") {
        Some(medication) => (medication.display_title().to_string(), medication.bindings.clone()),
        None => ("Medication".to_string(), Vec::new()),
    };
    Draft::new(
        "medication_validation",
        format!(
            "Medication resources returned in response to _include requests conform to the \
             {medication}"
        ),
        vec![
            Step::SkipIf(Guard::NoResourcesFound),
            Step::OmitIf(Guard::NoIncludedResources {
                resource_type: "Medication".to_string(),
            }),
            Step::Validate(Validation::MedicationBindings { bindings }),
        ],
    )
    .description(format!(
        "Checks Medications referenced by {} resources, both included and contained. Omitted when \
         every Medication is contained.",
        profile.resource_type
    ))
}

fn must_support_test(profile: &ProfileMetadata) -> Draft {
    let resource_type = &profile.resource_type;
    Draft::new(
        "must_support",
        format!("All must support elements are provided in the {resource_type} resources returned"),
        vec![
            Step::SkipIf(Guard::NoResourcesFound),
            Step::Validate(Validation::MustSupport {
                elements: profile.must_support.clone(),
            }),
        ],
    )
    .description(format!(
        "Looks through the {resource_type} resources found previously for every must support \
         element, extension and slice. Missing items are reported together."
    ))
}

fn multiple_or_tests(profile: &ProfileMetadata) -> Vec<Draft> {
    profile
        .searched_param_names()
        .into_iter()
        .filter(|name| {
            profile
                .search_definition(name)
                .is_some_and(|d| d.requires_multiple_or())
        })
        .filter_map(|param| {
            let search = profile.searches.iter().find(|s| s.includes(param))?;
            Some(
                Draft::new(
                    format!("multiple_or_search_by_{}", key_fragment(param)),
                    format!(
                        "Server returns the expected results for the {} multipleOr search by {}",
                        profile.resource_type, param
                    ),
                    vec![
                        Step::SkipIf(Guard::NoResourcesFound),
                        Step::Search(SearchStep::MultipleOr {
                            names: search.names.clone(),
                            param: param.to_string(),
                        }),
                    ],
                )
                .description(format!(
                    "Searches {param} with two comma-separated values and checks that resources \
                     matching each value are returned."
                ))
                .link(SEARCH_LINK),
            )
        })
        .collect()
}

fn references_test(profile: &ProfileMetadata) -> Draft {
    Draft::new(
        "reference_resolution",
        "Every reference within the resources can be read",
        vec![
            Step::SkipIf(Guard::NoResourcesFound),
            Step::Read(ReadStep::References {
                limit: DEFAULT_MAX_REFERENCES,
            }),
        ],
    )
    .description(format!(
        "Reads up to {DEFAULT_MAX_REFERENCES} distinct references found in the {} resources \
         captured earlier.",
        profile.resource_type
    ))
}

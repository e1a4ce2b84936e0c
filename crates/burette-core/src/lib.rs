//! Leaf types and contracts for the burette experiment controller:
//! parameter sets and their merge semantics, experiment definitions,
//! the component registry, and the collaborator interfaces techniques
//! and analysts are written against.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Parameter store

/// An immutable string-keyed mapping of configuration values.
///
/// Parameter sets never alias mutable state: merging two sets produces a
/// third, and the inputs are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, Value>);

impl ParameterSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Value)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, Value>> for ParameterSet {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

/// How key collisions between a global and a local parameter set resolve
/// when the colliding values are both mappings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeStrategy {
    /// The local value replaces the global one wholesale, even when both
    /// are mappings. This is the documented default contract.
    #[default]
    Replace,
    /// Mapping values are merged recursively, local winning at every level.
    Deep,
}

/// Merge a local parameter set over a global one.
///
/// Left-biased: for every key present in both, the local value wins
/// regardless of value type or equality. Keys present in only one set pass
/// through unchanged. The merge is total and pure.
///
/// This is NOT a deep merge: a key whose value is itself a mapping is
/// replaced wholesale by the local version. Use [`merge_with`] and
/// [`MergeStrategy::Deep`] where a technique or analyst requires deep
/// merging.
pub fn merge(global: &ParameterSet, local: &ParameterSet) -> ParameterSet {
    merge_with(global, local, MergeStrategy::Replace)
}

/// Merge with an explicit collision strategy for nested mapping values.
pub fn merge_with(
    global: &ParameterSet,
    local: &ParameterSet,
    strategy: MergeStrategy,
) -> ParameterSet {
    let mut merged = global.0.clone();
    for (key, value) in local.0.iter() {
        let nested = strategy == MergeStrategy::Deep
            && value.is_object()
            && merged.get(key).map_or(false, Value::is_object);
        if nested {
            if let Some(existing) = merged.get_mut(key) {
                deep_merge_value(existing, value);
            }
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    ParameterSet(merged)
}

fn deep_merge_value(base: &mut Value, overlay: &Value) {
    if let (Value::Object(base_map), Value::Object(overlay_map)) = (&mut *base, overlay) {
        for (key, value) in overlay_map {
            let nested = value.is_object() && base_map.get(key).map_or(false, Value::is_object);
            if nested {
                if let Some(existing) = base_map.get_mut(key) {
                    deep_merge_value(existing, value);
                }
            } else {
                base_map.insert(key.clone(), value.clone());
            }
        }
        return;
    }
    *base = overlay.clone();
}

// ---------------------------------------------------------------------------
// Component names

/// A hierarchical dotted identifier referencing a registered technique or
/// analyst implementation, e.g. `technique.acquisition`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct QualifiedName(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid component name {0:?}: names are non-empty dotted identifiers")]
pub struct InvalidName(pub String);

impl QualifiedName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidName> {
        let name = name.into();
        if name.is_empty() || name.split('.').any(|segment| segment.is_empty()) {
            return Err(InvalidName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Experiment definition

/// One technique or analyst as declared in a definition document, before
/// its local parameters are merged with the experiment's globals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentSpec {
    pub name: QualifiedName,
    pub parameters: ParameterSet,
}

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("unreadable experiment definition: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("malformed experiment definition: {}", .violations.join("; "))]
    Malformed { violations: Vec<String> },
}

/// The validated, immutable representation of an experiment definition
/// document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentDefinition {
    name: String,
    repetitions: u32,
    technique: ComponentSpec,
    analysts: Vec<ComponentSpec>,
    parameters: ParameterSet,
}

impl ExperimentDefinition {
    /// Build a definition programmatically, enforcing the same invariants
    /// as document validation: repetitions >= 1 and a non-empty analyst
    /// sequence.
    pub fn new(
        name: impl Into<String>,
        repetitions: u32,
        technique: ComponentSpec,
        analysts: Vec<ComponentSpec>,
        parameters: ParameterSet,
    ) -> Result<Self, DefinitionError> {
        let mut violations = Vec::new();
        if repetitions == 0 {
            violations.push("/repetitions: must be a positive integer".to_string());
        }
        if analysts.is_empty() {
            violations.push("/analysts: must be a non-empty sequence".to_string());
        }
        if !violations.is_empty() {
            return Err(DefinitionError::Malformed { violations });
        }
        Ok(Self {
            name: name.into(),
            repetitions,
            technique,
            analysts,
            parameters,
        })
    }

    /// Parse and validate a YAML definition document.
    ///
    /// Validation is side-effect-free, never contacts the registry, and
    /// reports every violated constraint at once rather than the first.
    pub fn from_yaml_str(document: &str) -> Result<Self, DefinitionError> {
        let raw: serde_yaml::Value = serde_yaml::from_str(document)?;
        Self::from_yaml_value(&raw)
    }

    pub fn from_yaml_value(raw: &serde_yaml::Value) -> Result<Self, DefinitionError> {
        let mut violations = Vec::new();
        if raw.as_mapping().is_none() {
            return Err(DefinitionError::Malformed {
                violations: vec!["document must be a mapping".to_string()],
            });
        }

        let name = match raw.get("name").and_then(serde_yaml::Value::as_str) {
            Some(name) if !name.is_empty() => Some(name.to_string()),
            _ => {
                violations.push("/name: required non-empty string".to_string());
                None
            }
        };

        let repetitions = match raw.get("repetitions") {
            Some(value) => match value.as_u64() {
                Some(n) if n >= 1 && n <= u64::from(u32::MAX) => Some(n as u32),
                _ => {
                    violations.push("/repetitions: must be a positive integer".to_string());
                    None
                }
            },
            None => {
                violations.push("/repetitions: required".to_string());
                None
            }
        };

        let technique = match raw.get("technique") {
            Some(node) => component_at(node, "/technique", &mut violations),
            None => {
                violations.push("/technique: required".to_string());
                None
            }
        };

        let analysts = match raw.get("analysts").and_then(serde_yaml::Value::as_sequence) {
            Some(sequence) if !sequence.is_empty() => sequence
                .iter()
                .enumerate()
                .filter_map(|(index, node)| {
                    component_at(node, &format!("/analysts/{index}"), &mut violations)
                })
                .collect(),
            _ => {
                violations.push("/analysts: must be a non-empty sequence".to_string());
                Vec::new()
            }
        };

        let parameters = parameter_set_at(raw.get("parameters"), "/parameters", &mut violations);

        if !violations.is_empty() {
            return Err(DefinitionError::Malformed { violations });
        }
        match (name, repetitions, technique) {
            (Some(name), Some(repetitions), Some(technique)) => Ok(Self {
                name,
                repetitions,
                technique,
                analysts,
                parameters,
            }),
            // Unreachable: every None above pushed a violation.
            _ => Err(DefinitionError::Malformed { violations }),
        }
    }

    /// The name of the experiment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times the revert/technique/analysts cycle repeats.
    pub fn repetitions(&self) -> u32 {
        self.repetitions
    }

    pub fn technique(&self) -> &ComponentSpec {
        &self.technique
    }

    /// The analysts in declared order. Never empty.
    pub fn analysts(&self) -> &[ComponentSpec] {
        &self.analysts
    }

    /// The global parameter set merged under every component's locals.
    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }
}

fn component_at(
    node: &serde_yaml::Value,
    path: &str,
    violations: &mut Vec<String>,
) -> Option<ComponentSpec> {
    if node.as_mapping().is_none() {
        violations.push(format!("{path}: must be a mapping"));
        return None;
    }
    let name = match node.get("name").and_then(serde_yaml::Value::as_str) {
        Some(raw) => match QualifiedName::new(raw) {
            Ok(name) => Some(name),
            Err(err) => {
                violations.push(format!("{path}/name: {err}"));
                None
            }
        },
        None => {
            violations.push(format!("{path}/name: required string"));
            None
        }
    };
    let parameters = parameter_set_at(
        node.get("parameters"),
        &format!("{path}/parameters"),
        violations,
    );
    Some(ComponentSpec {
        name: name?,
        parameters,
    })
}

fn parameter_set_at(
    node: Option<&serde_yaml::Value>,
    path: &str,
    violations: &mut Vec<String>,
) -> ParameterSet {
    let Some(node) = node else {
        return ParameterSet::new();
    };
    let Some(mapping) = node.as_mapping() else {
        violations.push(format!("{path}: must be a mapping"));
        return ParameterSet::new();
    };
    let mut values = BTreeMap::new();
    for (key, value) in mapping {
        let Some(key) = key.as_str() else {
            violations.push(format!("{path}: key {key:?} is not a string"));
            continue;
        };
        match serde_json::to_value(value) {
            Ok(value) => {
                values.insert(key.to_string(), value);
            }
            Err(err) => violations.push(format!("{path}/{key}: unrepresentable value ({err})")),
        }
    }
    ParameterSet(values)
}

// ---------------------------------------------------------------------------
// Capability interfaces

/// The evidence produced by one technique invocation: a string-keyed map of
/// output slots. Slot values commonly hold host paths of acquired images
/// and timing metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Artifact {
    slots: BTreeMap<String, Value>,
}

impl Artifact {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slot(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.slots.insert(name.into(), value);
    }

    pub fn slot(&self, name: &str) -> Option<&Value> {
        self.slots.get(name)
    }

    pub fn slots(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.slots.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// The measurement record produced by one analyst invocation.
pub type AnalysisOutcome = Value;

/// A recorded technique or analyst failure. Timeouts are ordinary failure
/// outcomes for the repetition they occur in, never process-fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionFailure {
    #[error("{0}")]
    Failed(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

impl From<GuestError> for ExecutionFailure {
    fn from(err: GuestError) -> Self {
        ExecutionFailure::Failed(err.to_string())
    }
}

/// An evidence-acquisition action against the live guest.
pub trait Technique: std::fmt::Debug {
    fn execute(
        &self,
        vm: &mut dyn VmGuest,
        timeout: Duration,
    ) -> Result<Artifact, ExecutionFailure>;
}

/// An evaluation procedure over the artifact a technique produced.
pub trait Analyst {
    fn execute(
        &self,
        artifact: &Artifact,
        timeout: Duration,
    ) -> Result<AnalysisOutcome, ExecutionFailure>;
}

// ---------------------------------------------------------------------------
// Implementation registry

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown implementation: {name}")]
    UnknownImplementation { name: QualifiedName },
    #[error("invalid parameters for {name}: {reason}")]
    InvalidParameters { name: QualifiedName, reason: String },
}

type Factory<T> = Box<dyn Fn(&ParameterSet) -> Result<Box<T>, String> + Send + Sync>;

/// Maps hierarchical names to implementation factories.
///
/// Populated by an explicit registration step at process start; the
/// controller has no compile-time knowledge of concrete techniques or
/// analysts. A factory receives the effective (merged) parameter set and
/// rejects it with a reason string when a required key is absent or a value
/// fails implementation-specific validation; this is the only point where
/// per-component parameter semantics are checked.
pub struct Registry<T: ?Sized> {
    components: BTreeMap<String, Factory<T>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self {
            components: BTreeMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ParameterSet) -> Result<Box<T>, String> + Send + Sync + 'static,
    {
        self.components.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &QualifiedName) -> bool {
        self.components.contains_key(name.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    /// Resolve a name and construct an instance with the given effective
    /// parameter set.
    pub fn construct(
        &self,
        name: &QualifiedName,
        parameters: &ParameterSet,
    ) -> Result<Box<T>, ResolveError> {
        let factory = self
            .components
            .get(name.as_str())
            .ok_or_else(|| ResolveError::UnknownImplementation { name: name.clone() })?;
        factory(parameters).map_err(|reason| ResolveError::InvalidParameters {
            name: name.clone(),
            reason,
        })
    }
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("names", &self.components.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The technique and analyst registries an experiment resolves against.
#[derive(Debug, Default)]
pub struct Catalog {
    pub techniques: Registry<dyn Technique>,
    pub analysts: Registry<dyn Analyst>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Virtual machine collaborators

/// The baseline snapshot an experiment reverts to before every repetition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SnapshotId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Infrastructure-level revert failure. Always fatal to the experiment:
/// a corrupted baseline invalidates the comparability of every subsequent
/// repetition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RevertError {
    #[error("hypervisor rejected snapshot revert: {0}")]
    Hypervisor(String),
    #[error("snapshot revert timed out after {0:?}")]
    TimedOut(Duration),
    #[error("virtual machine unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("guest operation failed: {0}")]
pub struct GuestError(pub String);

/// The hypervisor surface the controller owns exclusively for the lifetime
/// of one run.
pub trait VmController {
    /// Revert to the baseline snapshot and block until the guest is ready.
    fn revert_to_snapshot(
        &mut self,
        snapshot: &SnapshotId,
        timeout: Duration,
    ) -> Result<(), RevertError>;

    /// The live guest handle techniques interact with.
    fn guest(&mut self) -> &mut dyn VmGuest;
}

/// The live guest surface available to technique implementations.
pub trait VmGuest {
    fn resume(&mut self) -> Result<(), GuestError>;
    fn suspend(&mut self) -> Result<(), GuestError>;
    fn save_memory(&mut self, destination: &Path) -> Result<(), GuestError>;
}

// ---------------------------------------------------------------------------
// Digests

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Digest of a value's canonical JSON encoding (keys sorted, no
/// insignificant whitespace).
pub fn canonical_json_digest<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(sha256_bytes(&serde_json::to_vec(value)?))
}

use burette_core::{
    canonical_json_digest, merge_with, AnalysisOutcome, Analyst, Artifact, Catalog, ComponentSpec,
    ExecutionFailure, ExperimentDefinition, MergeStrategy, ParameterSet, QualifiedName, Registry,
    ResolveError, RevertError, SnapshotId, Technique, VmController,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Per-operation deadlines handed to the external collaborators. A technique
/// or analyst timeout is a failure outcome for that repetition only; a revert
/// timeout aborts the experiment.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub revert: Duration,
    pub technique: Duration,
    pub analyst: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            revert: Duration::from_secs(120),
            technique: Duration::from_secs(900),
            analyst: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub merge: MergeStrategy,
    pub timeouts: Timeouts,
    /// When set, the controller persists the run under
    /// `<record_root>/runs/run_<timestamp>/`.
    pub record_root: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("run recording failed: {0}")]
    Record(#[from] io::Error),
    #[error("run record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A constructed technique or analyst with its effective parameter set.
/// Created once per component per experiment and reused read-only across
/// repetitions.
pub struct ResolvedComponent<T: ?Sized> {
    pub name: QualifiedName,
    pub parameters: ParameterSet,
    pub instance: Box<T>,
}

pub type ResolvedTechnique = ResolvedComponent<dyn Technique>;
pub type ResolvedAnalyst = ResolvedComponent<dyn Analyst>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    Idle,
    Reverting,
    RunningTechnique,
    RunningAnalysts,
    Recording,
    Done,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalystOutcome {
    pub name: QualifiedName,
    pub outcome: Result<AnalysisOutcome, ExecutionFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialResult {
    pub repetition: usize,
    pub technique: Result<Artifact, ExecutionFailure>,
    /// Empty when the technique failed: analysts have nothing to evaluate
    /// without an artifact.
    pub analysts: Vec<AnalystOutcome>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Completed,
    Aborted {
        repetition: usize,
        reason: RevertError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentResult {
    pub definition: ExperimentDefinition,
    /// One entry per repetition in execution order. Shorter than the
    /// declared repetition count only when the run aborted.
    pub trials: Vec<TrialResult>,
    pub termination: Termination,
}

impl ExperimentResult {
    pub fn is_aborted(&self) -> bool {
        matches!(self.termination, Termination::Aborted { .. })
    }

    pub fn trial(&self, repetition: usize) -> Option<&TrialResult> {
        self.trials.iter().find(|t| t.repetition == repetition)
    }
}

/// Drives one repetition at a time through
/// `Idle → Reverting → RunningTechnique → RunningAnalysts → Recording`,
/// looping until every repetition has recorded (`Done`) or an
/// infrastructure failure ends the experiment (`Aborted`).
///
/// Repetitions are strictly sequential: no repetition begins before the
/// prior one has fully recorded, so no state can leak between repetitions
/// through the virtual machine.
pub struct TrialRunner<'a> {
    vm: &'a mut dyn VmController,
    snapshot: &'a SnapshotId,
    technique: &'a ResolvedTechnique,
    analysts: &'a [ResolvedAnalyst],
    timeouts: Timeouts,
    repetitions: u32,
    state: TrialState,
    repetition: usize,
    started: Option<Instant>,
    technique_outcome: Option<Result<Artifact, ExecutionFailure>>,
    analyst_outcomes: Vec<AnalystOutcome>,
    completed: Vec<TrialResult>,
    abort: Option<RevertError>,
}

impl<'a> TrialRunner<'a> {
    pub fn new(
        vm: &'a mut dyn VmController,
        snapshot: &'a SnapshotId,
        technique: &'a ResolvedTechnique,
        analysts: &'a [ResolvedAnalyst],
        repetitions: u32,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            vm,
            snapshot,
            technique,
            analysts,
            timeouts,
            repetitions,
            state: TrialState::Idle,
            repetition: 0,
            started: None,
            technique_outcome: None,
            analyst_outcomes: Vec::new(),
            completed: Vec::new(),
            abort: None,
        }
    }

    pub fn state(&self) -> TrialState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TrialState::Done | TrialState::Aborted)
    }

    /// Repetitions recorded so far, in execution order.
    pub fn completed(&self) -> &[TrialResult] {
        &self.completed
    }

    /// Advance the state machine by one transition.
    pub fn step(&mut self) {
        self.state = match self.state {
            TrialState::Idle => {
                if self.completed.len() < self.repetitions as usize {
                    self.repetition = self.completed.len();
                    self.started = Some(Instant::now());
                    TrialState::Reverting
                } else {
                    TrialState::Done
                }
            }
            TrialState::Reverting => {
                info!(
                    repetition = self.repetition,
                    snapshot = %self.snapshot,
                    "reverting virtual machine to baseline snapshot"
                );
                match self.vm.revert_to_snapshot(self.snapshot, self.timeouts.revert) {
                    Ok(()) => TrialState::RunningTechnique,
                    Err(err) => {
                        warn!(
                            repetition = self.repetition,
                            error = %err,
                            "snapshot revert failed, aborting experiment"
                        );
                        self.abort = Some(err);
                        TrialState::Aborted
                    }
                }
            }
            TrialState::RunningTechnique => {
                let technique = self.technique;
                info!(
                    repetition = self.repetition,
                    technique = %technique.name,
                    "invoking technique against live guest"
                );
                let outcome = technique
                    .instance
                    .execute(self.vm.guest(), self.timeouts.technique);
                let failed = outcome.is_err();
                if let Err(failure) = &outcome {
                    warn!(
                        repetition = self.repetition,
                        technique = %technique.name,
                        %failure,
                        "technique failed, skipping analysts for this repetition"
                    );
                }
                self.technique_outcome = Some(outcome);
                if failed {
                    TrialState::Recording
                } else {
                    TrialState::RunningAnalysts
                }
            }
            TrialState::RunningAnalysts => {
                if let Some(Ok(artifact)) = self.technique_outcome.clone() {
                    let analysts = self.analysts;
                    for analyst in analysts {
                        info!(
                            repetition = self.repetition,
                            analyst = %analyst.name,
                            "invoking analyst"
                        );
                        let outcome = analyst.instance.execute(&artifact, self.timeouts.analyst);
                        if let Err(failure) = &outcome {
                            warn!(
                                repetition = self.repetition,
                                analyst = %analyst.name,
                                %failure,
                                "analyst failed, continuing with remaining analysts"
                            );
                        }
                        self.analyst_outcomes.push(AnalystOutcome {
                            name: analyst.name.clone(),
                            outcome,
                        });
                    }
                }
                TrialState::Recording
            }
            TrialState::Recording => {
                let technique = self.technique_outcome.take().unwrap_or_else(|| {
                    Err(ExecutionFailure::Failed(
                        "technique was never invoked".to_string(),
                    ))
                });
                let analysts = std::mem::take(&mut self.analyst_outcomes);
                let elapsed = self.started.take().map(|s| s.elapsed()).unwrap_or_default();
                self.completed.push(TrialResult {
                    repetition: self.repetition,
                    technique,
                    analysts,
                    elapsed,
                });
                TrialState::Idle
            }
            TrialState::Done => TrialState::Done,
            TrialState::Aborted => TrialState::Aborted,
        };
    }

    /// Drive the machine to a terminal state.
    pub fn run(&mut self) {
        while !self.is_terminal() {
            self.step();
        }
    }

    /// The recorded trials and the terminal flag. Meaningful once the
    /// runner is terminal.
    pub fn into_outcome(self) -> (Vec<TrialResult>, Termination) {
        let termination = match self.abort {
            Some(reason) => Termination::Aborted {
                repetition: self.repetition,
                reason,
            },
            None => Termination::Completed,
        };
        (self.completed, termination)
    }
}

fn resolve_component<T: ?Sized>(
    registry: &Registry<T>,
    globals: &ParameterSet,
    spec: &ComponentSpec,
    strategy: MergeStrategy,
) -> Result<ResolvedComponent<T>, ResolveError> {
    let parameters = merge_with(globals, &spec.parameters, strategy);
    let instance = registry.construct(&spec.name, &parameters)?;
    Ok(ResolvedComponent {
        name: spec.name.clone(),
        parameters,
        instance,
    })
}

/// Resolve every component exactly once, then drive the Trial Runner for
/// the declared number of repetitions.
///
/// Failures before the first repetition (unknown names, rejected
/// parameters, an unwritable record root) abort the run with no partial
/// result. Failures during a repetition are recorded as data; only
/// infrastructure-level VM failures escalate, and those preserve the
/// trials completed before the abort.
pub fn run_experiment(
    definition: &ExperimentDefinition,
    catalog: &Catalog,
    vm: &mut dyn VmController,
    snapshot: &SnapshotId,
    options: &RunOptions,
) -> Result<ExperimentResult, RunError> {
    let technique = resolve_component(
        &catalog.techniques,
        definition.parameters(),
        definition.technique(),
        options.merge,
    )?;
    let analysts = definition
        .analysts()
        .iter()
        .map(|spec| resolve_component(&catalog.analysts, definition.parameters(), spec, options.merge))
        .collect::<Result<Vec<_>, _>>()?;
    info!(
        experiment = definition.name(),
        repetitions = definition.repetitions(),
        technique = %technique.name,
        analysts = analysts.len(),
        "resolved experiment components"
    );

    let mut recorder = match options.record_root.as_deref() {
        Some(root) => Some(RunRecorder::create(root, definition)?),
        None => None,
    };

    let mut runner = TrialRunner::new(
        vm,
        snapshot,
        &technique,
        &analysts,
        definition.repetitions(),
        options.timeouts,
    );
    let mut recorded = 0usize;
    while !runner.is_terminal() {
        runner.step();
        if let Some(recorder) = recorder.as_mut() {
            while recorded < runner.completed().len() {
                recorder.record_trial(&runner.completed()[recorded])?;
                recorded += 1;
            }
        }
    }
    let (trials, termination) = runner.into_outcome();
    let result = ExperimentResult {
        definition: definition.clone(),
        trials,
        termination,
    };
    if let Some(recorder) = recorder.as_mut() {
        recorder.finish(&result)?;
    }
    match &result.termination {
        Termination::Completed => info!(
            experiment = definition.name(),
            trials = result.trials.len(),
            "experiment completed"
        ),
        Termination::Aborted { repetition, reason } => warn!(
            experiment = definition.name(),
            repetition,
            %reason,
            trials = result.trials.len(),
            "experiment aborted with partial results"
        ),
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Definition summaries (CLI surface)

#[derive(Debug, Clone, Serialize)]
pub struct ComponentSummary {
    pub name: String,
    pub effective_parameters: ParameterSet,
}

#[derive(Debug, Clone, Serialize)]
pub struct DefinitionSummary {
    pub experiment: String,
    pub repetitions: u32,
    pub technique: ComponentSummary,
    pub analysts: Vec<ComponentSummary>,
    pub digest: String,
}

/// Preview how a definition will resolve: effective parameter sets per
/// component and the canonical digest of the validated document.
pub fn summarize_definition(
    definition: &ExperimentDefinition,
    strategy: MergeStrategy,
) -> Result<DefinitionSummary, serde_json::Error> {
    let digest = canonical_json_digest(definition)?;
    let component = |spec: &ComponentSpec| ComponentSummary {
        name: spec.name.to_string(),
        effective_parameters: merge_with(definition.parameters(), &spec.parameters, strategy),
    };
    Ok(DefinitionSummary {
        experiment: definition.name().to_string(),
        repetitions: definition.repetitions(),
        technique: component(definition.technique()),
        analysts: definition.analysts().iter().map(component).collect(),
        digest,
    })
}

// ---------------------------------------------------------------------------
// Run recording

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<(), RunError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)?;
    Ok(())
}

struct RunRecorder {
    run_dir: PathBuf,
    run_id: String,
    open: bool,
}

impl RunRecorder {
    fn create(root: &Path, definition: &ExperimentDefinition) -> Result<Self, RunError> {
        let run_id = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let run_dir = root.join("runs").join(&run_id);
        fs::create_dir_all(run_dir.join("trials"))?;

        let resolved = serde_json::to_value(definition)?;
        atomic_write_json_pretty(&run_dir.join("resolved_definition.json"), &resolved)?;
        let digest = canonical_json_digest(&resolved)?;
        atomic_write_bytes(&run_dir.join("resolved_definition.digest"), digest.as_bytes())?;

        let manifest = json!({
            "run_id": run_id,
            "controller_version": env!("CARGO_PKG_VERSION"),
            "created_at": Utc::now().to_rfc3339(),
        });
        atomic_write_json_pretty(&run_dir.join("manifest.json"), &manifest)?;

        let recorder = Self {
            run_dir,
            run_id,
            open: true,
        };
        recorder.write_state("running")?;
        Ok(recorder)
    }

    fn write_state(&self, status: &str) -> Result<(), RunError> {
        let payload = json!({
            "run_id": self.run_id,
            "status": status,
            "updated_at": Utc::now().to_rfc3339(),
        });
        atomic_write_json_pretty(&self.run_dir.join("run_state.json"), &payload)
    }

    fn record_trial(&mut self, trial: &TrialResult) -> Result<(), RunError> {
        let path = self
            .run_dir
            .join("trials")
            .join(format!("trial_{}.json", trial.repetition));
        atomic_write_json_pretty(&path, &trial_record(trial))
    }

    fn finish(&mut self, result: &ExperimentResult) -> Result<(), RunError> {
        let payload = json!({
            "run_id": self.run_id,
            "experiment": result.definition.name(),
            "repetitions": result.definition.repetitions(),
            "trials_recorded": result.trials.len(),
            "termination": termination_record(&result.termination),
            "finished_at": Utc::now().to_rfc3339(),
        });
        atomic_write_json_pretty(&self.run_dir.join("result.json"), &payload)?;
        let status = match result.termination {
            Termination::Completed => "completed",
            Termination::Aborted { .. } => "aborted",
        };
        self.write_state(status)?;
        self.open = false;
        Ok(())
    }
}

impl Drop for RunRecorder {
    fn drop(&mut self) {
        if self.open {
            let _ = self.write_state("failed");
        }
    }
}

fn trial_record(trial: &TrialResult) -> Value {
    json!({
        "repetition": trial.repetition,
        "technique": technique_record(&trial.technique),
        "analysts": trial.analysts.iter().map(analyst_record).collect::<Vec<_>>(),
        "elapsed_ms": trial.elapsed.as_millis() as u64,
        "recorded_at": Utc::now().to_rfc3339(),
    })
}

fn technique_record(outcome: &Result<Artifact, ExecutionFailure>) -> Value {
    match outcome {
        Ok(artifact) => json!({"status": "completed", "artifact": artifact}),
        Err(failure) => failure_record(failure),
    }
}

fn failure_record(failure: &ExecutionFailure) -> Value {
    match failure {
        ExecutionFailure::Failed(reason) => json!({"status": "failed", "reason": reason}),
        ExecutionFailure::TimedOut(after) => {
            json!({"status": "timed_out", "after_ms": after.as_millis() as u64})
        }
    }
}

fn analyst_record(outcome: &AnalystOutcome) -> Value {
    let mut record = match &outcome.outcome {
        Ok(value) => json!({"status": "completed", "outcome": value}),
        Err(failure) => failure_record(failure),
    };
    if let Some(map) = record.as_object_mut() {
        map.insert("analyst".to_string(), json!(outcome.name.as_str()));
    }
    record
}

fn termination_record(termination: &Termination) -> Value {
    match termination {
        Termination::Completed => json!({"status": "completed"}),
        Termination::Aborted { repetition, reason } => json!({
            "status": "aborted",
            "repetition": repetition,
            "reason": reason.to_string(),
        }),
    }
}

//! The journey: a per-spawn step state machine.
//!
//! A spawn attempt crosses up to three address spaces (the
//! orchestrator, the preloader helper, and the spawned subprocess).
//! The journey records, for every stage the chosen spawn strategy can
//! go through, whether it ran, failed, and how long it took. On
//! failure the journey is snapshotted into the `SpawnException` so an
//! error page can show exactly where things went wrong.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::error::{Result, SpawnError};
use crate::timing::monotonic_usec_coarse;

/// The spawn strategy this journey describes. Fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JourneyType {
    SpawnDirectly,
    StartPreloader,
    SpawnThroughPreloader,
}

impl JourneyType {
    pub fn name(self) -> &'static str {
        match self {
            JourneyType::SpawnDirectly => "SPAWN_DIRECTLY",
            JourneyType::StartPreloader => "START_PRELOADER",
            JourneyType::SpawnThroughPreloader => "SPAWN_THROUGH_PRELOADER",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SPAWN_DIRECTLY" => Some(JourneyType::SpawnDirectly),
            "START_PRELOADER" => Some(JourneyType::StartPreloader),
            "SPAWN_THROUGH_PRELOADER" => Some(JourneyType::SpawnThroughPreloader),
            _ => None,
        }
    }
}

/// One stage of a spawn attempt.
///
/// Declaration order is part of the public contract: it orders steps
/// causally across the three address spaces, and
/// [`Journey::first_failed_step`] scans in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JourneyStep {
    // Orchestrator-side steps.
    SpawnerPreparation,
    SpawnerForkSubprocess,
    SpawnerConnectToPreloader,
    SpawnerSendCommandToPreloader,
    SpawnerReadResponseFromPreloader,
    SpawnerParseResponseFromPreloader,
    SpawnerProcessResponseFromPreloader,
    SpawnerHandshakePerform,
    SpawnerFinish,

    // Steps inside the preloader, when spawning through one.
    PreloaderPreparation,
    PreloaderForkSubprocess,
    PreloaderSendResponse,
    PreloaderFinish,

    // Steps inside the spawned subprocess.
    SubprocessBeforeFirstExec,
    SubprocessSpawnEnvSetupperBeforeShell,
    SubprocessOsShell,
    SubprocessSpawnEnvSetupperAfterShell,
    SubprocessExecWrapper,
    SubprocessWrapperPreparation,
    SubprocessAppLoadOrExec,
    SubprocessPrepareAfterForkingFromPreloader,
    SubprocessListen,
    SubprocessFinish,

    Unknown,
}

impl JourneyStep {
    /// Every real step, in declaration (causal) order.
    pub const ALL: &'static [JourneyStep] = &[
        JourneyStep::SpawnerPreparation,
        JourneyStep::SpawnerForkSubprocess,
        JourneyStep::SpawnerConnectToPreloader,
        JourneyStep::SpawnerSendCommandToPreloader,
        JourneyStep::SpawnerReadResponseFromPreloader,
        JourneyStep::SpawnerParseResponseFromPreloader,
        JourneyStep::SpawnerProcessResponseFromPreloader,
        JourneyStep::SpawnerHandshakePerform,
        JourneyStep::SpawnerFinish,
        JourneyStep::PreloaderPreparation,
        JourneyStep::PreloaderForkSubprocess,
        JourneyStep::PreloaderSendResponse,
        JourneyStep::PreloaderFinish,
        JourneyStep::SubprocessBeforeFirstExec,
        JourneyStep::SubprocessSpawnEnvSetupperBeforeShell,
        JourneyStep::SubprocessOsShell,
        JourneyStep::SubprocessSpawnEnvSetupperAfterShell,
        JourneyStep::SubprocessExecWrapper,
        JourneyStep::SubprocessWrapperPreparation,
        JourneyStep::SubprocessAppLoadOrExec,
        JourneyStep::SubprocessPrepareAfterForkingFromPreloader,
        JourneyStep::SubprocessListen,
        JourneyStep::SubprocessFinish,
    ];

    pub fn name(self) -> &'static str {
        match self {
            JourneyStep::SpawnerPreparation => "SPAWNER_PREPARATION",
            JourneyStep::SpawnerForkSubprocess => "SPAWNER_FORK_SUBPROCESS",
            JourneyStep::SpawnerConnectToPreloader => "SPAWNER_CONNECT_TO_PRELOADER",
            JourneyStep::SpawnerSendCommandToPreloader => "SPAWNER_SEND_COMMAND_TO_PRELOADER",
            JourneyStep::SpawnerReadResponseFromPreloader => "SPAWNER_READ_RESPONSE_FROM_PRELOADER",
            JourneyStep::SpawnerParseResponseFromPreloader => {
                "SPAWNER_PARSE_RESPONSE_FROM_PRELOADER"
            }
            JourneyStep::SpawnerProcessResponseFromPreloader => {
                "SPAWNER_PROCESS_RESPONSE_FROM_PRELOADER"
            }
            JourneyStep::SpawnerHandshakePerform => "SPAWNER_HANDSHAKE_PERFORM",
            JourneyStep::SpawnerFinish => "SPAWNER_FINISH",
            JourneyStep::PreloaderPreparation => "PRELOADER_PREPARATION",
            JourneyStep::PreloaderForkSubprocess => "PRELOADER_FORK_SUBPROCESS",
            JourneyStep::PreloaderSendResponse => "PRELOADER_SEND_RESPONSE",
            JourneyStep::PreloaderFinish => "PRELOADER_FINISH",
            JourneyStep::SubprocessBeforeFirstExec => "SUBPROCESS_BEFORE_FIRST_EXEC",
            JourneyStep::SubprocessSpawnEnvSetupperBeforeShell => {
                "SUBPROCESS_SPAWN_ENV_SETUPPER_BEFORE_SHELL"
            }
            JourneyStep::SubprocessOsShell => "SUBPROCESS_OS_SHELL",
            JourneyStep::SubprocessSpawnEnvSetupperAfterShell => {
                "SUBPROCESS_SPAWN_ENV_SETUPPER_AFTER_SHELL"
            }
            JourneyStep::SubprocessExecWrapper => "SUBPROCESS_EXEC_WRAPPER",
            JourneyStep::SubprocessWrapperPreparation => "SUBPROCESS_WRAPPER_PREPARATION",
            JourneyStep::SubprocessAppLoadOrExec => "SUBPROCESS_APP_LOAD_OR_EXEC",
            JourneyStep::SubprocessPrepareAfterForkingFromPreloader => {
                "SUBPROCESS_PREPARE_AFTER_FORKING_FROM_PRELOADER"
            }
            JourneyStep::SubprocessListen => "SUBPROCESS_LISTEN",
            JourneyStep::SubprocessFinish => "SUBPROCESS_FINISH",
            JourneyStep::Unknown => "UNKNOWN_JOURNEY_STEP",
        }
    }

    /// The on-disk directory name under `response/steps/`.
    pub fn lowercase_name(self) -> String {
        self.name().to_ascii_lowercase()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        JourneyStep::ALL.iter().copied().find(|s| s.name() == name)
    }

    pub fn is_subprocess_step(self) -> bool {
        matches!(
            self,
            JourneyStep::SubprocessBeforeFirstExec
                | JourneyStep::SubprocessSpawnEnvSetupperBeforeShell
                | JourneyStep::SubprocessOsShell
                | JourneyStep::SubprocessSpawnEnvSetupperAfterShell
                | JourneyStep::SubprocessExecWrapper
                | JourneyStep::SubprocessWrapperPreparation
                | JourneyStep::SubprocessAppLoadOrExec
                | JourneyStep::SubprocessPrepareAfterForkingFromPreloader
                | JourneyStep::SubprocessListen
                | JourneyStep::SubprocessFinish
        )
    }

    pub fn is_preloader_step(self) -> bool {
        matches!(
            self,
            JourneyStep::PreloaderPreparation
                | JourneyStep::PreloaderForkSubprocess
                | JourneyStep::PreloaderSendResponse
                | JourneyStep::PreloaderFinish
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JourneyStepState {
    /// Not started yet; rendered as an empty placeholder.
    NotStarted,
    /// Currently running; rendered as a spinner.
    InProgress,
    /// Completed successfully; rendered as a green tick.
    Performed,
    /// Failed; rendered as a red mark.
    Errored,
    Unknown,
}

impl JourneyStepState {
    pub fn name(self) -> &'static str {
        match self {
            JourneyStepState::NotStarted => "STEP_NOT_STARTED",
            JourneyStepState::InProgress => "STEP_IN_PROGRESS",
            JourneyStepState::Performed => "STEP_PERFORMED",
            JourneyStepState::Errored => "STEP_ERRORED",
            JourneyStepState::Unknown => "UNKNOWN_JOURNEY_STEP_STATE",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "STEP_NOT_STARTED" => JourneyStepState::NotStarted,
            "STEP_IN_PROGRESS" => JourneyStepState::InProgress,
            "STEP_PERFORMED" => JourneyStepState::Performed,
            "STEP_ERRORED" => JourneyStepState::Errored,
            _ => JourneyStepState::Unknown,
        }
    }
}

/// Per-step progress record. Timestamps are coarse monotonic
/// microseconds; zero means "not stamped yet".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JourneyStepInfo {
    pub state: JourneyStepState,
    pub start_time_usec: u64,
    pub end_time_usec: u64,
}

impl JourneyStepInfo {
    fn new() -> Self {
        JourneyStepInfo {
            state: JourneyStepState::NotStarted,
            start_time_usec: 0,
            end_time_usec: 0,
        }
    }

    pub fn usec_duration(&self) -> u64 {
        self.end_time_usec.saturating_sub(self.start_time_usec)
    }

    fn inspect_as_json(&self) -> Value {
        json!({
            "state": self.state.name(),
            "usec_duration": self.usec_duration(),
        })
    }
}

/// The step map for one spawn attempt.
#[derive(Clone, Debug)]
pub struct Journey {
    journey_type: JourneyType,
    using_wrapper: bool,
    // BTreeMap keyed by the enum keeps iteration in declaration order,
    // which first_failed_step and inspect_as_json rely on.
    steps: BTreeMap<JourneyStep, JourneyStepInfo>,
}

impl Journey {
    pub fn new(journey_type: JourneyType, using_wrapper: bool) -> Self {
        let mut journey = Journey {
            journey_type,
            using_wrapper,
            steps: BTreeMap::new(),
        };
        match journey_type {
            JourneyType::SpawnDirectly | JourneyType::StartPreloader => {
                journey.fill_in_steps_for_direct_style_journey();
            }
            JourneyType::SpawnThroughPreloader => {
                journey.fill_in_steps_for_spawn_through_preloader_journey();
            }
        }
        journey
    }

    fn insert_step(&mut self, step: JourneyStep) {
        self.steps.insert(step, JourneyStepInfo::new());
    }

    fn fill_in_steps_for_direct_style_journey(&mut self) {
        self.insert_step(JourneyStep::SpawnerPreparation);
        self.insert_step(JourneyStep::SpawnerForkSubprocess);
        self.insert_step(JourneyStep::SpawnerHandshakePerform);
        self.insert_step(JourneyStep::SpawnerFinish);

        self.insert_step(JourneyStep::SubprocessBeforeFirstExec);
        self.insert_step(JourneyStep::SubprocessSpawnEnvSetupperBeforeShell);
        self.insert_step(JourneyStep::SubprocessOsShell);
        self.insert_step(JourneyStep::SubprocessSpawnEnvSetupperAfterShell);
        if self.using_wrapper {
            self.insert_step(JourneyStep::SubprocessExecWrapper);
            self.insert_step(JourneyStep::SubprocessWrapperPreparation);
        }
        self.insert_step(JourneyStep::SubprocessAppLoadOrExec);
        self.insert_step(JourneyStep::SubprocessListen);
        self.insert_step(JourneyStep::SubprocessFinish);
    }

    fn fill_in_steps_for_spawn_through_preloader_journey(&mut self) {
        self.insert_step(JourneyStep::SpawnerPreparation);
        self.insert_step(JourneyStep::SpawnerConnectToPreloader);
        self.insert_step(JourneyStep::SpawnerSendCommandToPreloader);
        self.insert_step(JourneyStep::SpawnerReadResponseFromPreloader);
        self.insert_step(JourneyStep::SpawnerParseResponseFromPreloader);
        self.insert_step(JourneyStep::SpawnerProcessResponseFromPreloader);
        self.insert_step(JourneyStep::SpawnerHandshakePerform);
        self.insert_step(JourneyStep::SpawnerFinish);

        self.insert_step(JourneyStep::PreloaderPreparation);
        self.insert_step(JourneyStep::PreloaderForkSubprocess);
        self.insert_step(JourneyStep::PreloaderSendResponse);
        self.insert_step(JourneyStep::PreloaderFinish);

        self.insert_step(JourneyStep::SubprocessPrepareAfterForkingFromPreloader);
        self.insert_step(JourneyStep::SubprocessListen);
        self.insert_step(JourneyStep::SubprocessFinish);
    }

    pub fn journey_type(&self) -> JourneyType {
        self.journey_type
    }

    pub fn using_wrapper(&self) -> bool {
        self.using_wrapper
    }

    pub fn has_step(&self, step: JourneyStep) -> bool {
        self.steps.contains_key(&step)
    }

    pub fn get_step_info(&self, step: JourneyStep) -> Result<&JourneyStepInfo> {
        self.steps
            .get(&step)
            .ok_or_else(|| SpawnError::InvalidStep(step.name().to_string()))
    }

    fn get_step_info_mut(&mut self, step: JourneyStep) -> Result<&mut JourneyStepInfo> {
        self.steps
            .get_mut(&step)
            .ok_or_else(|| SpawnError::InvalidStep(step.name().to_string()))
    }

    /// The first errored step in causal order, or `Unknown` if no step
    /// has errored.
    pub fn first_failed_step(&self) -> JourneyStep {
        for (step, info) in &self.steps {
            if info.state == JourneyStepState::Errored {
                return *step;
            }
        }
        JourneyStep::Unknown
    }

    /// Resets a step back to not-started. Used when retrying after a
    /// preloader crash so the retry's journey is clean.
    pub fn set_step_not_started(&mut self, step: JourneyStep, force: bool) -> Result<()> {
        let info = self.get_step_info_mut(step)?;
        if info.state == JourneyStepState::NotStarted
            || info.state == JourneyStepState::InProgress
            || force
        {
            info.state = JourneyStepState::NotStarted;
            info.start_time_usec = 0;
            Ok(())
        } else {
            Err(SpawnError::InvalidTransition(format!(
                "Unable to change state for journey step {} because it wasn't already in progress",
                step.name()
            )))
        }
    }

    pub fn set_step_in_progress(&mut self, step: JourneyStep, force: bool) -> Result<()> {
        let info = self.get_step_info_mut(step)?;
        if info.state == JourneyStepState::InProgress {
            return Ok(());
        }
        if info.state == JourneyStepState::NotStarted || force {
            info.state = JourneyStepState::InProgress;
            // A forced transition must not clobber an already-stamped
            // completion time.
            if info.end_time_usec == 0 {
                info.start_time_usec = monotonic_usec_coarse();
            }
            Ok(())
        } else {
            Err(SpawnError::InvalidTransition(format!(
                "Unable to change state for journey step {} because it was already in progress or completed",
                step.name()
            )))
        }
    }

    pub fn set_step_performed(&mut self, step: JourneyStep, force: bool) -> Result<()> {
        let info = self.get_step_info_mut(step)?;
        if info.state == JourneyStepState::Performed {
            return Ok(());
        }
        if info.state == JourneyStepState::InProgress || force {
            info.state = JourneyStepState::Performed;
            if info.end_time_usec == 0 {
                info.end_time_usec = monotonic_usec_coarse();
            }
            Ok(())
        } else {
            Err(SpawnError::InvalidTransition(format!(
                "Unable to change state for journey step {} because it wasn't already in progress",
                step.name()
            )))
        }
    }

    pub fn set_step_errored(&mut self, step: JourneyStep, force: bool) -> Result<()> {
        let info = self.get_step_info_mut(step)?;
        if info.state == JourneyStepState::Errored {
            return Ok(());
        }
        if info.state == JourneyStepState::InProgress || force {
            info.state = JourneyStepState::Errored;
            if info.end_time_usec == 0 {
                info.end_time_usec = monotonic_usec_coarse();
            }
            Ok(())
        } else {
            Err(SpawnError::InvalidTransition(format!(
                "Unable to change state for journey step {} because it wasn't already in progress",
                step.name()
            )))
        }
    }

    /// Overrides a step's recorded duration with an externally measured
    /// one (e.g. reported by the subprocess through the work dir).
    pub fn set_step_execution_duration(&mut self, step: JourneyStep, usec: u64) -> Result<()> {
        let info = self.get_step_info_mut(step)?;
        info.start_time_usec = 0;
        info.end_time_usec = usec;
        Ok(())
    }

    pub fn inspect_as_json(&self) -> Value {
        let mut steps = serde_json::Map::new();
        for (step, info) in &self.steps {
            steps.insert(step.name().to_string(), info.inspect_as_json());
        }
        json!({
            "type": self.journey_type.name(),
            "steps": Value::Object(steps),
        })
    }

    /// Reconstructs a journey from its `inspect_as_json` form, so that
    /// `inspect_as_json(rebuild_from_json(doc)) == doc`.
    pub fn rebuild_from_json(doc: &Value) -> Result<Self> {
        let type_name = doc
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SpawnError::Protocol("journey document lacks a type".into()))?;
        let journey_type = JourneyType::from_name(type_name)
            .ok_or_else(|| SpawnError::Protocol(format!("unknown journey type {type_name}")))?;
        let steps_doc = doc
            .get("steps")
            .and_then(Value::as_object)
            .ok_or_else(|| SpawnError::Protocol("journey document lacks steps".into()))?;

        let mut steps = BTreeMap::new();
        for (name, entry) in steps_doc {
            let step = JourneyStep::from_name(name)
                .ok_or_else(|| SpawnError::InvalidStep(name.clone()))?;
            let state = entry
                .get("state")
                .and_then(Value::as_str)
                .map(JourneyStepState::from_name)
                .ok_or_else(|| {
                    SpawnError::Protocol(format!("journey step {name} lacks a state"))
                })?;
            let duration = entry
                .get("usec_duration")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            steps.insert(
                step,
                JourneyStepInfo {
                    state,
                    start_time_usec: 0,
                    end_time_usec: duration,
                },
            );
        }

        let using_wrapper = steps.contains_key(&JourneyStep::SubprocessExecWrapper);
        Ok(Journey {
            journey_type,
            using_wrapper,
            steps,
        })
    }
}

//! Build orchestration
//!
//! A build turns the selected unit into fresh artifacts: each side whose
//! path is configured and whose rebuild flag is on gets its own invocation of
//! the project's build command, target first. The resulting objects are read
//! into memory and, when a diff engine binary is configured, diffed once.
//!
//! Only one build runs at a time. The work happens on a worker thread and
//! its [`BuildOutcome`] is handed to a completion callback exactly once, even
//! if the worker unwinds.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigProperties, ProjectConfig, Unit};
use crate::constants::app::WORKSPACE_HASH_LEN;
use crate::constants::build::{DIFF_OUTPUT_EXT, DIFF_OUTPUT_PREFIX, TASK_BUILD, TASK_DIFF};
use crate::constants::ipc::MAX_OBJECT_SIZE;
use crate::error::{Precondition, WorkspaceError};
use crate::protocol::ObjectData;
use crate::task::{Task, TaskExecutor, TaskResult};

/// Outcome of one build invocation, as shown to views
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BuildStatus {
    pub success: bool,
    pub cmdline: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl BuildStatus {
    fn from_result(task: &Task, result: &TaskResult) -> Self {
        Self {
            success: result.success(),
            cmdline: task.command_line(),
            stdout: result.stdout.clone().unwrap_or_default(),
            stderr: result.stderr.clone().unwrap_or_default(),
        }
    }

    fn failed(cmdline: String, message: String) -> Self {
        Self {
            success: false,
            cmdline,
            stdout: String::new(),
            stderr: message,
        }
    }
}

/// Comparison side: left is the target (expected), right is the base (current)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn label(self) -> &'static str {
        match self {
            Side::Left => "target",
            Side::Right => "base",
        }
    }
}

/// Blake3 digest of the workspace root, used to namespace per-workspace files
pub fn workspace_hash(root: &Path) -> String {
    let digest = blake3::hash(root.to_string_lossy().as_bytes());
    let mut hex = digest.to_hex().to_string();
    hex.truncate(WORKSPACE_HASH_LEN);
    hex
}

pub fn diff_output_path(storage_dir: &Path, hash: &str) -> PathBuf {
    storage_dir.join(format!("{DIFF_OUTPUT_PREFIX}{hash}.{DIFF_OUTPUT_EXT}"))
}

// ==============================================================================
// Plan
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidePlan {
    pub side: Side,
    /// Path relative to the workspace root
    pub path: String,
    pub rebuild: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffPlan {
    pub binary: String,
    pub output: PathBuf,
    /// Modified preferences, passed as `-c key=value`
    pub options: ConfigProperties,
}

/// Everything a build needs, captured up front so a config reload during the
/// build cannot change what it works on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub unit: String,
    pub command: String,
    pub args: Vec<String>,
    pub left: Option<SidePlan>,
    pub right: Option<SidePlan>,
    pub diff: Option<DiffPlan>,
}

impl BuildPlan {
    pub fn new(
        config: Option<&ProjectConfig>,
        unit: Option<&Unit>,
        diff: Option<DiffPlan>,
    ) -> Result<Self, Precondition> {
        let config = config.ok_or(Precondition::NoConfiguration)?;
        let unit = unit.ok_or(Precondition::NoUnitSelected)?;
        if unit.target_path().is_none() && unit.base_path().is_none() {
            return Err(Precondition::NoTargetOrBasePath);
        }
        let side = |side, path: Option<&str>, rebuild| {
            path.map(|path| SidePlan {
                side,
                path: path.to_string(),
                rebuild,
            })
        };
        Ok(Self {
            unit: unit.name().to_string(),
            command: config.build_command().to_string(),
            args: config.build_args().to_vec(),
            left: side(Side::Left, unit.target_path(), config.build_target()),
            right: side(Side::Right, unit.base_path(), config.build_base()),
            diff,
        })
    }

    fn build_task(&self, path: &str) -> Task {
        let mut args = self.args.clone();
        args.push(path.to_string());
        Task::new(TASK_BUILD, &self.command, args)
    }
}

impl DiffPlan {
    fn task(&self, left: Option<&str>, right: Option<&str>) -> Task {
        let mut args = vec!["diff".to_string()];
        if let Some(path) = left {
            args.extend(["-1".to_string(), path.to_string()]);
        }
        if let Some(path) = right {
            args.extend(["-2".to_string(), path.to_string()]);
        }
        args.extend([
            "--format".to_string(),
            "proto".to_string(),
            "-o".to_string(),
            self.output.to_string_lossy().into_owned(),
        ]);
        for (key, value) in &self.options {
            args.push("-c".to_string());
            args.push(format!("{key}={value}"));
        }
        Task::new(TASK_DIFF, &self.binary, args)
    }
}

// ==============================================================================
// Execution
// ==============================================================================

/// Result of one side of a build
#[derive(Debug, Default)]
pub struct SideOutcome {
    /// `None` when the side was not built
    pub status: Option<BuildStatus>,
    pub object: Option<ObjectData>,
}

#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub unit: String,
    pub left: SideOutcome,
    pub right: SideOutcome,
    pub diff_result: Option<ObjectData>,
    /// Failures to surface as user-visible errors
    pub errors: Vec<WorkspaceError>,
    /// The worker died before finishing; nothing else is meaningful
    pub aborted: bool,
}

impl BuildOutcome {
    fn aborted() -> Self {
        Self {
            aborted: true,
            ..Default::default()
        }
    }

    pub fn side(&self, side: Side) -> &SideOutcome {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn failed(&self) -> bool {
        [&self.left, &self.right]
            .iter()
            .any(|side| side.status.as_ref().is_some_and(|s| !s.success))
    }
}

/// Run a plan to completion on the calling thread
pub fn execute(plan: &BuildPlan, executor: &dyn TaskExecutor, root: &Path) -> BuildOutcome {
    let mut outcome = BuildOutcome {
        unit: plan.unit.clone(),
        ..Default::default()
    };
    for side_plan in [&plan.left, &plan.right].into_iter().flatten() {
        let side = run_side(plan, side_plan, executor, root, &mut outcome.errors);
        match side_plan.side {
            Side::Left => outcome.left = side,
            Side::Right => outcome.right = side,
        }
    }

    if let Some(diff) = &plan.diff {
        if outcome.failed() {
            debug!(unit = %plan.unit, "Skipping diff after failed build");
        } else if outcome.left.object.is_none() && outcome.right.object.is_none() {
            debug!(unit = %plan.unit, "Skipping diff, no objects");
        } else {
            let left = plan.left.as_ref().filter(|_| outcome.left.object.is_some());
            let right = plan.right.as_ref().filter(|_| outcome.right.object.is_some());
            let task = diff.task(
                left.map(|s| s.path.as_str()),
                right.map(|s| s.path.as_str()),
            );
            match run_diff(&task, &diff.output, executor) {
                Ok(bytes) => outcome.diff_result = Some(bytes),
                Err(e) => outcome.errors.push(e),
            }
        }
    }
    outcome
}

fn run_side(
    plan: &BuildPlan,
    side_plan: &SidePlan,
    executor: &dyn TaskExecutor,
    root: &Path,
    errors: &mut Vec<WorkspaceError>,
) -> SideOutcome {
    let side = side_plan.side.label();
    let mut outcome = SideOutcome::default();

    if side_plan.rebuild {
        let task = plan.build_task(&side_plan.path);
        let status = match executor.run(&task) {
            Ok(result) => {
                info!(
                    unit = %plan.unit,
                    side,
                    code = result.code,
                    elapsed_ms = result.elapsed().as_millis() as u64,
                    "Build finished"
                );
                BuildStatus::from_result(&task, &result)
            }
            Err(e) => {
                error!(unit = %plan.unit, side, error = %e, "Failed to run build");
                let status = BuildStatus::failed(task.command_line(), format!("{e:#}"));
                errors.push(e);
                status
            }
        };
        outcome.status = Some(status);
    }

    let built = outcome.status.as_ref().map(|s| (s.success, s.cmdline.clone()));
    if matches!(built, Some((false, _))) {
        return outcome;
    }
    let path = root.join(&side_plan.path);
    match read_object(&path) {
        Ok(object) => {
            debug!(side, path = %path.display(), len = object.len(), "Read object");
            outcome.object = Some(object);
        }
        Err(WorkspaceError::ArtifactRead { source, .. }) if built.is_none() => {
            debug!(side, path = %path.display(), error = %source, "Object not available");
        }
        Err(err) => {
            error!(unit = %plan.unit, side, error = %err, "Build produced no usable object");
            let cmdline = built.map(|(_, cmdline)| cmdline).unwrap_or_default();
            outcome.status = Some(BuildStatus::failed(cmdline, err.to_string()));
            errors.push(err);
        }
    }
    outcome
}

/// Read an output file, refusing ones too large to send to views
fn read_object(path: &Path) -> Result<ObjectData, WorkspaceError> {
    let read_error = |source| WorkspaceError::ArtifactRead {
        path: path.to_path_buf(),
        source,
    };
    let size = fs::metadata(path).map_err(read_error)?.len();
    if size > MAX_OBJECT_SIZE as u64 {
        return Err(WorkspaceError::ObjectTooLarge {
            path: path.to_path_buf(),
            size,
            max: MAX_OBJECT_SIZE,
        });
    }
    fs::read(path).map(ObjectData::from).map_err(read_error)
}

/// Run the diff engine and take its output; the output file never outlives this call
fn run_diff(task: &Task, output: &Path, executor: &dyn TaskExecutor) -> Result<ObjectData, WorkspaceError> {
    if let Some(parent) = output.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!(path = %parent.display(), error = %e, "Failed to create diff output directory");
        }
    }
    let diff = diff_once(task, output, executor);
    match fs::remove_file(output) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %output.display(), error = %e, "Failed to remove diff output"),
    }
    diff
}

fn diff_once(task: &Task, output: &Path, executor: &dyn TaskExecutor) -> Result<ObjectData, WorkspaceError> {
    let result = executor.run(task)?;
    info!(code = result.code, elapsed_ms = result.elapsed().as_millis() as u64, "Diff finished");
    if !result.success() {
        return Err(WorkspaceError::DiffFailed {
            code: result.code,
            stderr: result.stderr.unwrap_or_default(),
        });
    }
    read_object(output)
}

// ==============================================================================
// Orchestrator
// ==============================================================================

/// Delivers the outcome exactly once; an unfinished worker reports `aborted`
struct Completion<F: FnOnce(BuildOutcome)> {
    notify: Option<F>,
}

impl<F: FnOnce(BuildOutcome)> Completion<F> {
    fn complete(mut self, outcome: BuildOutcome) {
        if let Some(notify) = self.notify.take() {
            notify(outcome);
        }
    }
}

impl<F: FnOnce(BuildOutcome)> Drop for Completion<F> {
    fn drop(&mut self) {
        if let Some(notify) = self.notify.take() {
            warn!("Build worker exited without an outcome");
            notify(BuildOutcome::aborted());
        }
    }
}

/// Owns the single-build guard and launches build workers
pub struct BuildOrchestrator {
    root: PathBuf,
    diff_output: PathBuf,
    executor: Arc<dyn TaskExecutor>,
    running: bool,
}

impl BuildOrchestrator {
    pub fn new(root: &Path, storage_dir: &Path, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            root: root.to_path_buf(),
            diff_output: diff_output_path(storage_dir, &workspace_hash(root)),
            executor,
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Diff step settings for the current preferences, if a binary is set
    pub fn diff_plan(&self, binary: Option<&str>, options: ConfigProperties) -> Option<DiffPlan> {
        binary.map(|binary| DiffPlan {
            binary: binary.to_string(),
            output: self.diff_output.clone(),
            options,
        })
    }

    /// Start a build unless one is running or a precondition fails
    ///
    /// `on_done` receives the outcome from the worker thread; the owner must
    /// then call [`BuildOrchestrator::finish`].
    pub fn try_build<F>(
        &mut self,
        config: Option<&ProjectConfig>,
        unit: Option<&Unit>,
        diff: Option<DiffPlan>,
        on_done: F,
    ) -> Result<(), WorkspaceError>
    where
        F: FnOnce(BuildOutcome) + Send + 'static,
    {
        if self.running {
            return Err(Precondition::BuildInProgress.into());
        }
        let plan = BuildPlan::new(config, unit, diff)?;
        info!(unit = %plan.unit, "Starting build");
        self.running = true;

        let completion = Completion {
            notify: Some(on_done),
        };
        let executor = Arc::clone(&self.executor);
        let root = self.root.clone();
        // On spawn failure the closure is dropped, so the completion still fires
        std::thread::Builder::new()
            .name("build".to_string())
            .spawn(move || {
                let outcome = execute(&plan, executor.as_ref(), &root);
                completion.complete(outcome);
            })
            .map_err(|source| WorkspaceError::TaskLaunch {
                command: "build worker".to_string(),
                source,
            })?;
        Ok(())
    }

    /// Clear the running flag once the outcome has been received
    pub fn finish(&mut self) {
        self.running = false;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{PropertyValue, resolve};
    use std::sync::Mutex;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    type Script = Box<dyn Fn(&Task) -> Result<TaskResult, WorkspaceError> + Send + Sync>;

    /// Records every task and answers with a scripted result
    pub(crate) struct RecordingExecutor {
        pub tasks: Mutex<Vec<Task>>,
        script: Script,
    }

    impl RecordingExecutor {
        pub(crate) fn new<F>(script: F) -> Self
        where
            F: Fn(&Task) -> Result<TaskResult, WorkspaceError> + Send + Sync + 'static,
        {
            Self {
                tasks: Mutex::new(Vec::new()),
                script: Box::new(script),
            }
        }

        pub(crate) fn exit(code: i32, stderr: &str) -> Self {
            let stderr = stderr.to_string();
            Self::new(move |_| Ok(result(code, &stderr)))
        }

        pub(crate) fn args(&self) -> Vec<Vec<String>> {
            self.tasks.lock().unwrap().iter().map(|t| t.args.clone()).collect()
        }
    }

    impl TaskExecutor for RecordingExecutor {
        fn run(&self, task: &Task) -> Result<TaskResult, WorkspaceError> {
            self.tasks.lock().unwrap().push(task.clone());
            (self.script)(task)
        }
    }

    pub(crate) fn result(code: i32, stderr: &str) -> TaskResult {
        TaskResult {
            code,
            stdout: Some(String::new()),
            stderr: Some(stderr.to_string()),
            start_time: Instant::now(),
        }
    }

    fn config(json: serde_json::Value) -> ProjectConfig {
        resolve(serde_json::from_value(json).unwrap())
    }

    fn scenario_config() -> ProjectConfig {
        config(serde_json::json!({
            "custom_make": "make",
            "units": [{"name": "a", "target_path": "t/a.o", "base_path": "b/a.o"}]
        }))
    }

    #[test]
    fn test_plan_preconditions() {
        let cfg = scenario_config();
        assert_eq!(
            BuildPlan::new(None, cfg.find_unit("a"), None),
            Err(Precondition::NoConfiguration)
        );
        assert_eq!(
            BuildPlan::new(Some(&cfg), None, None),
            Err(Precondition::NoUnitSelected)
        );
        let pathless = Unit {
            name: Some("x".to_string()),
            ..Default::default()
        };
        assert_eq!(
            BuildPlan::new(Some(&cfg), Some(&pathless), None),
            Err(Precondition::NoTargetOrBasePath)
        );
    }

    #[test]
    fn test_plan_uses_rebuild_flags() {
        let cfg = scenario_config();
        let plan = BuildPlan::new(Some(&cfg), cfg.find_unit("a"), None).unwrap();
        assert_eq!(plan.command, "make");
        assert!(!plan.left.as_ref().unwrap().rebuild);
        assert!(plan.right.as_ref().unwrap().rebuild);
    }

    #[test]
    fn test_execute_builds_base_and_reads_object() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b/a.o"), [0x7f, b'E', b'L', b'F']).unwrap();

        let cfg = scenario_config();
        let plan = BuildPlan::new(Some(&cfg), cfg.find_unit("a"), None).unwrap();
        let executor = RecordingExecutor::exit(0, "");
        let outcome = execute(&plan, &executor, dir.path());

        assert_eq!(executor.args(), vec![vec!["b/a.o".to_string()]]);
        assert!(outcome.left.status.is_none());
        assert!(outcome.left.object.is_none());
        let status = outcome.right.status.as_ref().unwrap();
        assert!(status.success);
        assert_eq!(status.cmdline, "make b/a.o");
        assert_eq!(outcome.right.object.as_ref().unwrap().len(), 4);
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn test_execute_failed_build_leaves_object_unset() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b/a.o"), b"stale").unwrap();

        let cfg = scenario_config();
        let plan = BuildPlan::new(Some(&cfg), cfg.find_unit("a"), None).unwrap();
        let outcome = execute(&plan, &RecordingExecutor::exit(1, "syntax error"), dir.path());

        let status = outcome.right.status.as_ref().unwrap();
        assert!(!status.success);
        assert_eq!(status.stderr, "syntax error");
        assert!(outcome.right.object.is_none());
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn test_execute_sides_are_independent() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b/a.o"), b"base").unwrap();

        let cfg = config(serde_json::json!({
            "build_target": true,
            "custom_args": ["-j4"],
            "units": [{"name": "a", "target_path": "t/a.o", "base_path": "b/a.o"}]
        }));
        let plan = BuildPlan::new(Some(&cfg), cfg.find_unit("a"), None).unwrap();
        let executor = RecordingExecutor::new(|task| {
            let code = if task.args.last().map(String::as_str) == Some("t/a.o") { 2 } else { 0 };
            Ok(result(code, ""))
        });
        let outcome = execute(&plan, &executor, dir.path());

        assert_eq!(
            executor.args(),
            vec![
                vec!["-j4".to_string(), "t/a.o".to_string()],
                vec!["-j4".to_string(), "b/a.o".to_string()],
            ]
        );
        assert!(!outcome.left.status.as_ref().unwrap().success);
        assert!(outcome.right.status.as_ref().unwrap().success);
        assert!(outcome.right.object.is_some());
    }

    #[test]
    fn test_missing_object_after_success_is_artifact_error() {
        let dir = tempdir().unwrap();
        let cfg = scenario_config();
        let plan = BuildPlan::new(Some(&cfg), cfg.find_unit("a"), None).unwrap();
        let outcome = execute(&plan, &RecordingExecutor::exit(0, ""), dir.path());

        assert!(!outcome.right.status.as_ref().unwrap().success);
        assert!(matches!(
            outcome.errors.as_slice(),
            [WorkspaceError::ArtifactRead { .. }]
        ));
    }

    #[test]
    fn test_launch_failure_marks_side_failed() {
        let dir = tempdir().unwrap();
        let cfg = scenario_config();
        let plan = BuildPlan::new(Some(&cfg), cfg.find_unit("a"), None).unwrap();
        let executor = RecordingExecutor::new(|task| {
            Err(WorkspaceError::TaskLaunch {
                command: task.command.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        });
        let outcome = execute(&plan, &executor, dir.path());

        assert!(!outcome.right.status.as_ref().unwrap().success);
        assert!(matches!(
            outcome.errors.as_slice(),
            [WorkspaceError::TaskLaunch { .. }]
        ));
    }

    #[test]
    fn test_diff_step_passes_modified_options() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("t")).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("t/a.o"), b"target").unwrap();
        fs::write(dir.path().join("b/a.o"), b"base").unwrap();

        let output = dir.path().join("storage/diff_0123.binpb");
        let diff = DiffPlan {
            binary: "objdiff-cli".to_string(),
            output: output.clone(),
            options: ConfigProperties::from([(
                "arm.archVersion".to_string(),
                PropertyValue::String("v4t".to_string()),
            )]),
        };
        let cfg = scenario_config();
        let plan = BuildPlan::new(Some(&cfg), cfg.find_unit("a"), Some(diff)).unwrap();
        let written = output.clone();
        let executor = RecordingExecutor::new(move |task| {
            if task.kind == TASK_DIFF {
                fs::write(&written, b"diff").unwrap();
            }
            Ok(result(0, ""))
        });
        let outcome = execute(&plan, &executor, dir.path());

        let args = executor.args();
        let out = output.to_string_lossy().into_owned();
        assert_eq!(
            args[1],
            vec![
                "diff", "-1", "t/a.o", "-2", "b/a.o", "--format", "proto", "-o",
                out.as_str(), "-c", "arm.archVersion=v4t",
            ]
        );
        assert_eq!(outcome.diff_result.as_ref().unwrap().as_bytes(), b"diff");
        assert!(!output.exists());
    }

    #[test]
    fn test_failed_diff_still_removes_output() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b/a.o"), b"base").unwrap();

        let output = dir.path().join("storage/diff_0123.binpb");
        let diff = DiffPlan {
            binary: "objdiff-cli".to_string(),
            output: output.clone(),
            options: ConfigProperties::new(),
        };
        let cfg = scenario_config();
        let plan = BuildPlan::new(Some(&cfg), cfg.find_unit("a"), Some(diff)).unwrap();
        let written = output.clone();
        let executor = RecordingExecutor::new(move |task| {
            if task.kind == TASK_DIFF {
                fs::write(&written, b"partial").unwrap();
                return Ok(result(3, "bad arch"));
            }
            Ok(result(0, ""))
        });
        let outcome = execute(&plan, &executor, dir.path());

        assert!(outcome.diff_result.is_none());
        assert!(matches!(
            outcome.errors.as_slice(),
            [WorkspaceError::DiffFailed { code: 3, .. }]
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_oversized_object_fails_side() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        let file = fs::File::create(dir.path().join("b/a.o")).unwrap();
        file.set_len(MAX_OBJECT_SIZE as u64 + 1).unwrap();

        let cfg = scenario_config();
        let plan = BuildPlan::new(Some(&cfg), cfg.find_unit("a"), None).unwrap();
        let outcome = execute(&plan, &RecordingExecutor::exit(0, ""), dir.path());

        let status = outcome.right.status.as_ref().unwrap();
        assert!(!status.success);
        assert_eq!(status.cmdline, "make b/a.o");
        assert!(outcome.right.object.is_none());
        assert!(matches!(
            outcome.errors.as_slice(),
            [WorkspaceError::ObjectTooLarge { .. }]
        ));
    }

    #[test]
    fn test_empty_target_path_is_not_built() {
        let cfg = config(serde_json::json!({
            "build_target": true,
            "units": [{"name": "a", "target_path": "", "base_path": "b/a.o"}]
        }));
        let plan = BuildPlan::new(Some(&cfg), cfg.find_unit("a"), None).unwrap();
        assert!(plan.left.is_none());
        assert_eq!(plan.right.as_ref().unwrap().path, "b/a.o");
    }

    #[test]
    fn test_workspace_hash_is_stable_and_distinct() {
        let a = workspace_hash(Path::new("/work/a"));
        assert_eq!(a.len(), WORKSPACE_HASH_LEN);
        assert_eq!(a, workspace_hash(Path::new("/work/a")));
        assert_ne!(a, workspace_hash(Path::new("/work/b")));
        assert!(
            diff_output_path(Path::new("/tmp"), &a)
                .to_string_lossy()
                .ends_with(&format!("diff_{a}.binpb"))
        );
    }

    #[test]
    fn test_second_build_rejected_while_running() {
        let dir = tempdir().unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let executor = Arc::new(RecordingExecutor::new(move |_| {
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
            Ok(result(0, ""))
        }));
        let mut orchestrator = BuildOrchestrator::new(dir.path(), dir.path(), executor.clone());
        let cfg = scenario_config();
        let (done_tx, done_rx) = mpsc::channel();

        let tx = done_tx.clone();
        orchestrator
            .try_build(Some(&cfg), cfg.find_unit("a"), None, move |o| {
                let _ = tx.send(o);
            })
            .unwrap();
        assert!(orchestrator.is_running());

        let second = orchestrator.try_build(Some(&cfg), cfg.find_unit("a"), None, move |o| {
            let _ = done_tx.send(o);
        });
        assert!(matches!(
            second,
            Err(WorkspaceError::Precondition(Precondition::BuildInProgress))
        ));

        release_tx.send(()).unwrap();
        let outcome = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        orchestrator.finish();
        assert!(!outcome.aborted);
        assert!(!orchestrator.is_running());
        assert_eq!(executor.args().len(), 1);
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_panicking_worker_reports_aborted() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(RecordingExecutor::new(|_| panic!("executor exploded")));
        let mut orchestrator = BuildOrchestrator::new(dir.path(), dir.path(), executor);
        let cfg = scenario_config();
        let (tx, rx) = mpsc::channel();
        orchestrator
            .try_build(Some(&cfg), cfg.find_unit("a"), None, move |o| {
                let _ = tx.send(o);
            })
            .unwrap();
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(outcome.aborted);
    }

    #[test]
    fn test_precondition_does_not_set_running() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(RecordingExecutor::exit(0, ""));
        let mut orchestrator = BuildOrchestrator::new(dir.path(), dir.path(), executor.clone());
        let err = orchestrator.try_build(None, None, None, |_| {}).unwrap_err();
        assert!(err.is_advisory());
        assert!(!orchestrator.is_running());
        assert!(executor.args().is_empty());
    }
}

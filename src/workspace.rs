//! Workspace daemon: one event loop owning all workspace state
//!
//! File watchers, view connections, signals and build workers all post
//! [`WorkspaceEvent`]s into one channel. [`Workspace::run`] consumes them on a
//! single thread, so state is never shared across threads. Builds are the one
//! long-running job; they run on a worker and report back with
//! [`WorkspaceEvent::BuildFinished`].

use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::broadcast::{StateBroadcaster, ViewId, ViewSink};
use crate::build::{BuildOrchestrator, BuildOutcome, workspace_hash};
use crate::config::{
    ConfigProperties, ConfigStore, LoadOutcome, PreferenceStore, PropertyValue, Unit,
};
use crate::constants::build::TASK_BUILD;
use crate::constants::config::FILENAME as CONFIG_FILENAME;
use crate::constants::ipc::{VIEW_QUEUE_CAPACITY, VIEW_WRITE_TIMEOUT_MS};
use crate::constants::settings::FILENAME as SETTINGS_FILENAME;
use crate::error::{Precondition, WorkspaceError};
use crate::host::{Host, Notification};
use crate::ipc::ViewConnection;
use crate::persistence::{Memento, MementoStore};
use crate::protocol::{InboundMessage, OutboundMessage, StateDelta, UnitTarget, WorkspaceState};
use crate::selection::{UnitSelector, quick_pick_items};
use crate::task::TaskExecutor;
use crate::watch::{FileChangeRouter, FileWatcher, WatchHandles};

pub enum WorkspaceEvent {
    /// `objdiff.json` was created, changed or deleted
    ConfigFileChanged,
    /// The workspace settings file changed
    SettingsChanged,
    /// Any file under the workspace root changed
    FileChanged(PathBuf),
    ViewAttached(ViewId, Box<dyn ViewSink>),
    ViewDetached(ViewId),
    ViewMessage(ViewId, OutboundMessage),
    BuildFinished(BuildOutcome),
    Shutdown,
}

/// Who asked for a build; automatic requests drop silently while one runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    User,
    Automatic,
}

pub struct WorkspaceOptions {
    pub root: PathBuf,
    pub storage_dir: PathBuf,
    pub executor: Arc<dyn TaskExecutor>,
    pub preferences: PreferenceStore,
    /// Install file system watchers
    pub watch: bool,
}

pub struct Workspace {
    root: PathBuf,
    config: ConfigStore,
    preferences: PreferenceStore,
    router: FileChangeRouter,
    selector: UnitSelector,
    orchestrator: BuildOrchestrator,
    views: StateBroadcaster,
    host: Host,
    memento: MementoStore,
    watches: WatchHandles,
    watch: bool,
    events: Sender<WorkspaceEvent>,
    closed: bool,
}

impl Workspace {
    /// Open a workspace: restore saved state, read preferences and config
    pub fn open(options: WorkspaceOptions, events: Sender<WorkspaceEvent>) -> Result<Self> {
        let root = options
            .root
            .canonicalize()
            .context(format!("Failed to resolve workspace root {}", options.root.display()))?;
        std::fs::create_dir_all(&options.storage_dir).context(format!(
            "Failed to create storage directory {}",
            options.storage_dir.display()
        ))?;
        let hash = workspace_hash(&root);
        let memento = MementoStore::open(Memento::path(&options.storage_dir, &hash))?;
        info!(root = %root.display(), hash = %hash, "Opening workspace");

        let mut views = StateBroadcaster::default();
        views.publish(StateDelta {
            view_state: Some(memento.memento().view_state.clone()),
            ..Default::default()
        });

        let mut workspace = Self {
            config: ConfigStore::new(&root),
            preferences: options.preferences,
            router: FileChangeRouter::new(&root),
            selector: UnitSelector::new(memento.memento().current_unit.clone()),
            orchestrator: BuildOrchestrator::new(&root, &options.storage_dir, options.executor),
            views,
            host: Host::default(),
            memento,
            watches: WatchHandles::default(),
            watch: options.watch,
            events,
            closed: false,
            root,
        };
        workspace.install_config_watcher();
        workspace.install_settings_watcher();
        workspace.reload_settings();
        workspace.reload_config();
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> &WorkspaceState {
        self.views.state()
    }

    pub fn current_unit(&self) -> Option<&Unit> {
        self.selector.current()
    }

    pub fn is_build_running(&self) -> bool {
        self.orchestrator.is_running()
    }

    /// Process events until shutdown, then close
    pub fn run(mut self, events: Receiver<WorkspaceEvent>) {
        for event in events.iter() {
            if !self.handle(event) {
                break;
            }
        }
        self.close();
    }

    /// Handle one event; false once the workspace should stop
    pub fn handle(&mut self, event: WorkspaceEvent) -> bool {
        match event {
            WorkspaceEvent::ConfigFileChanged => self.reload_config(),
            WorkspaceEvent::SettingsChanged => self.reload_settings(),
            WorkspaceEvent::FileChanged(path) => self.on_file_changed(&path),
            WorkspaceEvent::ViewAttached(id, sink) => self.views.attach(id, sink),
            WorkspaceEvent::ViewDetached(id) => self.views.detach(id),
            WorkspaceEvent::ViewMessage(id, message) => self.on_view_message(id, message),
            WorkspaceEvent::BuildFinished(outcome) => self.on_build_finished(outcome),
            WorkspaceEvent::Shutdown => {
                info!("Shutting down workspace");
                return false;
            }
        }
        true
    }

    /// Release watchers and flush saved state; runs once
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!(root = %self.root.display(), "Closing workspace");
        self.watches.teardown();
        self.memento.flush();
    }

    // ==========================================================================
    // Config and preferences
    // ==========================================================================

    fn reload_config(&mut self) {
        match self.config.load() {
            LoadOutcome::Failed(err) => {
                self.host.report(&mut self.views, &err);
                return;
            }
            LoadOutcome::Loaded | LoadOutcome::Cleared => {}
        }

        let patterns = self
            .config
            .config()
            .map(|config| config.watch_patterns())
            .unwrap_or_default();
        self.router.set_patterns(&patterns);
        self.install_workspace_watcher();

        self.views.publish(StateDelta {
            project_config: Some(self.config.snapshot()),
            ..Default::default()
        });

        if let Some(config) = self.config.config() {
            if self.selector.resolve_deferred(config) {
                self.publish_current_unit();
            }
        }
        if self.config.config().is_some() && self.selector.current().is_some() {
            self.try_build(Trigger::Automatic);
        }
    }

    /// Re-read preferences; publishes and rebuilds only on an actual change
    fn reload_settings(&mut self) {
        let before = self.preferences.properties().clone();
        if let Err(err) = self.preferences.load() {
            self.host.report(&mut self.views, &err);
            return;
        }
        self.on_properties_loaded(before);
    }

    fn set_config_property(&mut self, id: &str, value: Option<PropertyValue>) {
        let before = self.preferences.properties().clone();
        if let Err(err) = self.preferences.set_property(id, value) {
            self.host.report(&mut self.views, &err);
            return;
        }
        if self.watches.settings.is_none() {
            self.install_settings_watcher();
        }
        self.on_properties_loaded(before);
    }

    fn on_properties_loaded(&mut self, before: ConfigProperties) {
        let properties = self.preferences.properties();
        if *properties == before && self.views.state().config_properties == *properties {
            debug!("Config properties unchanged");
            return;
        }
        info!(modified = ?self.preferences.modified(), "Config properties changed");
        self.views.publish(StateDelta {
            config_properties: Some(properties.clone()),
            ..Default::default()
        });
        if self.config.config().is_some() && self.selector.current().is_some() {
            self.try_build(Trigger::Automatic);
        }
    }

    // ==========================================================================
    // Watchers
    // ==========================================================================

    fn install_config_watcher(&mut self) {
        if !self.watch {
            return;
        }
        let events = self.events.clone();
        let watcher = FileWatcher::new(&self.root, false, move |change| {
            if change.path.file_name().is_some_and(|name| name == CONFIG_FILENAME) {
                let _ = events.send(WorkspaceEvent::ConfigFileChanged);
            }
        });
        match watcher {
            Ok(watcher) => self.watches.config = Some(watcher),
            Err(e) => error!(root = %self.root.display(), error = %e, "Failed to watch config file"),
        }
    }

    fn install_settings_watcher(&mut self) {
        if !self.watch {
            return;
        }
        let Some(dir) = self.preferences.workspace_path().parent().map(Path::to_path_buf) else {
            return;
        };
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "No workspace settings directory to watch");
            return;
        }
        let events = self.events.clone();
        let watcher = FileWatcher::new(&dir, false, move |change| {
            if change.path.file_name().is_some_and(|name| name == SETTINGS_FILENAME) {
                let _ = events.send(WorkspaceEvent::SettingsChanged);
            }
        });
        match watcher {
            Ok(watcher) => self.watches.settings = Some(watcher),
            Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to watch settings"),
        }
    }

    /// (Re)install the recursive workspace watcher; none when nothing matches
    fn install_workspace_watcher(&mut self) {
        self.watches.workspace = None;
        if !self.watch || !self.router.is_active() {
            return;
        }
        let events = self.events.clone();
        let watcher = FileWatcher::new(&self.root, true, move |change| {
            let _ = events.send(WorkspaceEvent::FileChanged(change.path));
        });
        match watcher {
            Ok(watcher) => self.watches.workspace = Some(watcher),
            Err(e) => error!(root = %self.root.display(), error = %e, "Failed to watch workspace"),
        }
    }

    fn on_file_changed(&mut self, path: &Path) {
        if !self.router.matches(path) {
            return;
        }
        info!(path = %path.display(), "Workspace file changed");
        if self.config.config().is_some() && self.selector.current().is_some() {
            self.try_build(Trigger::Automatic);
        }
    }

    // ==========================================================================
    // Selection
    // ==========================================================================

    fn publish_current_unit(&mut self) {
        self.memento.set_current_unit(self.selector.current_name());
        self.views.publish(StateDelta {
            current_unit: Some(self.selector.current().cloned()),
            ..Default::default()
        });
    }

    /// Replace the selection and rebuild if possible
    pub fn set_current_unit(&mut self, unit: Option<Unit>) {
        self.selector.set_current_unit(unit);
        self.publish_current_unit();
        if self.config.config().is_some() && self.selector.current().is_some() {
            self.try_build(Trigger::Automatic);
        }
    }

    /// Select the unit built from the active editor's file
    pub fn resolve_from_active_file(&mut self) -> bool {
        let Some(config) = self.config.config() else {
            self.host
                .report(&mut self.views, &Precondition::NoConfiguration.into());
            return false;
        };
        match self
            .selector
            .resolve_from_active_file(config, &self.root, self.host.active_editor())
        {
            Ok(_) => {
                self.publish_current_unit();
                self.try_build(Trigger::Automatic);
                true
            }
            Err(precondition) => {
                let message = match (precondition, self.host.active_editor()) {
                    (Precondition::NotInWorkspace, Some(path)) => {
                        format!("{precondition}: {}", path.display())
                    }
                    (Precondition::NoUnitForSource, Some(path)) => {
                        let rel = path.strip_prefix(&self.root).unwrap_or(path);
                        format!("No unit found for {}", rel.display())
                    }
                    _ => precondition.to_string(),
                };
                self.host.notify(&mut self.views, Notification::warning(message));
                false
            }
        }
    }

    // ==========================================================================
    // Builds
    // ==========================================================================

    fn try_build(&mut self, trigger: Trigger) {
        let diff = self
            .orchestrator
            .diff_plan(self.preferences.binary_path(), self.preferences.modified());
        let events = self.events.clone();
        let result = self.orchestrator.try_build(
            self.config.config(),
            self.selector.current(),
            diff,
            move |outcome| {
                let _ = events.send(WorkspaceEvent::BuildFinished(outcome));
            },
        );
        match result {
            Ok(()) => self.views.publish(StateDelta {
                build_running: Some(true),
                ..Default::default()
            }),
            Err(WorkspaceError::Precondition(Precondition::BuildInProgress))
                if trigger == Trigger::Automatic =>
            {
                debug!("Build already running, dropping request");
            }
            Err(err) => self.host.report(&mut self.views, &err),
        }
    }

    fn on_build_finished(&mut self, outcome: BuildOutcome) {
        self.orchestrator.finish();
        if outcome.aborted {
            self.views.publish(StateDelta {
                build_running: Some(false),
                ..Default::default()
            });
            self.host
                .notify(&mut self.views, Notification::error("Build aborted unexpectedly"));
            return;
        }

        let stale = self.selector.current_name() != Some(outcome.unit.as_str());
        if stale {
            info!(unit = %outcome.unit, "Discarding build for previously selected unit");
            self.views.publish(StateDelta {
                build_running: Some(false),
                ..Default::default()
            });
            if self.config.config().is_some() && self.selector.current().is_some() {
                self.try_build(Trigger::Automatic);
            }
            return;
        }

        for status in [&outcome.left.status, &outcome.right.status].into_iter().flatten() {
            if !status.success {
                warn!(unit = %outcome.unit, cmdline = %status.cmdline, "Build failed");
            }
        }
        let BuildOutcome {
            left,
            right,
            diff_result,
            errors,
            ..
        } = outcome;
        self.views.publish(StateDelta {
            build_running: Some(false),
            left_status: Some(left.status),
            right_status: Some(right.status),
            left_object: Some(left.object),
            right_object: Some(right.object),
            diff_result: Some(diff_result),
            ..Default::default()
        });
        for err in &errors {
            self.host.report(&mut self.views, err);
        }
    }

    // ==========================================================================
    // View commands
    // ==========================================================================

    fn on_view_message(&mut self, view: ViewId, message: OutboundMessage) {
        debug!(view, ?message, "View message");
        match message {
            OutboundMessage::Ready => self.views.ready(view),
            OutboundMessage::RunTask { task_type } => {
                if task_type == TASK_BUILD {
                    self.try_build(Trigger::User);
                } else {
                    warn!(view, task_type = %task_type, "Unknown task type");
                }
            }
            OutboundMessage::SetCurrentUnit { unit } => match unit {
                None => self.set_current_unit(None),
                Some(UnitTarget::Source(_)) => {
                    self.resolve_from_active_file();
                }
                Some(UnitTarget::Unit(unit)) => self.set_current_unit(Some(*unit)),
            },
            OutboundMessage::QuickPickUnit => match self.config.config() {
                Some(config) => {
                    let items = quick_pick_items(config);
                    self.views.send_to(view, &InboundMessage::QuickPick { items });
                }
                None => self
                    .host
                    .report(&mut self.views, &Precondition::NoConfiguration.into()),
            },
            OutboundMessage::SetConfigProperty { id, value } => {
                self.set_config_property(&id, value)
            }
            OutboundMessage::OpenSettings { id } => {
                let path = self.preferences.workspace_path().to_path_buf();
                self.host.open_settings(&mut self.views, &path, id.as_deref());
            }
            OutboundMessage::LineRanges { data } => {
                self.views.broadcast(&InboundMessage::LineRanges { data });
            }
            OutboundMessage::ActiveEditor { path } => {
                self.host.set_active_editor(path.map(PathBuf::from));
            }
            OutboundMessage::CopySymbol {
                symbol_name,
                demangled_name,
                demangled,
            } => {
                let text = match demangled_name {
                    Some(name) if demangled => name,
                    _ => symbol_name,
                };
                self.host.write_clipboard(&mut self.views, view, text);
            }
            OutboundMessage::SetViewState { key, value } => {
                self.memento.set_view_state(key, value);
                self.views.publish(StateDelta {
                    view_state: Some(self.memento.memento().view_state.clone()),
                    ..Default::default()
                });
            }
            OutboundMessage::Unknown => {
                let err = WorkspaceError::Protocol(format!("unknown message from view {view}"));
                warn!(view, error = %err, "Ignoring message");
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.close();
    }
}

/// Allocates view ids for connections accepted off the event loop thread
#[derive(Debug, Clone, Default)]
pub struct ViewIds(Arc<AtomicU64>);

impl ViewIds {
    pub fn next(&self) -> ViewId {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Register a socket connection with the workspace and start its reader
///
/// Frames that fail to decode are logged and skipped; the view is detached
/// when the connection closes.
pub fn attach_connection(
    events: &Sender<WorkspaceEvent>,
    ids: &ViewIds,
    mut conn: ViewConnection,
) -> Result<ViewId> {
    let id = ids.next();
    let writer = conn
        .try_clone()?
        .into_writer(VIEW_QUEUE_CAPACITY, Duration::from_millis(VIEW_WRITE_TIMEOUT_MS))?;
    events
        .send(WorkspaceEvent::ViewAttached(id, Box::new(writer)))
        .map_err(|_| anyhow!("Workspace event loop is gone"))?;

    let events = events.clone();
    std::thread::Builder::new()
        .name(format!("view-{id}"))
        .spawn(move || {
            loop {
                let frame = match conn.recv_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(view = id, error = ?e, "View connection failed");
                        break;
                    }
                };
                match serde_json::from_slice::<OutboundMessage>(&frame) {
                    Ok(message) => {
                        if events.send(WorkspaceEvent::ViewMessage(id, message)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let err = WorkspaceError::Protocol(e.to_string());
                        warn!(view = id, error = %err, "Dropping malformed message");
                    }
                }
            }
            let _ = events.send(WorkspaceEvent::ViewDetached(id));
        })
        .context("Failed to spawn view reader thread")?;
    Ok(id)
}

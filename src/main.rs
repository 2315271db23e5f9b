#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use tracing::{info, warn};

use objdiff_sync::build::{BuildStatus, workspace_hash};
use objdiff_sync::config::{PreferenceStore, PropertyValue};
use objdiff_sync::constants::app::APP_DIR;
use objdiff_sync::constants::build::TASK_BUILD;
use objdiff_sync::ipc::{ViewClient, ViewServer};
use objdiff_sync::logging;
use objdiff_sync::protocol::{
    InboundMessage, NotifyLevel, ObjectData, OutboundMessage, StateDelta, UnitTarget,
    WorkspaceState,
};
use objdiff_sync::task::{self, ExecutorKind};
use objdiff_sync::workspace::{
    ViewIds, Workspace, WorkspaceEvent, WorkspaceOptions, attach_connection,
};

#[derive(Parser)]
#[command(
    name = "objdiff-sync",
    about = "Rebuild and compare decompilation units as sources change",
    version
)]
struct Cli {
    /// Workspace root (defaults to current directory)
    #[arg(long, global = true, value_name = "DIR")]
    workspace: Option<PathBuf>,

    /// trace|debug|info|warn|error (overrides LOG_LEVEL)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the workspace daemon
    Serve(ServeArgs),
    /// Build the current unit and print the result
    Build,
    /// List configured units
    Units,
    /// Choose the current unit interactively
    Pick,
    /// Select a unit by name
    Select { name: String },
    /// Clear the current unit
    Clear,
    /// Select the unit built from a source file
    Resolve { file: PathBuf },
    /// Print every state change
    Watch,
    /// Set a preference; omit the value to reset it
    Set { id: String, value: Option<String> },
    /// Show where preferences are stored
    Settings { id: Option<String> },
    /// Copy a symbol name through the daemon
    CopySymbol(CopySymbolArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, value_enum, default_value_t = ExecutorKind::Direct)]
    executor: ExecutorKind,

    /// Directory for saved state and diff output
    #[arg(long, value_name = "DIR")]
    storage_dir: Option<PathBuf>,
}

#[derive(Args)]
struct CopySymbolArgs {
    name: String,

    /// Copy this demangled name instead
    #[arg(long, value_name = "NAME")]
    demangled: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref())?;

    let root = match cli.workspace {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };
    let root = root
        .canonicalize()
        .context(format!("Workspace not found: {}", root.display()))?;

    match cli.command {
        Command::Serve(args) => serve(&root, args),
        command => run_client(&root, command),
    }
}

// ==============================================================================
// Daemon
// ==============================================================================

fn serve(root: &Path, args: ServeArgs) -> Result<()> {
    let storage_dir = match args.storage_dir {
        Some(dir) => dir,
        None => dirs::cache_dir()
            .context("Failed to determine cache directory")?
            .join(APP_DIR),
    };

    let (tx, rx) = mpsc::channel();
    let workspace = Workspace::open(
        WorkspaceOptions {
            root: root.to_path_buf(),
            storage_dir,
            executor: task::executor(args.executor, root),
            preferences: PreferenceStore::new(root),
            watch: true,
        },
        tx.clone(),
    )?;

    let server = ViewServer::bind(&workspace_hash(root))?;
    info!(socket = %server.path().display(), executor = ?args.executor, "Listening for views");

    let ids = ViewIds::default();
    let events = tx.clone();
    server.spawn_accept_loop(move |conn| {
        if let Err(e) = attach_connection(&events, &ids, conn) {
            warn!(error = ?e, "Failed to attach view");
        }
    })?;
    spawn_signal_handler(tx)?;

    workspace.run(rx);
    drop(server);
    info!("Workspace daemon stopped");
    Ok(())
}

fn spawn_signal_handler(events: Sender<WorkspaceEvent>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handlers")?;
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "Received signal");
                let _ = events.send(WorkspaceEvent::Shutdown);
            }
        })
        .context("Failed to spawn signal thread")?;
    Ok(())
}

// ==============================================================================
// Clients
// ==============================================================================

fn run_client(root: &Path, command: Command) -> Result<()> {
    let mut client = ViewClient::connect(&workspace_hash(root))
        .context("Is `objdiff-sync serve` running for this workspace?")?;

    match command {
        Command::Serve(_) => unreachable!("serve is handled by the caller"),
        Command::Build => build(&mut client),
        Command::Units => {
            let state = ready(&mut client)?;
            let config = state.project_config.ok_or_else(|| anyhow!("No configuration loaded"))?;
            let current = state.current_unit.as_ref().map(|u| u.name());
            for unit in config.units() {
                let marker = if Some(unit.name()) == current { "*" } else { " " };
                let source = unit.source_path().unwrap_or("");
                println!("{marker} {}\t{source}", unit.name());
            }
            Ok(())
        }
        Command::Pick => pick(&mut client),
        Command::Select { name } => {
            let state = ready(&mut client)?;
            let config = state.project_config.ok_or_else(|| anyhow!("No configuration loaded"))?;
            let unit = config
                .find_unit(&name)
                .ok_or_else(|| anyhow!("No unit named {name}"))?;
            select(&mut client, unit.clone())
        }
        Command::Clear => client.send(&OutboundMessage::SetCurrentUnit { unit: None }),
        Command::Resolve { file } => resolve(&mut client, &file),
        Command::Watch => watch(&mut client),
        Command::Set { id, value } => client.send(&OutboundMessage::SetConfigProperty {
            id,
            value: value.as_deref().map(parse_value),
        }),
        Command::Settings { id } => {
            ready(&mut client)?;
            client.send(&OutboundMessage::OpenSettings { id })?;
            let message = client.recv_until(|msg| match msg {
                InboundMessage::Notify { message, .. } => Some(message),
                _ => None,
            })?;
            println!("{message}");
            Ok(())
        }
        Command::CopySymbol(args) => {
            client.send(&OutboundMessage::CopySymbol {
                symbol_name: args.name,
                demangled: args.demangled.is_some(),
                demangled_name: args.demangled,
            })?;
            let text = client.recv_until(|msg| match msg {
                InboundMessage::Clipboard { text } => Some(text),
                _ => None,
            })?;
            println!("{text}");
            Ok(())
        }
    }
}

/// Announce readiness and return the snapshot
///
/// Objects arrive in frames of their own; the frame carrying
/// `buildRunning` ends the snapshot.
fn ready(client: &mut ViewClient) -> Result<WorkspaceState> {
    client.send(&OutboundMessage::Ready)?;
    let mut state = WorkspaceState::default();
    client.recv_until(|msg| match msg {
        InboundMessage::State(delta) => {
            let done = delta.build_running.is_some();
            state.apply(delta);
            done.then_some(())
        }
        _ => None,
    })?;
    Ok(state)
}

fn select(client: &mut ViewClient, unit: objdiff_sync::config::Unit) -> Result<()> {
    println!("Selected {}", unit.name());
    client.send(&OutboundMessage::SetCurrentUnit {
        unit: Some(UnitTarget::Unit(Box::new(unit))),
    })
}

fn build(client: &mut ViewClient) -> Result<()> {
    let mut state = ready(client)?;
    client.send(&OutboundMessage::RunTask {
        task_type: TASK_BUILD.to_string(),
    })?;
    let mut started = false;
    loop {
        match client.recv()? {
            InboundMessage::State(delta) => {
                let running = delta.build_running;
                state.apply(delta);
                match running {
                    Some(true) => started = true,
                    Some(false) if started => break,
                    _ => {}
                }
            }
            InboundMessage::Notify { level, message, .. } => {
                eprintln!("{message}");
                if level != NotifyLevel::Info && !started {
                    bail!("Build not started");
                }
            }
            _ => {}
        }
    }

    let mut failed = false;
    for (side, status) in [("target", &state.left_status), ("base", &state.right_status)] {
        let Some(status) = status else { continue };
        print_status(side, status);
        failed |= !status.success;
    }
    if failed {
        bail!("Build failed");
    }
    Ok(())
}

fn print_status(side: &str, status: &BuildStatus) {
    let result = if status.success { "ok" } else { "FAILED" };
    println!("{side}: {result} ({})", status.cmdline);
    if !status.success {
        for line in status.stdout.lines().chain(status.stderr.lines()) {
            println!("  {line}");
        }
    }
}

fn pick(client: &mut ViewClient) -> Result<()> {
    let state = ready(client)?;
    client.send(&OutboundMessage::QuickPickUnit)?;
    let items = client.recv_until(|msg| match msg {
        InboundMessage::QuickPick { items } => Some(Ok(items)),
        InboundMessage::Notify {
            level: NotifyLevel::Warning | NotifyLevel::Error,
            message,
            ..
        } => Some(Err(anyhow!(message))),
        _ => None,
    })??;
    if items.is_empty() {
        bail!("No units to pick from");
    }

    for (i, item) in items.iter().enumerate() {
        match &item.description {
            Some(description) => eprintln!("{:>4}  {}  ({description})", i + 1, item.label),
            None => eprintln!("{:>4}  {}", i + 1, item.label),
        }
    }
    eprint!("Unit number: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read selection")?;
    let index: usize = line.trim().parse().context("Expected a unit number")?;
    let item = index
        .checked_sub(1)
        .and_then(|i| items.get(i))
        .ok_or_else(|| anyhow!("No unit number {index}"))?;

    let config = state.project_config.ok_or_else(|| anyhow!("No configuration loaded"))?;
    let unit = config
        .find_unit(&item.label)
        .ok_or_else(|| anyhow!("No unit named {}", item.label))?;
    select(client, unit.clone())
}

fn resolve(client: &mut ViewClient, file: &Path) -> Result<()> {
    let file = file
        .canonicalize()
        .context(format!("File not found: {}", file.display()))?;
    ready(client)?;
    client.send(&OutboundMessage::ActiveEditor {
        path: Some(file.to_string_lossy().into_owned()),
    })?;
    client.send(&OutboundMessage::SetCurrentUnit {
        unit: Some(UnitTarget::source()),
    })?;
    let name = client.recv_until(|msg| match msg {
        InboundMessage::State(StateDelta {
            current_unit: Some(Some(unit)),
            ..
        }) => Some(Ok(unit.name().to_string())),
        InboundMessage::Notify {
            level: NotifyLevel::Warning | NotifyLevel::Error,
            message,
            ..
        } => Some(Err(anyhow!(message))),
        _ => None,
    })??;
    println!("Selected {name}");
    Ok(())
}

fn watch(client: &mut ViewClient) -> Result<()> {
    client.send(&OutboundMessage::Ready)?;
    loop {
        match client.recv()? {
            InboundMessage::State(delta) => println!("state {}", describe(&delta)),
            InboundMessage::Notify { level, message, .. } => println!("{level:?}: {message}"),
            InboundMessage::LineRanges { data } => println!("lineRanges {}", data.len()),
            InboundMessage::QuickPick { .. } | InboundMessage::Clipboard { .. } => {}
        }
    }
}

/// One-line summary of the fields present in a delta
fn describe(delta: &StateDelta) -> String {
    fn object(data: &Option<ObjectData>) -> String {
        match data {
            Some(data) => format!("{} bytes", data.len()),
            None => "null".to_string(),
        }
    }
    fn status(status: &Option<BuildStatus>) -> &'static str {
        match status {
            Some(s) if s.success => "ok",
            Some(_) => "failed",
            None => "null",
        }
    }

    let mut parts = Vec::new();
    if let Some(running) = delta.build_running {
        parts.push(format!("buildRunning={running}"));
    }
    if let Some(props) = &delta.config_properties {
        parts.push(format!("configProperties={}", props.len()));
    }
    if let Some(unit) = &delta.current_unit {
        let name = unit.as_ref().map(|u| u.name()).unwrap_or("null");
        parts.push(format!("currentUnit={name}"));
    }
    if let Some(s) = &delta.left_status {
        parts.push(format!("leftStatus={}", status(s)));
    }
    if let Some(s) = &delta.right_status {
        parts.push(format!("rightStatus={}", status(s)));
    }
    if let Some(o) = &delta.left_object {
        parts.push(format!("leftObject={}", object(o)));
    }
    if let Some(o) = &delta.right_object {
        parts.push(format!("rightObject={}", object(o)));
    }
    if let Some(o) = &delta.diff_result {
        parts.push(format!("diffResult={}", object(o)));
    }
    if let Some(config) = &delta.project_config {
        let units = config.as_ref().map(|c| c.units().len());
        parts.push(match units {
            Some(n) => format!("projectConfig={n} units"),
            None => "projectConfig=null".to_string(),
        });
    }
    if let Some(view_state) = &delta.view_state {
        parts.push(format!("viewState={}", view_state.len()));
    }
    parts.join(" ")
}

/// `true`/`false` and numbers keep their type; anything else is a string
fn parse_value(raw: &str) -> PropertyValue {
    match raw {
        "true" => PropertyValue::Bool(true),
        "false" => PropertyValue::Bool(false),
        _ => match serde_json::from_str::<serde_json::Number>(raw) {
            Ok(n) => PropertyValue::Number(n),
            Err(_) => PropertyValue::String(raw.to_string()),
        },
    }
}

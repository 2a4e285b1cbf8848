//! notebook-session CLI entry point.
//!
//! Joins a notebook room on a running daemon and drives it the way a
//! notebook window would.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;
use notebook_session::trust_gate::LocalTrust;
use notebook_session::{LaunchOutcome, NotebookSession, SessionConfig, SessionEvent, TrustCheck};
use runt_trust::NotebookMetadata;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "notebook-session")]
#[command(about = "Notebook window client for the runtime daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon socket path (default: from config, then RUNTIMED_SOCKET_PATH)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print session events until interrupted
    Watch { notebook_id: String },

    /// Launch a kernel and run every code cell
    RunAll { notebook_id: String },

    /// Show dependency trust and look-alike package warnings
    Trust {
        notebook_id: String,

        /// Sign the current dependencies
        #[arg(long)]
        approve: bool,

        /// Check the dependencies in this .ipynb with the local trust key
        /// instead of asking the daemon; --approve writes the signature back
        #[arg(long)]
        notebook: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut config = SessionConfig::load();
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    info!("Socket: {:?}", config.socket_path);

    match cli.command {
        Commands::Watch { notebook_id } => watch(&notebook_id, config).await,
        Commands::RunAll { notebook_id } => run_all(&notebook_id, config).await,
        Commands::Trust {
            notebook_id,
            approve,
            notebook,
        } => trust(&notebook_id, config, approve, notebook.as_deref()).await,
    }
}

/// Forward session events into a channel.
fn subscribe(session: &NotebookSession) -> mpsc::UnboundedReceiver<SessionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    session.set_listener(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::KernelStatus(status) => println!("kernel: {}", status),
        SessionEvent::ExecutionStarted {
            cell_id,
            execution_count,
        } => println!("[{}] started ({})", cell_id, execution_count),
        SessionEvent::Output { cell_id, output } => println!("[{}] {}", cell_id, output),
        SessionEvent::ExecutionDone { cell_id } => println!("[{}] done", cell_id),
        SessionEvent::KernelError { error } => eprintln!("kernel error: {}", error),
        SessionEvent::QueueChanged(entries) => {
            let ids: Vec<&str> = entries.iter().map(|e| e.cell_id.as_str()).collect();
            println!("queue: [{}]", ids.join(", "));
        }
        SessionEvent::EnvProgress(progress) => {
            println!("env {}: {}", progress.env_type, progress.phase)
        }
        SessionEvent::Disconnected => eprintln!("disconnected, reconnecting..."),
        SessionEvent::Reconnected => eprintln!("reconnected"),
        SessionEvent::ReconnectFailed { attempts } => {
            eprintln!("gave up reconnecting after {} attempts", attempts)
        }
        other => log::debug!("{:?}", other),
    }
}

fn print_trust(check: &TrustCheck) {
    println!("Trust: {:?}", check.info.status);
    for dep in check.info.all_dependencies() {
        println!("  {}", dep);
    }
    for warning in &check.typosquat_warnings {
        println!(
            "  warning: {:?} is similar to {:?}",
            warning.package, warning.similar_to
        );
    }
}

async fn watch(notebook_id: &str, config: SessionConfig) -> anyhow::Result<()> {
    let session = NotebookSession::connect(notebook_id, config).await?;
    let mut events = subscribe(&session);
    println!(
        "Watching {} ({} cells, kernel {})",
        notebook_id,
        session.cells().len(),
        session.kernel_status()
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::ReconnectFailed { attempts }) => {
                    bail!("daemon unreachable after {} attempts", attempts)
                }
                Some(event) => print_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close();
    Ok(())
}

async fn run_all(notebook_id: &str, config: SessionConfig) -> anyhow::Result<()> {
    let session = NotebookSession::connect(notebook_id, config).await?;
    let mut events = subscribe(&session);

    match session.launch_kernel().await? {
        LaunchOutcome::AwaitingApproval(check) => {
            print_trust(&check);
            bail!("notebook dependencies are not trusted; run `notebook-session trust {} --approve`", notebook_id);
        }
        outcome => info!("{:?}", outcome),
    }

    let mut remaining: HashSet<String> = session.run_all().await?.into_iter().collect();
    println!("Running {} cells", remaining.len());

    while !remaining.is_empty() {
        match events.recv().await {
            Some(SessionEvent::ExecutionDone { cell_id }) => {
                println!("[{}] done", cell_id);
                remaining.remove(&cell_id);
            }
            Some(SessionEvent::ReconnectFailed { attempts }) => {
                bail!("daemon unreachable after {} attempts", attempts)
            }
            Some(event) => print_event(&event),
            None => break,
        }
    }

    session.close();
    Ok(())
}

fn read_ipynb(path: &Path) -> anyhow::Result<Value> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

fn notebook_metadata(path: &Path) -> anyhow::Result<NotebookMetadata> {
    match read_ipynb(path)?.get("metadata") {
        Some(metadata) => Ok(serde_json::from_value(metadata.clone())?),
        None => Ok(NotebookMetadata::new()),
    }
}

fn write_notebook_metadata(path: &Path, metadata: &NotebookMetadata) -> anyhow::Result<()> {
    let mut notebook = read_ipynb(path)?;
    let Some(fields) = notebook.as_object_mut() else {
        bail!("{} is not a notebook", path.display());
    };
    fields.insert("metadata".into(), serde_json::to_value(metadata)?);
    std::fs::write(path, serde_json::to_string_pretty(&notebook)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

async fn trust(
    notebook_id: &str,
    config: SessionConfig,
    approve: bool,
    notebook: Option<&Path>,
) -> anyhow::Result<()> {
    let local = match notebook {
        Some(path) => {
            let backend = LocalTrust::from_config(&config, notebook_metadata(path)?)?;
            info!("Checking {} with the local trust key", path.display());
            Some(Arc::new(backend))
        }
        None => None,
    };

    let mut builder = NotebookSession::builder(notebook_id, config);
    if let Some(backend) = &local {
        builder = builder.trust_backend(backend.clone());
    }
    let session = builder.connect().await?;

    let check = session.check_trust().await?;
    print_trust(&check);

    if approve && !check.allows_launch() {
        session.approve_trust().await?;
        if let (Some(backend), Some(path)) = (&local, notebook) {
            write_notebook_metadata(path, &backend.metadata())?;
        }
        let check = session.check_trust().await?;
        println!();
        println!("Approved.");
        print_trust(&check);
    }

    session.close();
    Ok(())
}

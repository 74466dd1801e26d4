use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::compilation::{CompilationCoordinator, CompilationEvent};
use crate::compiler::ScriptCompiler;
use crate::config::{SessionConfig, Settings};
use crate::machine::ScriptMachineFactory;
use crate::session::{Notification, NotificationSink, Session, SessionEvent};
use crate::types::{CompilationTask, ExecutionState, VariableSnapshot};

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "Stepwise - compile, run and step through scripts", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile scripts and report diagnostics
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Entry script (defaults to the first file)
        #[arg(long)]
        main: Option<String>,
    },

    /// Compile and run scripts
    Run {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Entry script (defaults to the first file)
        #[arg(long)]
        main: Option<String>,
    },

    /// Run scripts under the debugger, reading commands from stdin
    Debug {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Entry script (defaults to the first file)
        #[arg(long)]
        main: Option<String>,

        /// Initial breakpoints
        #[arg(long = "break", value_name = "FILE:LINE")]
        breakpoints: Vec<String>,
    },
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

/// Run the CLI with provided arguments
pub async fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli).await
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    let mut builder = Settings::builder();
    if let Some(path) = &cli.config {
        builder = builder.config_path(path);
    }
    let settings = builder.build()?;
    init_tracing(&settings.logging.filter);
    let config = settings.session_config();

    match cli.command {
        Commands::Check { files, main } => check(&config, &files, main).await,
        Commands::Run { files, main } => run(&config, &files, main).await,
        Commands::Debug {
            files,
            main,
            breakpoints,
        } => debug(&config, &files, main, &breakpoints).await,
    }
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // Already installed when embedded in another binary.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/* ===================== Commands ===================== */

async fn check(config: &SessionConfig, files: &[PathBuf], main: Option<String>) -> Result<()> {
    let buffers = read_buffers(files)?;
    let main = main_name(&buffers, main)?;
    let sources = buffers.into_iter().collect();

    let (coordinator, mut events) =
        CompilationCoordinator::new(Arc::new(ScriptCompiler::new()), config.compile_timeout);
    coordinator.compile(CompilationTask::new(1, sources, main));

    match events.recv().await {
        Some(CompilationEvent::RevisionAvailable(_)) => {}
        Some(CompilationEvent::TimedOut { after, .. }) => bail!("compilation timed out after {:?}", after),
        _ => bail!("compilation produced no result"),
    }

    let result = coordinator
        .result()
        .ok_or_else(|| anyhow!("compilation produced no result"))?;
    if result.succeeded() {
        println!("✓ {} script(s) compiled", files.len());
        return Ok(());
    }

    for diagnostic in result.diagnostics() {
        println!("{}", diagnostic);
    }
    bail!("{} error(s)", result.diagnostics().len())
}

async fn run(config: &SessionConfig, files: &[PathBuf], main: Option<String>) -> Result<()> {
    let mut session = open_session(config, files, main)?;
    let mut events = session.subscribe();

    session.run_script()?;
    session.settle().await;

    let failed = report_events(&mut events);
    print_variables(&session.variables());
    if failed {
        bail!("run failed");
    }
    Ok(())
}

async fn debug(
    config: &SessionConfig,
    files: &[PathBuf],
    main: Option<String>,
    breakpoints: &[String],
) -> Result<()> {
    let mut session = open_session(config, files, main)?;
    for spec in breakpoints {
        let (file, line) = parse_location(spec)?;
        session.set_break_point_at(&file, line);
    }
    let mut events = session.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    session.run_script_in_debug_mode()?;
    let mut failed = false;

    loop {
        let state = session.settle().await;
        failed |= report_events(&mut events);
        if state == ExecutionState::Idle {
            break;
        }

        let Some(line) = stdin.next_line().await? else {
            session.stop();
            continue;
        };
        match line.trim().split_once(' ').unwrap_or((line.trim(), "")) {
            ("c", _) => {
                session.step_next_breakpoint();
            }
            ("s", _) => {
                session.step_next_possible_breakpoint();
            }
            ("b", location) => match parse_location(location) {
                Ok((file, line)) => {
                    session.set_break_point_at(&file, line);
                }
                Err(err) => eprintln!("{}", err),
            },
            ("d", location) => match parse_location(location) {
                Ok((file, line)) => {
                    session.delete_break_point_at(&file, line);
                }
                Err(err) => eprintln!("{}", err),
            },
            ("v", _) => print_variables(&session.variables()),
            ("q", _) => {
                session.stop();
            }
            ("", _) => {}
            (other, _) => eprintln!("Unknown command '{}'. Use c, s, b FILE:LINE, d FILE:LINE, v or q", other),
        }
    }

    print_variables(&session.variables());
    if failed {
        bail!("debug session failed");
    }
    Ok(())
}

/* ===================== Helpers ===================== */

/// Prints notifications for the person at the terminal.
struct ConsoleSink;

impl NotificationSink for ConsoleSink {
    fn notify(&self, notification: Notification) {
        eprintln!("{}", notification);
    }
}

fn read_buffers(files: &[PathBuf]) -> Result<Vec<(String, String)>> {
    files
        .iter()
        .map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| anyhow!("'{}' is not a file", path.display()))?;
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok((name, text))
        })
        .collect()
}

fn main_name(buffers: &[(String, String)], main: Option<String>) -> Result<String> {
    match main {
        Some(main) => Ok(main),
        None => buffers
            .first()
            .map(|(name, _)| name.clone())
            .ok_or_else(|| anyhow!("no script given")),
    }
}

fn open_session(config: &SessionConfig, files: &[PathBuf], main: Option<String>) -> Result<Session> {
    let buffers = read_buffers(files)?;
    let main = main_name(&buffers, main)?;

    let mut session = Session::new(
        config,
        Arc::new(ScriptCompiler::new()),
        Arc::new(ScriptMachineFactory::new(config.max_call_depth)),
        Arc::new(ConsoleSink),
    );
    for (name, text) in buffers {
        session.open_buffer(&name, text)?;
    }
    session.set_main(&main)?;
    Ok(session)
}

fn parse_location(spec: &str) -> Result<(String, u32)> {
    let (file, line) = spec
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected FILE:LINE, got '{}'", spec))?;
    let line = line
        .parse()
        .with_context(|| format!("invalid line number in '{}'", spec))?;
    Ok((file.to_string(), line))
}

/// Print program output and pause locations. Returns true if a notification was seen.
fn report_events(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> bool {
    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Output(lines) => {
                for line in lines {
                    println!("{}", line);
                }
            }
            SessionEvent::Paused(Some(location)) => println!("-- halted at {}", location),
            SessionEvent::Paused(None) => println!("-- halted"),
            SessionEvent::Notified(_) => failed = true,
            SessionEvent::StateChanged(_) | SessionEvent::VariablesChanged(_) => {}
        }
    }
    failed
}

fn print_variables(variables: &VariableSnapshot) {
    if variables.is_empty() {
        println!("  (no variables)");
    }
    for (name, value) in variables {
        println!("  {} = {}", name, value);
    }
}

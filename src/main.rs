mod config;
mod control;
#[cfg(unix)]
mod local;
mod logging;
mod paths;
mod stop;
mod supervisor;
#[cfg(windows)]
mod svc;
#[cfg(windows)]
mod win;

use clap::{Parser, Subcommand};
use config::TraywatchConfig;
use paths::DataDir;
use std::path::PathBuf;
use std::sync::Arc;
use stop::StopSignal;

/// Privileged supervisor that keeps the helpdesk tray agent running in the
/// active desktop session: launches it as the interactive user, restarts it
/// on crash, and follows logon/logoff.
///
/// With no subcommand the process runs as the system service.
#[derive(Parser, Debug)]
#[command(name = "traywatch", version, about)]
struct Cli {
    /// Config file path (default: traywatch.toml next to the executable)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor in the foreground with console logging
    Debug,
    /// Register the service (auto-start on boot, crash recovery policy)
    Install,
    /// Remove the service
    Uninstall,
    /// Start the service
    Start,
    /// Stop the service
    Stop,
    /// Restart the service
    Restart,
    /// Show the native service status
    Status,
}

fn main() {
    let cli = Cli::parse();
    if let Err(message) = run(cli) {
        eprintln!("{message}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let config_path = match cli.config {
        Some(path) => path,
        None => paths::default_config_path()
            .map_err(|e| format!("failed to locate config: {e}"))?,
    };
    let config = config::load(&config_path).map_err(|e| e.to_string())?;

    match cli.command {
        None => run_service(config),
        Some(Command::Debug) => run_debug(config),
        Some(Command::Install) => {
            let exe = std::env::current_exe()
                .map_err(|e| format!("failed to locate supervisor executable: {e}"))?;
            control::install(&config.service, &exe)
        }
        Some(Command::Uninstall) => control::uninstall(&config.service),
        Some(Command::Start) => control::start(&config.service),
        Some(Command::Stop) => control::stop(&config.service),
        Some(Command::Restart) => control::restart(&config.service),
        Some(Command::Status) => control::status(&config.service),
    }
}

/// Prepare the data dir, singleton lock, and log sink shared by service and
/// debug modes. The lock is held for the life of the process.
fn init_runtime(
    config: &TraywatchConfig,
    echo_stderr: bool,
) -> Result<paths::SingletonLock, String> {
    let data_dir = DataDir::resolve(&config.log);
    data_dir
        .init()
        .map_err(|e| format!("failed to create {}: {e}", data_dir.root().display()))?;
    let lock = paths::SingletonLock::acquire(&data_dir.lock_file())?;

    let writer = logging::LogWriter::open(
        &data_dir.log_file(),
        config.log.max_bytes,
        config.log.backup_count,
    )
    .map_err(|e| format!("failed to open log {}: {e}", data_dir.log_file().display()))?;
    logging::init(&config.log.level, Some(writer), echo_stderr);

    Ok(lock)
}

#[cfg(windows)]
fn run_service(config: TraywatchConfig) -> Result<(), String> {
    let _lock = init_runtime(&config, false)?;
    svc::run(config)
}

#[cfg(not(windows))]
fn run_service(_config: TraywatchConfig) -> Result<(), String> {
    Err("service mode requires Windows; use `traywatch debug` to run in the foreground"
        .to_string())
}

fn run_debug(config: TraywatchConfig) -> Result<(), String> {
    let _lock = init_runtime(&config, true)?;

    let stop = Arc::new(StopSignal::new());
    install_stop_handler(Arc::clone(&stop))?;

    let executable = paths::agent_executable(&config.agent)?;
    let tunables = config.supervisor.tunables();

    #[cfg(windows)]
    supervisor::Supervisor::new(
        win::WtsSessionResolver,
        win::TokenLauncher,
        stop,
        executable,
        tunables,
    )
    .run();

    #[cfg(unix)]
    supervisor::Supervisor::new(
        local::CurrentSessionResolver,
        local::LocalLauncher,
        stop,
        executable,
        tunables,
    )
    .run();

    Ok(())
}

#[cfg(unix)]
fn install_stop_handler(stop: Arc<StopSignal>) -> Result<(), String> {
    use signal_hook::consts::{SIGINT, SIGTERM};

    let mut signals = signal_hook::iterator::Signals::new([SIGINT, SIGTERM])
        .map_err(|e| format!("failed to install signal handler: {e}"))?;
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            stop.set();
        }
    });
    Ok(())
}

#[cfg(windows)]
fn install_stop_handler(stop: Arc<StopSignal>) -> Result<(), String> {
    use std::sync::OnceLock;
    use windows::Win32::Foundation::{BOOL, TRUE};
    use windows::Win32::System::Console::SetConsoleCtrlHandler;

    static CONSOLE_STOP: OnceLock<Arc<StopSignal>> = OnceLock::new();

    unsafe extern "system" fn console_handler(_ctrl_type: u32) -> BOOL {
        if let Some(stop) = CONSOLE_STOP.get() {
            stop.set();
        }
        TRUE
    }

    CONSOLE_STOP
        .set(stop)
        .map_err(|_| "console handler already installed".to_string())?;
    unsafe { SetConsoleCtrlHandler(Some(console_handler), true) }
        .map_err(|e| format!("failed to install console handler: {e}"))
}

/// Well-known filesystem locations: the install directory (next to the
/// supervisor executable), the machine data directory for the log and the
/// singleton lock, and agent executable resolution.
use crate::config::{AgentConfig, LogConfig};
use fs2::FileExt;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Folder name under the machine data root.
const PRODUCT_DIR: &str = "TrayWatch";

/// Directory containing the supervisor executable. The agent ships in the
/// same directory.
pub fn install_dir() -> io::Result<PathBuf> {
    let exe = env::current_exe()?;
    Ok(exe
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf())
}

/// Default config file location: traywatch.toml next to the executable.
pub fn default_config_path() -> io::Result<PathBuf> {
    Ok(install_dir()?.join("traywatch.toml"))
}

/// Resolve the agent executable from config: absolute paths are taken
/// as-is, names are looked up in the install directory. The executable must
/// exist; there is nothing to supervise otherwise.
pub fn agent_executable(agent: &AgentConfig) -> Result<PathBuf, String> {
    let configured = Path::new(&agent.executable);
    let path = if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        install_dir()
            .map_err(|e| format!("failed to locate install directory: {e}"))?
            .join(configured)
    };
    if !path.exists() {
        return Err(format!("agent executable not found: {}", path.display()));
    }
    Ok(path)
}

/// The data directory holding the supervisor log and the singleton lock.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve from config: an explicit `[log] dir` wins, otherwise the
    /// machine default (%ProgramData%\TrayWatch on Windows, the user-local
    /// data dir elsewhere).
    pub fn resolve(log: &LogConfig) -> Self {
        match &log.dir {
            Some(dir) => Self::new(dir.clone()),
            None => Self::new(default_root()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("supervisor.log")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("lock")
    }

    pub fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }
}

#[cfg(windows)]
fn default_root() -> PathBuf {
    let program_data = env::var_os("ProgramData")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("C:\\ProgramData"));
    program_data.join(PRODUCT_DIR)
}

#[cfg(not(windows))]
fn default_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join(PRODUCT_DIR.to_ascii_lowercase())
}

/// Exclusive advisory lock held for the life of the process so two
/// supervisors never track the same agent.
#[derive(Debug)]
pub struct SingletonLock {
    _file: fs::File,
}

impl SingletonLock {
    pub fn acquire(path: &Path) -> Result<Self, String> {
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| format!("failed to open lock file {}: {e}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { _file: file }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err("another supervisor instance is already running".to_string())
            }
            Err(e) => Err(format!("failed to lock {}: {e}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_accessors() {
        let dir = DataDir::new("/srv/traywatch");
        assert_eq!(dir.root(), Path::new("/srv/traywatch"));
        assert_eq!(dir.log_file(), PathBuf::from("/srv/traywatch/supervisor.log"));
        assert_eq!(dir.lock_file(), PathBuf::from("/srv/traywatch/lock"));
    }

    #[test]
    fn test_resolve_prefers_configured_dir() {
        let log = LogConfig {
            dir: Some(PathBuf::from("/custom/logs")),
            ..LogConfig::default()
        };
        let dir = DataDir::resolve(&log);
        assert_eq!(dir.root(), Path::new("/custom/logs"));
    }

    #[test]
    fn test_resolve_falls_back_to_machine_default() {
        let dir = DataDir::resolve(&LogConfig::default());
        assert!(dir.root().ends_with(PRODUCT_DIR.to_ascii_lowercase()) || cfg!(windows));
    }

    #[test]
    fn test_agent_executable_absolute_path() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = tmp.path().join("helpdesk-agent");
        fs::write(&exe, b"").unwrap();

        let agent = AgentConfig {
            executable: exe.to_string_lossy().into_owned(),
        };
        assert_eq!(agent_executable(&agent).unwrap(), exe);
    }

    #[test]
    fn test_agent_executable_missing_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = AgentConfig {
            executable: tmp
                .path()
                .join("not-there")
                .to_string_lossy()
                .into_owned(),
        };
        let err = agent_executable(&agent).unwrap_err();
        assert!(err.contains("agent executable not found"));
    }

    #[test]
    fn test_singleton_lock_rejects_second_holder() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lock");

        let held = SingletonLock::acquire(&path).unwrap();
        let err = SingletonLock::acquire(&path).unwrap_err();
        assert!(err.contains("already running"));

        drop(held);
        SingletonLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_init_creates_nested_root() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::new(tmp.path().join("a/b/c"));
        dir.init().unwrap();
        assert!(dir.root().is_dir());
    }
}

/// Log sink: leveled, timestamped lines into a size-rotated local file.
///
/// Rotation follows the classic rotating-handler scheme: when the live file
/// would exceed `max_bytes`, backups shift (`supervisor.log.1` becomes
/// `.2`, and so on, the oldest dropped) and the live file starts empty.
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub struct RollingFile {
    path: PathBuf,
    max_bytes: u64,
    backup_count: usize,
    file: File,
    len: u64,
}

impl RollingFile {
    pub fn open(path: &Path, max_bytes: u64, backup_count: usize) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            max_bytes,
            backup_count,
            file,
            len,
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    /// Shift backups up by one, move the live file to `.1`, and reopen an
    /// empty live file. With no backups configured the live file is simply
    /// truncated.
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.backup_count == 0 {
            self.file = File::create(&self.path)?;
            self.len = 0;
            return Ok(());
        }

        let _ = std::fs::remove_file(self.backup_path(self.backup_count));
        for index in (1..self.backup_count).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                std::fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        std::fs::rename(&self.path, self.backup_path(1))?;

        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.len = 0;
        Ok(())
    }
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.len > 0 && self.len + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.len += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Cloneable writer handle handed to the tracing subscriber. Each log line
/// takes the lock for one write, so lines from the control-handler thread
/// and the loop never interleave.
#[derive(Clone)]
pub struct LogWriter {
    inner: Arc<Mutex<RollingFile>>,
}

impl LogWriter {
    pub fn open(path: &Path, max_bytes: u64, backup_count: usize) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingFile::open(path, max_bytes, backup_count)?)),
        })
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut file = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        file.flush()
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured
/// level. The file layer is plain text without ANSI codes; `echo_stderr`
/// additionally mirrors everything to the console for foreground runs.
pub fn init(level: &str, file: Option<LogWriter>, echo_stderr: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let file_layer = file.map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(move || writer.clone())
    });
    let stderr_layer = echo_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_line(file: &mut RollingFile, fill: u8, len: usize) {
        let mut line = vec![fill; len];
        line.push(b'\n');
        file.write_all(&line).unwrap();
    }

    #[test]
    fn test_no_rotation_below_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("supervisor.log");
        let mut file = RollingFile::open(&path, 1024, 3).unwrap();

        write_line(&mut file, b'a', 10);
        write_line(&mut file, b'b', 10);
        file.flush().unwrap();

        assert!(path.exists());
        assert!(!file.backup_path(1).exists());
    }

    #[test]
    fn test_rotation_shifts_backups() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("supervisor.log");
        let mut file = RollingFile::open(&path, 64, 3).unwrap();

        // Each write fits the limit on its own; together they force two
        // rotations.
        write_line(&mut file, b'a', 50);
        write_line(&mut file, b'b', 50);
        write_line(&mut file, b'c', 50);
        file.flush().unwrap();

        let live = std::fs::read_to_string(&path).unwrap();
        let one = std::fs::read_to_string(file.backup_path(1)).unwrap();
        let two = std::fs::read_to_string(file.backup_path(2)).unwrap();
        assert!(live.starts_with('c'));
        assert!(one.starts_with('b'));
        assert!(two.starts_with('a'));
    }

    #[test]
    fn test_backup_count_is_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("supervisor.log");
        let mut file = RollingFile::open(&path, 16, 2).unwrap();

        for fill in [b'a', b'b', b'c', b'd', b'e'] {
            write_line(&mut file, fill, 12);
        }
        file.flush().unwrap();

        assert!(file.backup_path(1).exists());
        assert!(file.backup_path(2).exists());
        assert!(!file.backup_path(3).exists());
    }

    #[test]
    fn test_zero_backups_truncates_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("supervisor.log");
        let mut file = RollingFile::open(&path, 16, 0).unwrap();

        write_line(&mut file, b'a', 12);
        write_line(&mut file, b'b', 12);
        file.flush().unwrap();

        let live = std::fs::read_to_string(&path).unwrap();
        assert!(live.starts_with('b'));
        assert!(!file.backup_path(1).exists());
    }

    #[test]
    fn test_reopen_continues_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("supervisor.log");

        {
            let mut file = RollingFile::open(&path, 1024, 1).unwrap();
            write_line(&mut file, b'a', 10);
        }
        let mut file = RollingFile::open(&path, 1024, 1).unwrap();
        assert_eq!(file.len, 11);
        write_line(&mut file, b'b', 10);
        file.flush().unwrap();

        let live = std::fs::read_to_string(&path).unwrap();
        assert_eq!(live.lines().count(), 2);
    }

    #[test]
    fn test_log_writer_is_shareable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("supervisor.log");
        let writer = LogWriter::open(&path, 1024, 1).unwrap();

        let mut a = writer.clone();
        let mut b = writer;
        a.write_all(b"from a\n").unwrap();
        b.write_all(b"from b\n").unwrap();
        b.flush().unwrap();

        let live = std::fs::read_to_string(&path).unwrap();
        assert!(live.contains("from a"));
        assert!(live.contains("from b"));
    }
}

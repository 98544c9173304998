pub mod mcp_client;

use std::path::{Path, PathBuf};

pub use mcp_client::{McpClient, McpError};

/// Return the platform-standard data directory for toolmesh.
///
/// - macOS: `~/Library/Application Support/toolmesh/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolmesh\`
/// - Linux: `$XDG_DATA_HOME/toolmesh/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.toolmesh/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolmesh");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolmesh")
}

/// Initialize the tracing subscriber.
///
/// With `log_dir`, logs go to `toolmesh.log` in that directory: existing logs
/// are rotated (keeps last 3) and every line is flushed as it is written.
/// Without it, logs go to stderr so stdout stays clean for command output.
///
/// Returns the log file path when logging to a file.
pub fn init_tracing(log_dir: Option<&Path>) -> std::io::Result<Option<PathBuf>> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolmesh=info,warn"));

    let Some(log_dir) = log_dir else {
        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .try_init()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("toolmesh.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== toolmesh starting ==="
    );
    Ok(Some(log_path))
}

/// Rotate log files: `toolmesh.log` → `toolmesh.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so a
/// crashed run still leaves its last lines on disk.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rotate_log_file_keeps_last_three() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("toolmesh.log");
        for generation in 0..5 {
            std::fs::write(&base, format!("run {generation}")).unwrap();
            rotate_log_file(&base, 3);
        }

        assert!(!base.exists());
        let newest = std::fs::read_to_string(dir.path().join("toolmesh.log.1")).unwrap();
        assert_eq!(newest, "run 4");
        let oldest = std::fs::read_to_string(dir.path().join("toolmesh.log.3")).unwrap();
        assert_eq!(oldest, "run 2");
        assert!(!dir.path().join("toolmesh.log.4").exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn test_init_tracing_writes_plain_lines_to_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("toolmesh.log"), "previous run\n").unwrap();

        let path = init_tracing(Some(dir.path())).unwrap().unwrap();
        tracing::warn!(server = "fs", "spawn failed");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("spawn failed"));
        assert!(contents.contains("server=\"fs\""));
        assert!(!contents.contains("\x1b["), "file output must not carry ANSI codes");
        let rotated = std::fs::read_to_string(dir.path().join("toolmesh.log.1")).unwrap();
        assert_eq!(rotated, "previous run\n");
    }

    #[test]
    fn test_data_dir_is_namespaced() {
        let dir = data_dir();
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name == "toolmesh" || name == ".toolmesh");
    }
}

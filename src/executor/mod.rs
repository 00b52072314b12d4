//! Sandboxed script executor.
//!
//! A command name resolves to an allow-listed `<base_dir>/<name>.sh`. The
//! script runs with a fixed working directory, the sender's identity in one
//! extra environment variable, and a hard wall-clock timeout. Standard output
//! and standard error are captured into one stream which is returned whether
//! or not the script succeeded.

pub mod catalog;
pub mod process_group;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::config::ExecutorConfig;

pub use catalog::{is_safe_command_name, ScriptCatalog};

/// How long output readers may keep draining after the child is gone.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Spawn attempts when the script is momentarily busy (ETXTBSY).
const SPAWN_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("command not found: {0}")]
    NotFound(String),

    #[error("permission denied: {} is not executable (mode {mode:o})", .path.display())]
    PermissionDenied { path: PathBuf, mode: u32 },

    #[error("command timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("command failed: {status}")]
    ExecutionFailed { status: ExitStatus },

    #[error("failed to run {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of one bounded script run.
#[derive(Debug)]
pub struct Execution {
    /// Combined stdout and stderr, possibly partial on timeout.
    pub output: Vec<u8>,
    pub result: Result<(), ExecError>,
}

impl Execution {
    fn failed(err: ExecError) -> Self {
        Self {
            output: Vec::new(),
            result: Err(err),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Output followed by an error line when the run failed.
    pub fn render(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.output).into_owned();
        if let Err(e) = &self.result {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!("error: {}", e));
        }
        text
    }
}

/// Runs allow-listed scripts from a single flat directory.
#[derive(Debug, Clone)]
pub struct Executor {
    catalog: ScriptCatalog,
    timeout: Duration,
    sender_env: String,
}

impl Executor {
    /// Build the allow-list from `base_dir`.
    pub fn new(base_dir: &Path, timeout: Duration, sender_env: &str) -> std::io::Result<Self> {
        Ok(Self {
            catalog: ScriptCatalog::scan(base_dir)?,
            timeout,
            sender_env: sender_env.to_string(),
        })
    }

    pub fn from_config(config: &ExecutorConfig) -> crate::error::Result<Self> {
        let base_dir = config.base_dir()?;
        Ok(Self::new(&base_dir, config.timeout(), &config.sender_env)?)
    }

    pub fn catalog(&self) -> &ScriptCatalog {
        &self.catalog
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `command` once with `args`, on behalf of `sender`.
    pub async fn execute(&self, command: &str, args: &[String], sender: &str) -> Execution {
        let path = match self.catalog.resolve(command) {
            Some(path) => path.to_path_buf(),
            None => return Execution::failed(ExecError::NotFound(command.to_string())),
        };

        if let Err(e) = check_executable(&path, command).await {
            return Execution::failed(e);
        }

        tracing::info!("Running {} {:?} for {}", path.display(), args, sender);

        let mut child = match self.spawn(&path, args, sender).await {
            Ok(child) => child,
            Err(e) => return Execution::failed(e),
        };

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, Arc::clone(&buffer))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, Arc::clone(&buffer))));
        }

        let result = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(ExecError::ExecutionFailed { status }),
            Ok(Err(source)) => Err(ExecError::Spawn {
                path: path.clone(),
                source,
            }),
            Err(_) => {
                tracing::warn!(
                    "{} exceeded {:?}, killing its process group",
                    path.display(),
                    self.timeout
                );
                if let Err(e) = process_group::kill_child_process_group(&child) {
                    tracing::warn!("Failed to kill process group of {}: {}", path.display(), e);
                }
                if let Err(e) = child.kill().await {
                    tracing::debug!("Child kill after timeout: {}", e);
                }
                Err(ExecError::Timeout(self.timeout))
            }
        };

        for mut reader in readers {
            if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
                reader.abort();
            }
        }

        let output = match buffer.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        match &result {
            Ok(()) => tracing::debug!("{} finished, {} bytes of output", command, output.len()),
            Err(e) => tracing::warn!("{} failed: {}", command, e),
        }

        Execution { output, result }
    }

    async fn spawn(&self, path: &Path, args: &[String], sender: &str) -> Result<Child, ExecError> {
        let mut attempt = 1;
        loop {
            match self.command(path, args, sender, false).spawn() {
                Ok(child) => return Ok(child),
                Err(e) if is_errno(&e, libc::ENOEXEC) => {
                    // No shebang: let the shell interpret it.
                    return self
                        .command(path, args, sender, true)
                        .spawn()
                        .map_err(|source| spawn_error(path, command_name(path), source));
                }
                Err(e) if is_errno(&e, libc::ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(source) => return Err(spawn_error(path, command_name(path), source)),
            }
        }
    }

    fn command(&self, path: &Path, args: &[String], sender: &str, via_shell: bool) -> Command {
        let mut cmd = if via_shell {
            let mut cmd = std::process::Command::new("/bin/sh");
            cmd.arg(path);
            cmd
        } else {
            std::process::Command::new(path)
        };
        cmd.args(args)
            .current_dir(self.catalog.base_dir())
            .env(&self.sender_env, sender)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut cmd = Command::from(cmd);
        cmd.kill_on_drop(true);
        cmd
    }
}

async fn check_executable(path: &Path, command: &str) -> Result<(), ExecError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ExecError::NotFound(command.to_string()));
        }
        Err(source) => {
            return Err(ExecError::Spawn {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode() & 0o7777;
        if mode & 0o111 == 0 {
            return Err(ExecError::PermissionDenied {
                path: path.to_path_buf(),
                mode,
            });
        }
    }
    #[cfg(not(unix))]
    let _ = meta;

    Ok(())
}

fn command_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn spawn_error(path: &Path, command: String, source: std::io::Error) -> ExecError {
    match source.kind() {
        std::io::ErrorKind::NotFound => ExecError::NotFound(command),
        std::io::ErrorKind::PermissionDenied => ExecError::PermissionDenied {
            path: path.to_path_buf(),
            mode: 0,
        },
        _ => ExecError::Spawn {
            path: path.to_path_buf(),
            source,
        },
    }
}

fn is_errno(err: &std::io::Error, errno: i32) -> bool {
    err.raw_os_error() == Some(errno)
}

/// Copy a child stream into the shared buffer, mirroring it to our stdout.
async fn pump<R: AsyncRead + Unpin>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if let Ok(mut guard) = buffer.lock() {
                    guard.extend_from_slice(&chunk[..n]);
                }
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(&chunk[..n]);
                let _ = stdout.flush();
            }
            Err(e) => {
                tracing::debug!("Output stream closed: {}", e);
                break;
            }
        }
    }
}

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::paths::normalize_output_dir;
use super::progress::{FormatClass, ProgressEstimator, ProgressModel};
use super::{ConversionOutput, ConversionRequest, ConversionTool, ProgressFn};
use crate::config::ToolConfig;
use crate::error::BridgeError;

/// Drives the export script through a scripting host.
///
/// Command line: `<interpreter> <interpreter_args..> <script> <input>
/// <output_dir> <format> <control_dir>`. Exit code 0 means the script
/// believes the export succeeded; the expected output file
/// `<output_dir>/<input stem>.<format>` is then checked on disk.
pub struct ScriptBridge {
    config: ToolConfig,
}

impl ScriptBridge {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    /// First existing `script_name` among the configured script directories.
    pub fn find_script(&self) -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = self
            .config
            .script_dirs
            .iter()
            .map(|dir| dir.join(&self.config.script_name))
            .collect();

        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
        {
            candidates.push(exe_dir.join("scripts").join(&self.config.script_name));
        }

        candidates.into_iter().find(|p| p.is_file())
    }

    fn check_platform(&self) -> Result<(), BridgeError> {
        if self.config.require_windows && !cfg!(windows) {
            return Err(BridgeError::ToolUnavailable(
                "the export tool is only available on Windows hosts".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reads one of the child's pipes in the background.
///
/// Bytes land in a shared buffer as they arrive so that a pipe held open by
/// a grandchild still yields whatever was written before the child exited.
struct OutputCollector {
    captured: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl OutputCollector {
    fn spawn<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        let task = tokio::spawn(async move {
            let Some(mut reader) = reader else {
                return;
            };
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut buf) = sink.lock() {
                            buf.extend_from_slice(&chunk[..n]);
                        }
                    }
                }
            }
        });
        Self { captured, task }
    }

    /// Waits at most `grace` for the pipe to close, then returns what was read.
    async fn finish(mut self, grace: Duration) -> String {
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            debug!("Tool output still open after exit; keeping what was captured");
            self.task.abort();
        }
        let bytes = self
            .captured
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

async fn drain(
    stdout: OutputCollector,
    stderr: OutputCollector,
    grace: Duration,
) -> (String, String) {
    tokio::join!(stdout.finish(grace), stderr.finish(grace))
}

/// Keeps the first `limit` characters of the trimmed text.
fn truncate_chars(text: &str, limit: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Prefers stderr, falling back to stdout when stderr is empty.
fn diagnostics(stdout: &str, stderr: &str, limit: usize) -> String {
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    truncate_chars(source, limit)
}

fn expected_artifact(output_dir: &str, input: &Path, format: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Path::new(output_dir).join(format!("{}.{}", stem, format))
}

#[async_trait]
impl ConversionTool for ScriptBridge {
    async fn run(
        &self,
        request: &ConversionRequest,
        on_progress: &ProgressFn,
    ) -> Result<ConversionOutput, BridgeError> {
        self.check_platform()?;

        let script = self.find_script().ok_or_else(|| {
            BridgeError::ToolUnavailable(format!(
                "export script '{}' not found in {:?}",
                self.config.script_name, self.config.script_dirs
            ))
        })?;

        if !request.input.is_file() {
            return Err(BridgeError::InputNotFound {
                path: request.input.clone(),
            });
        }

        let output_dir = normalize_output_dir(&request.output_dir);
        let format = request.format.trim().to_lowercase();
        let control_dir = &self.config.control_dir;
        if let Err(e) = tokio::fs::create_dir_all(control_dir).await {
            warn!(dir = %control_dir.display(), error = %e, "Could not create control directory");
        }

        info!(
            job_id = %request.job_id,
            format = %format,
            input = %request.input.display(),
            output_dir = %output_dir,
            "Launching export tool"
        );

        let mut command = Command::new(&self.config.interpreter);
        command
            .args(&self.config.interpreter_args)
            .arg(&script)
            .arg(&request.input)
            .arg(&output_dir)
            .arg(&format)
            .arg(control_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = script.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(BridgeError::Spawn)?;
        let stdout = OutputCollector::spawn(child.stdout.take());
        let stderr = OutputCollector::spawn(child.stderr.take());
        let grace = self.config.output_grace();

        let class = if request.heavy {
            FormatClass::Heavy
        } else {
            FormatClass::Standard
        };
        let mut estimator =
            ProgressEstimator::new(ProgressModel::for_class(class, self.config.progress_ceiling));
        let started = Instant::now();
        let deadline = tokio::time::sleep(self.config.timeout());
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.config.progress_interval());

        let status = loop {
            tokio::select! {
                status = child.wait() => break status.map_err(BridgeError::Spawn)?,
                _ = ticker.tick() => {
                    let elapsed = started.elapsed();
                    let pct = estimator.observe(elapsed);
                    debug!(job_id = %request.job_id, format = %format, phase = ?estimator.phase(elapsed), pct, "Export progress");
                    on_progress(pct);
                }
                _ = &mut deadline => {
                    if let Err(e) = child.kill().await {
                        warn!(job_id = %request.job_id, error = %e, "Failed to kill timed-out export tool");
                    }
                    let (out, err) = drain(stdout, stderr, grace).await;
                    warn!(job_id = %request.job_id, format = %format, "Export tool timed out");
                    return Err(BridgeError::ToolTimeout {
                        seconds: self.config.timeout().as_secs(),
                        diagnostics: diagnostics(&out, &err, self.config.output_truncate),
                    });
                }
            }
        };

        let (out, err) = drain(stdout, stderr, grace).await;

        if !status.success() {
            return Err(BridgeError::ToolFailed {
                code: status.code(),
                output: diagnostics(&out, &err, self.config.output_truncate),
            });
        }

        let expected = expected_artifact(&output_dir, &request.input, &format);
        if expected.is_file() {
            info!(job_id = %request.job_id, artifact = %expected.display(), "Export finished");
            Ok(ConversionOutput {
                artifact: Some(expected),
            })
        } else {
            warn!(
                job_id = %request.job_id,
                expected = %expected.display(),
                "Export tool exited cleanly but produced no file"
            );
            Ok(ConversionOutput { artifact: None })
        }
    }
}

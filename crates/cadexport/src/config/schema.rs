use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    /// SQLite file holding the jobs table; `~/.cadexport/data/cadexport.db` when unset.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub tool: ToolConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            database_path: None,
            queue: QueueConfig::default(),
            tool: ToolConfig::default(),
            detector: DetectorConfig::default(),
            broadcast: BroadcastConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(crate::db::default_database_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts per (job, format) before the format is recorded as failed.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    #[serde(default = "default_retry_cooldown_ms")]
    pub retry_cooldown_ms: u64,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Upcoming items included in a status snapshot.
    #[serde(default = "default_status_preview_limit")]
    pub status_preview_limit: usize,
    /// Used when a job requests no formats.
    #[serde(default = "default_formats")]
    pub default_formats: Vec<String>,
    /// Formats scheduled after the others of the same job.
    #[serde(default = "default_heavy_formats")]
    pub heavy_formats: Vec<String>,
    /// Largest accepted batch submission.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Pending jobs re-enqueued at startup.
    #[serde(default = "default_recovery_limit")]
    pub recovery_limit: u32,
}

fn default_retry_ceiling() -> u32 {
    3
}

fn default_retry_cooldown_ms() -> u64 {
    15_000
}

fn default_idle_poll_ms() -> u64 {
    1_000
}

fn default_status_preview_limit() -> usize {
    50
}

fn default_formats() -> Vec<String> {
    vec!["pdf".to_string()]
}

fn default_heavy_formats() -> Vec<String> {
    vec!["dwg".to_string()]
}

fn default_max_batch() -> usize {
    100
}

fn default_recovery_limit() -> u32 {
    100
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: default_retry_ceiling(),
            retry_cooldown_ms: default_retry_cooldown_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            status_preview_limit: default_status_preview_limit(),
            default_formats: default_formats(),
            heavy_formats: default_heavy_formats(),
            max_batch: default_max_batch(),
            recovery_limit: default_recovery_limit(),
        }
    }
}

impl QueueConfig {
    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_millis(self.retry_cooldown_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn is_heavy(&self, format: &str) -> bool {
        self.heavy_formats
            .iter()
            .any(|f| f.eq_ignore_ascii_case(format))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_interpreter_args")]
    pub interpreter_args: Vec<String>,
    #[serde(default = "default_script_name")]
    pub script_name: String,
    /// Searched in order for `script_name`; relative entries resolve against
    /// the working directory.
    #[serde(default = "default_script_dirs")]
    pub script_dirs: Vec<PathBuf>,
    /// Handshake directory shared with the script.
    #[serde(default = "default_control_dir")]
    pub control_dir: PathBuf,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Overrides `timeout_minutes` when set.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// How long to keep draining tool output once the process is gone.
    #[serde(default = "default_output_grace_ms")]
    pub output_grace_ms: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Estimates approach this value but never reach it.
    #[serde(default = "default_progress_ceiling")]
    pub progress_ceiling: u8,
    /// Characters of tool output kept in failure diagnostics.
    #[serde(default = "default_output_truncate")]
    pub output_truncate: usize,
    /// Tried in order when the declared source file is absent.
    #[serde(default = "default_alternate_extensions")]
    pub alternate_extensions: Vec<String>,
    /// Refuse to run on non-Windows hosts.
    #[serde(default = "default_require_windows")]
    pub require_windows: bool,
}

fn default_interpreter() -> String {
    "cscript".to_string()
}

fn default_interpreter_args() -> Vec<String> {
    vec!["//Nologo".to_string()]
}

fn default_script_name() -> String {
    "export-drawing.vbs".to_string()
}

fn default_script_dirs() -> Vec<PathBuf> {
    ["scripts", "../scripts", "../../scripts"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

fn default_control_dir() -> PathBuf {
    PathBuf::from("data").join("control")
}

fn default_timeout_minutes() -> u64 {
    25
}

fn default_output_grace_ms() -> u64 {
    2_000
}

fn default_progress_interval_ms() -> u64 {
    1_000
}

fn default_progress_ceiling() -> u8 {
    95
}

fn default_output_truncate() -> usize {
    500
}

fn default_alternate_extensions() -> Vec<String> {
    vec!["ipt".to_string(), "iam".to_string(), "idw".to_string()]
}

fn default_require_windows() -> bool {
    true
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            interpreter_args: default_interpreter_args(),
            script_name: default_script_name(),
            script_dirs: default_script_dirs(),
            control_dir: default_control_dir(),
            timeout_minutes: default_timeout_minutes(),
            timeout_secs: None,
            output_grace_ms: default_output_grace_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            progress_ceiling: default_progress_ceiling(),
            output_truncate: default_output_truncate(),
            alternate_extensions: default_alternate_extensions(),
            require_windows: default_require_windows(),
        }
    }
}

impl ToolConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(self.timeout_minutes * 60))
    }

    pub fn output_grace(&self) -> Duration {
        Duration::from_millis(self.output_grace_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetectorMode {
    /// Push notifications from the store's change feed.
    Notify,
    /// Observe the database files and diff snapshots.
    Watch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_mode")]
    pub mode: DetectorMode,
    #[serde(default = "default_notify_debounce_ms")]
    pub notify_debounce_ms: u64,
    #[serde(default = "default_notify_poll_ms")]
    pub notify_poll_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
    /// Rescan interval used when file observation is unavailable.
    #[serde(default = "default_fallback_poll_ms")]
    pub fallback_poll_ms: u64,
    /// Upper bound on records compared per scan.
    #[serde(default = "default_scan_limit")]
    pub scan_limit: u32,
}

fn default_detector_mode() -> DetectorMode {
    DetectorMode::Watch
}

fn default_notify_debounce_ms() -> u64 {
    1_000
}

fn default_notify_poll_ms() -> u64 {
    250
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_watch_debounce_ms() -> u64 {
    100
}

fn default_fallback_poll_ms() -> u64 {
    2_000
}

fn default_scan_limit() -> u32 {
    10_000
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            mode: default_detector_mode(),
            notify_debounce_ms: default_notify_debounce_ms(),
            notify_poll_ms: default_notify_poll_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            watch_debounce_ms: default_watch_debounce_ms(),
            fallback_poll_ms: default_fallback_poll_ms(),
            scan_limit: default_scan_limit(),
        }
    }
}

impl DetectorConfig {
    pub fn notify_debounce(&self) -> Duration {
        Duration::from_millis(self.notify_debounce_ms)
    }

    pub fn notify_poll(&self) -> Duration {
        Duration::from_millis(self.notify_poll_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    pub fn fallback_poll(&self) -> Duration {
        Duration::from_millis(self.fallback_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Records included in the `initial` snapshot.
    #[serde(default = "default_snapshot_limit")]
    pub snapshot_limit: u32,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Outbound frames buffered per session.
    #[serde(default = "default_session_buffer")]
    pub session_buffer: usize,
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_snapshot_limit() -> u32 {
    500
}

fn default_bind() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_session_buffer() -> usize {
    256
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            snapshot_limit: default_snapshot_limit(),
            bind: default_bind(),
            session_buffer: default_session_buffer(),
        }
    }
}

impl BroadcastConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_flush_debounce_ms")]
    pub flush_debounce_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_flush_debounce_ms() -> u64 {
    300
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_debounce_ms: default_flush_debounce_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl SyncConfig {
    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "info,cadexport=debug".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

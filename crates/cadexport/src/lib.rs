pub mod bridge;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod model;
pub mod queue;
pub mod store;
pub mod sync;
pub mod telemetry;

pub use bridge::{ConversionOutput, ConversionRequest, ConversionTool, ScriptBridge};
pub use broadcast::{Broadcaster, ChannelSession, Session, SessionId};
pub use config::{load_config, load_config_from_str, Config};
pub use detector::{
    ChangeDetector, DetectorContext, NotificationSource, NotifyDetector, WatchDetector,
};
pub use error::{
    BridgeError, CadExportError, ConfigError, DetectorError, QueueError, Result, SendError,
    StoreError, SyncError,
};
pub use model::{Artifact, ChangeEvent, Job, JobStatus, NewJob};
pub use queue::{JobQueue, QueueSnapshot};
pub use store::{JobStore, JobUpdate, LocalCache, SqliteJobStore};
pub use sync::{ConnectionState, SyncClient, SyncEvent};

// Media retrieval pipeline for a challenge-guarded origin: authorized
// session management, browser-driven link resolution, and resilient
// transfer (resumable download or encrypted stream assembly), tracked by an
// in-memory task registry.

pub mod browser;
pub mod config;
pub mod error;
pub mod jobs;
pub mod model;
pub mod resolver;
pub mod session;
pub mod tasks;
pub mod transfer;

pub use browser::{BrowserLauncher, BrowserSurface, ConstructionGate, SurfaceProvider};
pub use config::{EngineConfig, RetryConfig};
pub use error::{CancelError, PipelineError, SoftError};
pub use jobs::JobRunner;
pub use model::{DownloadTask, StreamLinkInfo, TaskStatus, TransferDescriptor};
pub use resolver::Resolver;
pub use session::{SessionManager, SessionResponse};
pub use tasks::TaskTracker;
pub use transfer::{HttpDownloader, ProgressReporter, StreamAssembler};

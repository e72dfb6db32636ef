// Transfer engine — two strategies behind one progress/retry contract:
// resumable chunked download and encrypted stream assembly.

pub mod download;
pub mod hls;
pub mod progress;

pub use download::HttpDownloader;
pub use hls::{EncryptedManifest, KeyRef, StreamAssembler};
pub use progress::{NoopReporter, ProgressMeter, ProgressReporter, ProgressSnapshot};

pub mod errors;
pub mod manager;
pub mod stats;
pub mod transport;
pub mod types;

pub use errors::DispatchError;
pub use manager::{CandidateOrder, VpnDownloadManager};
pub use stats::{CurrentJob, WorkerStats, WorkerStatsStore};
pub use transport::{DownloadFailure, HealthProbe, HttpWorkerTransport, WorkerTransport};
pub use types::{DownloadResult, FailureKind, SliceRequest, VpnAttempt, WorkerEndpoint};

pub mod client;
pub mod error;
pub mod logs;

pub use client::{ContainerHealth, ContainerState, DockerClient};
pub use error::DockerError;
pub use logs::demux_log_frames;

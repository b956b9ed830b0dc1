pub mod block_detect;
pub mod config;
pub mod config_io;
pub mod dispatch;
pub mod docker;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod net;
pub mod pool;
pub mod tunnel;
pub mod worker;

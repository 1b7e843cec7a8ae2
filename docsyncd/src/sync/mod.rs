pub mod backoff;
pub mod clock;
pub mod debounce;
mod download;
pub mod engine;
pub mod guard;
pub mod index;
pub mod local_watcher;
mod pass;
pub mod paths;
pub mod queue;
pub mod transfer;
pub mod transport;
mod upload;
pub mod watch;
pub mod worker;

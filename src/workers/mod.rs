pub mod autoscaler;
pub mod upload_watcher;

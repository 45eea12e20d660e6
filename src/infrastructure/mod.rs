pub mod db;
pub mod probe;
pub mod provisioner;
pub mod queue;
pub mod storage;

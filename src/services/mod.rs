pub mod cron;
pub mod migration;
pub mod notify;
pub mod orchestrator;
pub mod pool;
pub mod processor;
pub mod storage;
pub mod triggers;

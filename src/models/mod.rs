pub mod batch;
pub mod project;
pub mod schedule;

pub mod evaluators;
pub mod executor;
pub mod report;
pub mod runner;
pub mod scenario;

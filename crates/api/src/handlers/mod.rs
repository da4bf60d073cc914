pub mod admin;
pub mod dependencies;
pub mod executions;
pub mod units;

//! Core domain models: tasks and the dependency graph they live in.

pub mod dag;
pub mod task;

pub use dag::{GraphStatus, StatusCounts, TaskGraph};
pub use task::{Task, TaskId, TaskSpec, TaskStatus};

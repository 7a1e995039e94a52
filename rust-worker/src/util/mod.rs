//! Small helpers shared across components.

pub mod backoff;
pub mod user_agent;

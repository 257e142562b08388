//! Supervisor for external training jobs: launches them, streams their
//! progress markers into live series, and replays recorded runs.

pub mod app;
pub mod domain;
pub mod ui;

pub mod components;
pub mod layout;
mod root;
pub mod screens;
pub mod sink;

pub use root::{render, Charts};
pub use sink::{loss_label, ChartModel, ChartSink, FrameReadout, SharedChart, NO_LOSS_LABEL};

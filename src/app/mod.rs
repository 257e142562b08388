pub mod config;
pub mod metrics;
pub mod playback;
pub mod recording;
pub mod runs;
pub mod sink;
mod state;
pub mod telemetry;

pub use config::{JobKind, SupervisorConfig, TrainingJob};
pub use metrics::{LossSample, ProgressSample, Sample, WeightSample};
pub use playback::{PlaybackEngine, PlaybackState};
pub use sink::{FrameView, RenderSink};
pub use state::*;

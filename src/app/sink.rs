use crate::app::metrics::LossSample;

/// One playback frame as handed to a renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameView<'a> {
    pub frame: usize,
    pub frame_count: usize,
    pub epoch: u64,
    pub weights: &'a [f64],
    /// `None` when the recording has no loss series to look up.
    pub loss: Option<f64>,
}

/// Whatever draws charts. Both calls must be idempotent and cheap: callers
/// may repeat them with identical data.
pub trait RenderSink {
    fn render_loss(&mut self, series: &[LossSample]);
    fn render_frame(&mut self, frame: &FrameView<'_>);
}

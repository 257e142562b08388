use std::cell::RefCell;
use std::rc::Rc;

use crate::app::{FrameView, LossSample, RenderSink};

pub const NO_LOSS_LABEL: &str = "no loss available";

/// The frame currently shown by the trajectory chart.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReadout {
    pub frame: usize,
    pub frame_count: usize,
    pub epoch: u64,
    pub w1: f64,
    pub w2: f64,
    pub loss: Option<f64>,
}

impl FrameReadout {
    pub fn loss_label(&self) -> String {
        loss_label(self.loss)
    }
}

pub fn loss_label(loss: Option<f64>) -> String {
    match loss {
        Some(loss) => format!("{loss:.6}"),
        None => NO_LOSS_LABEL.to_string(),
    }
}

/// What the charts draw on the next frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChartModel {
    pub loss: Vec<(f64, f64)>,
    /// `(frame, w1, w2)` for every frame up to the current one.
    pub trail: Vec<(usize, f64, f64)>,
    pub readout: Option<FrameReadout>,
}

impl ChartModel {
    pub fn trail_points(&self) -> Vec<(f64, f64)> {
        self.trail.iter().map(|(_, w1, w2)| (*w1, *w2)).collect()
    }
}

pub type SharedChart = Rc<RefCell<ChartModel>>;

/// Render sink backed by a [`ChartModel`] that the draw pass reads.
#[derive(Debug, Clone, Default)]
pub struct ChartSink {
    model: SharedChart,
}

impl ChartSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(&self) -> SharedChart {
        Rc::clone(&self.model)
    }
}

impl RenderSink for ChartSink {
    fn render_loss(&mut self, series: &[LossSample]) {
        self.model.borrow_mut().loss = series
            .iter()
            .map(|sample| (sample.epoch as f64, sample.loss))
            .collect();
    }

    fn render_frame(&mut self, frame: &FrameView<'_>) {
        let w1 = frame.weights.first().copied().unwrap_or_default();
        let w2 = frame.weights.get(1).copied().unwrap_or_default();
        let mut model = self.model.borrow_mut();
        model.trail.retain(|(index, _, _)| *index < frame.frame);
        model.trail.push((frame.frame, w1, w2));
        model.readout = Some(FrameReadout {
            frame: frame.frame,
            frame_count: frame.frame_count,
            epoch: frame.epoch,
            w1,
            w2,
            loss: frame.loss,
        });
    }
}

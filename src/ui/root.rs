use ratatui::Frame;

use crate::app::App;

use super::components::render_header;
use super::layout::{split_charts, split_layout};
use super::screens;
use super::sink::{ChartSink, SharedChart};

/// Chart models filled by the two render sinks bound to the app.
#[derive(Debug, Clone, Default)]
pub struct Charts {
    pub live: SharedChart,
    pub replay: SharedChart,
}

impl Charts {
    /// Binds a fresh sink for the live series and one for playback, and
    /// returns the models they write to.
    pub fn attach(app: &mut App) -> Self {
        let live = ChartSink::new();
        let replay = ChartSink::new();
        let charts = Self {
            live: live.model(),
            replay: replay.model(),
        };
        app.bind_live_sink(Box::new(live));
        app.bind_playback_sink(Box::new(replay));
        charts
    }
}

pub fn render(frame: &mut Frame<'_>, app: &App, charts: &Charts) {
    let [header_area, chart_area, output_area, status_area] = split_layout(frame.area());
    let [loss_area, trajectory_area] = split_charts(chart_area);

    render_header(frame, header_area, app);
    let live = charts.live.borrow();
    let replay = charts.replay.borrow();
    screens::render_loss_chart(frame, loss_area, app, &live, &replay);
    screens::render_trajectory(frame, trajectory_area, app, &replay);
    screens::render_training_output(frame, output_area, app);
    screens::render_status(frame, status_area, app);
}

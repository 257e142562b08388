use ratatui::layout::Rect;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::Frame;

use crate::app::{App, PlaybackState};

pub fn render_header(frame: &mut Frame<'_>, area: Rect, app: &App) {
    let label = Style::default().fg(Color::Cyan);
    let value = Style::default()
        .fg(Color::White)
        .add_modifier(Modifier::BOLD);

    let training = match (app.active_pid(), app.progress()) {
        (Some(pid), Some(percent)) => format!("running (pid {pid}, {percent:.0}%)"),
        (Some(pid), None) => format!("running (pid {pid})"),
        (None, _) if app.viewed_run().is_some() => "viewing saved run".to_string(),
        (None, _) => "idle".to_string(),
    };
    let playback = app.playback();
    let playback_color = match playback.state() {
        PlaybackState::Playing => Color::LightGreen,
        PlaybackState::Paused => Color::Yellow,
        PlaybackState::Stopped => Color::DarkGray,
    };

    let line = Line::from(vec![
        Span::styled(" Training ", label),
        Span::styled(training, value),
        Span::raw("  "),
        Span::styled(" Playback ", label),
        Span::styled(
            playback.state().label(),
            Style::default()
                .fg(playback_color)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw("  "),
        Span::styled(" Speed ", label),
        Span::styled(format!("{}x", playback.speed()), value),
        Span::raw("  "),
        Span::styled(" Samples ", label),
        Span::styled(app.live_losses().len().to_string(), value),
    ]);

    let header = Paragraph::new(line).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" trainscope "),
    );
    frame.render_widget(header, area);
}

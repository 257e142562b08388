use ratatui::layout::{Alignment, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols::Marker;
use ratatui::text::{Line, Span};
use ratatui::widgets::{Axis, Block, Borders, Chart, Clear, Dataset, GraphType, Paragraph, Wrap};
use ratatui::Frame;
use unicode_width::UnicodeWidthChar;

use crate::app::{App, StatusKind};
use crate::ui::sink::ChartModel;

fn format_axis_value(value: f64, prefer_integers: bool) -> String {
    let abs = value.abs();
    if prefer_integers && abs >= 1_000.0 {
        format!("{:.1}k", value / 1_000.0)
    } else if prefer_integers || abs >= 100.0 {
        format!("{value:.0}")
    } else if abs >= 1.0 {
        format!("{value:.2}")
    } else if abs >= 0.001 || value == 0.0 {
        format!("{value:.3}")
    } else {
        format!("{value:.1e}")
    }
}

fn build_axis_labels(bounds: [f64; 2], slots: usize, prefer_integers: bool) -> Vec<Span<'static>> {
    let [min, max] = bounds;
    if !min.is_finite() || !max.is_finite() || slots < 2 {
        return Vec::new();
    }
    let step = (max - min) / (slots - 1) as f64;
    (0..slots)
        .map(|i| Span::raw(format_axis_value(min + step * i as f64, prefer_integers)))
        .collect()
}

/// Padded min/max over the finite values of `values`.
fn axis_bounds(values: impl Iterator<Item = f64>) -> Option<[f64; 2]> {
    let (min, max) = values
        .filter(|value| value.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), value| {
            (lo.min(value), hi.max(value))
        });
    if !min.is_finite() {
        return None;
    }
    let span = max - min;
    let pad = if span > 0.0 { span * 0.05 } else { min.abs().max(1.0) * 0.1 };
    Some([min - pad, max + pad])
}

fn placeholder(frame: &mut Frame<'_>, area: Rect, title: &str, text: &str) {
    let paragraph = Paragraph::new(text.to_string())
        .block(Block::default().borders(Borders::ALL).title(title.to_string()))
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: true })
        .style(Style::default().fg(Color::DarkGray));
    frame.render_widget(paragraph, area);
}

/// Live (or saved-run) loss curve, with the recorded curve of the loaded
/// playback underneath and the current playback frame marked on it.
pub fn render_loss_chart(
    frame: &mut Frame<'_>,
    area: Rect,
    app: &App,
    live: &ChartModel,
    replay: &ChartModel,
) {
    let marker: Vec<(f64, f64)> = replay
        .readout
        .as_ref()
        .and_then(|readout| {
            let index = app.playback().loss_index(readout.frame)?;
            Some((index as f64, readout.loss?))
        })
        .into_iter()
        .collect();

    let all_points = || live.loss.iter().chain(replay.loss.iter()).chain(marker.iter());
    let (Some(x_bounds), Some(y_bounds)) = (
        axis_bounds(all_points().map(|(x, _)| *x)),
        axis_bounds(all_points().map(|(_, y)| *y)),
    ) else {
        placeholder(
            frame,
            area,
            "Loss",
            "No loss samples yet. Press 't' to train or 'r' to load a recording.",
        );
        return;
    };

    let live_label = if app.viewed_run().is_some() { "saved run" } else { "live" };
    let mut datasets = Vec::new();
    if !replay.loss.is_empty() {
        datasets.push(
            Dataset::default()
                .name("recorded")
                .marker(Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(Color::Magenta))
                .data(&replay.loss),
        );
    }
    if !live.loss.is_empty() {
        datasets.push(
            Dataset::default()
                .name(live_label)
                .marker(Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(Color::Cyan))
                .data(&live.loss),
        );
    }
    if !marker.is_empty() {
        datasets.push(
            Dataset::default()
                .name("frame")
                .marker(Marker::Block)
                .graph_type(GraphType::Scatter)
                .style(Style::default().fg(Color::Yellow))
                .data(&marker),
        );
    }

    let title = match live.loss.last() {
        Some((epoch, loss)) => format!("Loss (epoch {epoch:.0}: {loss:.6})"),
        None => "Loss".to_string(),
    };
    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title(title))
        .x_axis(
            Axis::default()
                .title(Span::styled("epoch", Style::default().fg(Color::DarkGray)))
                .labels(build_axis_labels(x_bounds, 4, true))
                .bounds(x_bounds),
        )
        .y_axis(
            Axis::default()
                .title(Span::styled("loss", Style::default().fg(Color::DarkGray)))
                .labels(build_axis_labels(y_bounds, 4, false))
                .bounds(y_bounds),
        );
    frame.render_widget(chart, area);
}

/// Playback trajectory in the (w1, w2) plane when a recording is loaded,
/// otherwise the live weight trail.
pub fn render_trajectory(frame: &mut Frame<'_>, area: Rect, app: &App, replay: &ChartModel) {
    let replaying = app.playback().frame_count() > 0;
    let (trail, title) = if replaying {
        let title = match replay.readout.as_ref() {
            Some(readout) => format!(
                "Trajectory frame {}/{} epoch {} loss {}",
                readout.frame + 1,
                readout.frame_count,
                readout.epoch,
                readout.loss_label()
            ),
            None => format!("Trajectory ({} frames)", app.playback().frame_count()),
        };
        (replay.trail_points(), title)
    } else if let Some(run) = app.viewed_run() {
        let trail = run.weights.iter().map(|s| (s.w1, s.w2)).collect();
        (trail, "Saved weight trail".to_string())
    } else {
        let trail: Vec<(f64, f64)> = app
            .weight_trail()
            .snapshot()
            .iter()
            .map(|sample| (sample.w1, sample.w2))
            .collect();
        (trail, "Live weights".to_string())
    };

    let (Some(x_bounds), Some(y_bounds)) = (
        axis_bounds(trail.iter().map(|(x, _)| *x)),
        axis_bounds(trail.iter().map(|(_, y)| *y)),
    ) else {
        placeholder(frame, area, "Trajectory", "No weight samples yet.");
        return;
    };

    let head: Vec<(f64, f64)> = trail.last().copied().into_iter().collect();
    let datasets = vec![
        Dataset::default()
            .name("path")
            .marker(Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::LightBlue))
            .data(&trail),
        Dataset::default()
            .name("current")
            .marker(Marker::Block)
            .graph_type(GraphType::Scatter)
            .style(Style::default().fg(Color::LightRed))
            .data(&head),
    ];

    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title(title))
        .x_axis(
            Axis::default()
                .title(Span::styled("w1", Style::default().fg(Color::DarkGray)))
                .labels(build_axis_labels(x_bounds, 3, false))
                .bounds(x_bounds),
        )
        .y_axis(
            Axis::default()
                .title(Span::styled("w2", Style::default().fg(Color::DarkGray)))
                .labels(build_axis_labels(y_bounds, 3, false))
                .bounds(y_bounds),
        );
    frame.render_widget(chart, area);
}

fn wrap_plain_line(line: &str, width: usize) -> Vec<String> {
    if width == 0 {
        return vec![line.to_string()];
    }
    let mut rows = Vec::new();
    let mut current = String::new();
    let mut current_width = 0;
    for ch in line.chars() {
        let ch_width = ch.width().unwrap_or(0);
        if current_width + ch_width > width && !current.is_empty() {
            rows.push(std::mem::take(&mut current));
            current_width = 0;
        }
        current.push(ch);
        current_width += ch_width;
    }
    rows.push(current);
    rows
}

/// Child output, newest at the bottom. stderr lines carry a `! ` prefix and
/// are shown in red.
pub fn render_training_output(frame: &mut Frame<'_>, area: Rect, app: &App) {
    frame.render_widget(Clear, area);
    let block = Block::default().borders(Borders::ALL).title("Training Output");
    let raw_lines = app.training_output();
    if raw_lines.is_empty() {
        placeholder(frame, area, "Training Output", "No output yet.");
        return;
    }

    let inner_width = area.width.saturating_sub(2) as usize;
    let visible_height = area.height.saturating_sub(2).max(1) as usize;
    let mut rows: Vec<Line<'static>> = Vec::new();
    for raw in raw_lines.iter().rev().take(visible_height) {
        let style = if raw.starts_with("! ") {
            Style::default().fg(Color::LightRed)
        } else if raw.starts_with("$ ") {
            Style::default().fg(Color::DarkGray)
        } else {
            Style::default().fg(Color::White)
        };
        for row in wrap_plain_line(raw, inner_width).into_iter().rev() {
            rows.push(Line::from(Span::styled(row, style)));
        }
    }
    rows.truncate(visible_height);
    rows.reverse();

    frame.render_widget(Paragraph::new(rows).block(block), area);
}

fn status_style(kind: StatusKind) -> Style {
    match kind {
        StatusKind::Info => Style::default().fg(Color::LightBlue),
        StatusKind::Success => Style::default().fg(Color::LightGreen),
        StatusKind::Warning => Style::default().fg(Color::Yellow),
        StatusKind::Error => Style::default().fg(Color::LightRed),
    }
}

pub fn render_status(frame: &mut Frame<'_>, area: Rect, app: &App) {
    let instructions = if app.is_training_running() {
        "Training running… c: cancel • space: play/pause • ←/→: scrub • q: quit"
    } else {
        "t: train • r: load recording • space: play/pause • s: stop • ←/→: scrub • +/-: speed • l: live • q: quit"
    };

    let status_text = app
        .status()
        .map(|s| s.text.clone())
        .unwrap_or_else(|| "Ready".to_string());
    let style = app
        .status()
        .map(|s| status_style(s.kind))
        .unwrap_or_else(|| Style::default().fg(Color::DarkGray));

    let lines = vec![
        Line::from(Span::styled(status_text, style.add_modifier(Modifier::BOLD))),
        Line::from(Span::styled(instructions, Style::default().fg(Color::DarkGray))),
    ];
    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .alignment(Alignment::Left)
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_pad_flat_series() {
        let bounds = axis_bounds([0.5, 0.5].into_iter()).unwrap();
        assert!(bounds[0] < 0.5 && bounds[1] > 0.5);
    }

    #[test]
    fn bounds_skip_non_finite() {
        assert_eq!(axis_bounds([f64::NAN].into_iter()), None);
        let bounds = axis_bounds([0.0, f64::INFINITY, 10.0].into_iter()).unwrap();
        assert!(bounds[0] < 0.0 && bounds[0] > -1.0);
        assert!(bounds[1] > 10.0 && bounds[1] < 11.0);
    }

    #[test]
    fn wrapping_respects_width() {
        assert_eq!(wrap_plain_line("abcdef", 4), vec!["abcd", "ef"]);
        assert_eq!(wrap_plain_line("", 4), vec![""]);
    }

    #[test]
    fn axis_labels_cover_bounds() {
        let labels = build_axis_labels([0.0, 30.0], 4, true);
        let text: Vec<String> = labels.iter().map(|s| s.content.to_string()).collect();
        assert_eq!(text, vec!["0", "10", "20", "30"]);
    }
}

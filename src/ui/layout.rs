use ratatui::layout::{Constraint, Direction, Layout, Rect};

/// Header, charts, log and status rows.
pub fn split_layout(area: Rect) -> [Rect; 4] {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(3),
                Constraint::Percentage(55),
                Constraint::Min(5),
                Constraint::Length(4),
            ]
            .as_ref(),
        )
        .split(area);
    [layout[0], layout[1], layout[2], layout[3]]
}

/// Loss chart on the left, trajectory on the right.
pub fn split_charts(area: Rect) -> [Rect; 2] {
    let layout = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)].as_ref())
        .split(area);
    [layout[0], layout[1]]
}

//! Rendering; a pure function of [`AppState`]

use chrono::{DateTime, Utc};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState, Wrap},
    Frame,
};

use tunnel9_common::TunnelStatus;

use crate::app::{AppState, MessageKind, Mode, Pending, TunnelRow};
use crate::form::{EditForm, Field};

/// Below this width the tags and SSH columns are dropped
const COMPACT_WIDTH: u16 = 100;

/// Status color for the status column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusColor {
    Green,  // Connected
    Orange, // Transitional (Starting, Retrying, Stopping)
    Red,    // Failed
    Gray,   // Idle
}

impl StatusColor {
    pub fn for_status(status: TunnelStatus) -> Self {
        match status {
            TunnelStatus::Connected => StatusColor::Green,
            TunnelStatus::Starting | TunnelStatus::Retrying | TunnelStatus::Stopping => {
                StatusColor::Orange
            }
            TunnelStatus::Failed => StatusColor::Red,
            TunnelStatus::Idle => StatusColor::Gray,
        }
    }

    fn color(self) -> Color {
        match self {
            StatusColor::Green => Color::Green,
            StatusColor::Orange => Color::Yellow,
            StatusColor::Red => Color::Red,
            StatusColor::Gray => Color::DarkGray,
        }
    }
}

/// Human-readable status, with retry count or uptime
pub fn status_text(row: &TunnelRow, pending: Option<Pending>, now: DateTime<Utc>) -> String {
    let base = match row.state.status {
        TunnelStatus::Idle => "Idle".to_string(),
        TunnelStatus::Starting => "Starting...".to_string(),
        TunnelStatus::Connected => match row.state.connected_since {
            Some(since) => format!("Connected {}", format_uptime(now - since)),
            None => "Connected".to_string(),
        },
        TunnelStatus::Retrying => format!("Retrying (#{})", row.state.retry_count),
        TunnelStatus::Failed => "Failed".to_string(),
        TunnelStatus::Stopping => "Stopping...".to_string(),
    };
    match pending {
        Some(Pending::Start) if row.state.status.can_start() => format!("{} (starting)", base),
        Some(Pending::Stop) if row.state.status.can_stop() => format!("{} (stopping)", base),
        _ => base,
    }
}

fn format_uptime(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h{:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// First row to draw so that `cursor` stays visible
fn list_offset(cursor: usize, visible: usize) -> usize {
    if visible == 0 {
        return cursor;
    }
    cursor.saturating_sub(visible - 1)
}

pub fn render(frame: &mut Frame, state: &AppState, now: DateTime<Utc>) {
    let area = frame.area();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(3),
            Constraint::Length(3),
            Constraint::Length(1),
        ])
        .split(area);

    frame.render_widget(render_header(state), layout[0]);
    render_table(frame, state, layout[1], now);
    frame.render_widget(render_details(state), layout[2]);
    frame.render_widget(render_footer(state), layout[3]);

    match &state.mode {
        Mode::List => {}
        Mode::Form => {
            if let Some(form) = &state.form {
                render_form(frame, form, area);
            }
        }
        Mode::ConfirmDelete(id) => {
            let name = state
                .row(id)
                .map(|row| row.spec.name.as_str())
                .unwrap_or(id.as_str());
            render_confirm(frame, name, area);
        }
        Mode::Help => render_help(frame, area),
    }
}

fn render_header(state: &AppState) -> Paragraph<'static> {
    let connected = state
        .rows
        .iter()
        .filter(|row| row.state.status == TunnelStatus::Connected)
        .count();
    Paragraph::new(Line::from(vec![
        Span::styled(
            " tunnel9 ",
            Style::default()
                .fg(Color::Black)
                .bg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!(
            " {} | {} tunnel(s), {} connected",
            state.config_location,
            state.rows.len(),
            connected
        )),
    ]))
}

fn render_table(frame: &mut Frame, state: &AppState, area: Rect, now: DateTime<Utc>) {
    let compact = state.viewport.0 < COMPACT_WIDTH;
    let block = Block::default().borders(Borders::ALL).title(" Tunnels ");

    if state.rows.is_empty() {
        let empty = Paragraph::new("No tunnels configured. Press n to create one.")
            .style(Style::default().fg(Color::DarkGray))
            .block(block);
        frame.render_widget(empty, area);
        return;
    }

    let header_cells: Vec<&str> = if compact {
        vec!["Name", "Local", "Remote", "Status"]
    } else {
        vec!["Name", "Local", "Remote", "Via", "Tags", "Status"]
    };
    let header = Row::new(header_cells).style(Style::default().add_modifier(Modifier::BOLD));

    let rows: Vec<Row> = state
        .rows
        .iter()
        .map(|row| {
            let pending = state.pending.get(&row.spec.id).copied();
            let color = StatusColor::for_status(row.state.status).color();
            let mut cells = vec![
                Cell::from(row.spec.name.clone()),
                Cell::from(row.spec.local_endpoint()),
                Cell::from(row.spec.remote_endpoint()),
            ];
            if !compact {
                let tags: Vec<&str> = row.spec.tags.iter().map(String::as_str).collect();
                cells.push(Cell::from(row.spec.ssh_endpoint()));
                cells.push(Cell::from(tags.join(",")));
            }
            cells.push(
                Cell::from(status_text(row, pending, now)).style(Style::default().fg(color)),
            );
            Row::new(cells)
        })
        .collect();

    let widths: Vec<Constraint> = if compact {
        vec![
            Constraint::Percentage(25),
            Constraint::Percentage(25),
            Constraint::Percentage(25),
            Constraint::Percentage(25),
        ]
    } else {
        vec![
            Constraint::Percentage(18),
            Constraint::Percentage(16),
            Constraint::Percentage(18),
            Constraint::Percentage(18),
            Constraint::Percentage(12),
            Constraint::Percentage(18),
        ]
    };

    // Borders and header take three lines
    let visible = area.height.saturating_sub(3) as usize;
    let mut table_state = TableState::default()
        .with_offset(list_offset(state.cursor, visible))
        .with_selected(Some(state.cursor));

    let table = Table::new(rows, widths)
        .header(header)
        .block(block)
        .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .highlight_symbol("> ");
    frame.render_stateful_widget(table, area, &mut table_state);
}

fn render_details(state: &AppState) -> Paragraph<'static> {
    let lines = match state.selected() {
        Some(row) => {
            let error = row
                .last_error
                .clone()
                .unwrap_or_else(|| "no errors".to_string());
            vec![
                Line::from(format!(
                    "{} [{}] via {}",
                    row.spec.name,
                    row.spec.id,
                    row.spec.ssh_endpoint()
                )),
                Line::from(Span::styled(
                    format!("Last error: {}", error),
                    Style::default().fg(if row.last_error.is_some() {
                        Color::Red
                    } else {
                        Color::DarkGray
                    }),
                )),
            ]
        }
        None => vec![Line::from("")],
    };
    Paragraph::new(Text::from(lines))
        .block(Block::default().borders(Borders::TOP))
        .wrap(Wrap { trim: true })
}

fn render_footer(state: &AppState) -> Paragraph<'static> {
    match &state.message {
        Some(message) => {
            let color = match message.kind {
                MessageKind::Info => Color::Cyan,
                MessageKind::Error => Color::Red,
            };
            Paragraph::new(Span::styled(
                message.text.clone(),
                Style::default().fg(color),
            ))
        }
        None => Paragraph::new(Span::styled(
            "s start  x stop  space toggle  a/X all  n new  e edit  d delete  ? help  q quit",
            Style::default().fg(Color::DarkGray),
        )),
    }
}

fn render_form(frame: &mut Frame, form: &EditForm, area: Rect) {
    let popup = centered_rect(60, 70, area);
    frame.render_widget(Clear, popup);

    let mut lines: Vec<Line> = Field::ALL
        .iter()
        .map(|field| {
            let focused = *field == form.focused();
            let marker = if focused { "> " } else { "  " };
            let value_style = if focused {
                Style::default().add_modifier(Modifier::UNDERLINED)
            } else {
                Style::default()
            };
            Line::from(vec![
                Span::raw(format!("{}{:<14}", marker, field.label())),
                Span::styled(form.value(*field).to_string(), value_style),
            ])
        })
        .collect();

    lines.push(Line::from(""));
    match &form.error {
        Some(error) => lines.push(Line::from(Span::styled(
            error.clone(),
            Style::default().fg(Color::Red),
        ))),
        None => lines.push(Line::from(Span::styled(
            "Tab/Shift-Tab move  Enter save  Esc cancel",
            Style::default().fg(Color::DarkGray),
        ))),
    }

    let paragraph = Paragraph::new(Text::from(lines))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!(" {} ", form.title())),
        )
        .wrap(Wrap { trim: false });
    frame.render_widget(paragraph, popup);
}

fn render_confirm(frame: &mut Frame, name: &str, area: Rect) {
    let popup = centered_rect(50, 20, area);
    frame.render_widget(Clear, popup);
    let paragraph = Paragraph::new(Text::from(vec![
        Line::from(format!("Delete tunnel {}?", name)),
        Line::from(""),
        Line::from(Span::styled(
            "y confirm  any other key cancels",
            Style::default().fg(Color::DarkGray),
        )),
    ]))
    .block(Block::default().borders(Borders::ALL).title(" Confirm "));
    frame.render_widget(paragraph, popup);
}

fn render_help(frame: &mut Frame, area: Rect) {
    let popup = centered_rect(60, 70, area);
    frame.render_widget(Clear, popup);
    let bindings = [
        ("Up/Down, k/j", "move"),
        ("Home/End", "first / last tunnel"),
        ("s, Enter", "start selected"),
        ("x", "stop selected"),
        ("Space", "toggle selected"),
        ("a", "start all"),
        ("X", "stop all"),
        ("n", "new tunnel"),
        ("e", "edit selected"),
        ("d", "delete selected (must be stopped)"),
        ("?", "this help"),
        ("q, Ctrl-C", "quit (Ctrl-C twice forces)"),
    ];
    let lines: Vec<Line> = bindings
        .iter()
        .map(|(keys, action)| Line::from(format!("  {:<14} {}", keys, action)))
        .collect();
    let paragraph = Paragraph::new(Text::from(lines))
        .block(Block::default().borders(Borders::ALL).title(" Help "));
    frame.render_widget(paragraph, popup);
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100u16.saturating_sub(percent_y)) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100u16.saturating_sub(percent_y)) / 2),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100u16.saturating_sub(percent_x)) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100u16.saturating_sub(percent_x)) / 2),
        ])
        .split(vertical[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{update, AppEvent};
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use ratatui::{backend::TestBackend, Terminal};
    use tunnel9_common::{TunnelEvent, TunnelSpec};

    fn draw(state: &AppState, now: DateTime<Utc>) -> String {
        let mut terminal = Terminal::new(TestBackend::new(120, 30)).unwrap();
        terminal.draw(|frame| render(frame, state, now)).unwrap();
        terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    fn state() -> AppState {
        let mut state = AppState::new(
            vec![
                TunnelSpec::new("alpha", 8001, "localhost", 80, "bastion").with_tags(["prod"]),
                TunnelSpec::new("beta", 8002, "db.internal", 5432, "bastion"),
            ],
            "/tmp/tunnel9.toml",
        );
        update(&mut state, AppEvent::Resize(120, 30));
        state
    }

    #[test]
    fn test_status_colors() {
        assert_eq!(StatusColor::for_status(TunnelStatus::Connected), StatusColor::Green);
        assert_eq!(StatusColor::for_status(TunnelStatus::Retrying), StatusColor::Orange);
        assert_eq!(StatusColor::for_status(TunnelStatus::Failed), StatusColor::Red);
        assert_eq!(StatusColor::for_status(TunnelStatus::Idle), StatusColor::Gray);
    }

    #[test]
    fn test_status_text() {
        let now = Utc::now();
        let mut state = state();
        update(
            &mut state,
            AppEvent::Supervisor(TunnelEvent::StatusChanged {
                id: "alpha".into(),
                status: TunnelStatus::Connected,
                error: None,
                retry_count: 0,
                connected_since: Some(now - chrono::Duration::seconds(125)),
            }),
        );
        let row = state.row(&"alpha".into()).unwrap();
        assert_eq!(status_text(row, None, now), "Connected 2m05s");
        assert_eq!(
            status_text(row, Some(Pending::Stop), now),
            "Connected 2m05s (stopping)"
        );

        let idle = state.row(&"beta".into()).unwrap();
        assert_eq!(status_text(idle, Some(Pending::Start), now), "Idle (starting)");
    }

    #[test]
    fn test_list_offset_keeps_cursor_visible() {
        assert_eq!(list_offset(0, 5), 0);
        assert_eq!(list_offset(4, 5), 0);
        assert_eq!(list_offset(7, 5), 3);
        assert_eq!(list_offset(3, 0), 3);
    }

    #[test]
    fn test_renders_rows_and_footer() {
        let screen = draw(&state(), Utc::now());
        assert!(screen.contains("alpha"));
        assert!(screen.contains("db.internal:5432"));
        assert!(screen.contains("/tmp/tunnel9.toml"));
        assert!(screen.contains("? help"));
    }

    #[test]
    fn test_renders_overlays() {
        let mut state = state();
        update(
            &mut state,
            AppEvent::Key(KeyEvent::new(KeyCode::Char('n'), KeyModifiers::NONE)),
        );
        assert!(draw(&state, Utc::now()).contains("New tunnel"));

        update(
            &mut state,
            AppEvent::Key(KeyEvent::new(KeyCode::Esc, KeyModifiers::NONE)),
        );
        update(
            &mut state,
            AppEvent::Key(KeyEvent::new(KeyCode::Char('?'), KeyModifiers::NONE)),
        );
        assert!(draw(&state, Utc::now()).contains("Help"));
    }

    #[test]
    fn test_renders_empty_list() {
        let state = AppState::new(Vec::new(), "/tmp/none.toml");
        assert!(draw(&state, Utc::now()).contains("No tunnels configured"));
    }
}

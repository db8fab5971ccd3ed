use std::io::Stdout;
use std::time::{Duration, Instant};

use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers, MouseButton, MouseEvent, MouseEventKind,
};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Layout, Position, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols::Marker;
use ratatui::text::{Line, Span};
use ratatui::widgets::canvas::{Canvas, Points};
use ratatui::widgets::{Block, Clear, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use tokio::sync::{mpsc, watch};

use crate::format::ResponseBlock;
use crate::orb::{OrbTuning, OrbVisual};
use crate::protocol::{OrbCommand, ResultsCard, UiEvent, UiSnapshot, UiState};

const FRAME_INTERVAL: Duration = Duration::from_millis(33);
/// Input events handled per frame before a redraw is forced.
const EVENT_BATCH: usize = 32;
const GREETING: &str = "How can I help?";
const INPUT_HINT: &str = "Type a command...";

/// Channels the terminal thread shares with the controller.
pub struct UiContext {
    pub snapshot_rx: watch::Receiver<UiSnapshot>,
    pub ui_tx: mpsc::Sender<UiEvent>,
    pub orb_rx: mpsc::UnboundedReceiver<OrbCommand>,
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Runs the terminal surface until shutdown or quit. Blocks, so the
/// caller gives it a dedicated thread.
pub fn run(mut ctx: UiContext) -> Result<(), String> {
    let result = run_terminal(&mut ctx);
    restore_terminal();
    // whatever ended this thread, the rest of the app follows
    let _ = ctx.ui_tx.blocking_send(UiEvent::Quit);
    result
}

fn run_terminal(ctx: &mut UiContext) -> Result<(), String> {
    terminal::enable_raw_mode().map_err(|err| format!("failed to enable raw mode: {err}"))?;
    let mut stdout = std::io::stdout();
    stdout
        .execute(EnterAlternateScreen)
        .map_err(|err| format!("failed to enter alternate screen: {err}"))?;
    stdout
        .execute(EnableMouseCapture)
        .map_err(|err| format!("failed to enable mouse capture: {err}"))?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))
        .map_err(|err| format!("failed to start terminal: {err}"))?;
    event_loop(&mut terminal, ctx)
}

fn restore_terminal() {
    let _ = terminal::disable_raw_mode();
    let mut stdout = std::io::stdout();
    let _ = stdout.execute(DisableMouseCapture);
    let _ = stdout.execute(LeaveAlternateScreen);
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    ctx: &mut UiContext,
) -> Result<(), String> {
    let mut orb = OrbVisual::new(OrbTuning::default());
    let mut input = String::new();
    let mut orb_area = Rect::default();
    let mut last_frame = Instant::now();

    loop {
        if *ctx.shutdown_rx.borrow() {
            return Ok(());
        }
        let snapshot = ctx.snapshot_rx.borrow().clone();

        while let Ok(command) = ctx.orb_rx.try_recv() {
            match command {
                OrbCommand::RotateBy { yaw, pitch } => orb.rotate_by(yaw, pitch),
                OrbCommand::Pulse => orb.pulse(),
            }
        }
        orb.set_state(snapshot.state);
        let now = Instant::now();
        let dt = now.duration_since(last_frame).as_secs_f32();
        last_frame = now;
        orb.update(dt, snapshot.auto_rotate);

        terminal
            .draw(|frame| {
                orb_area = draw(frame, &mut orb, &snapshot, &input);
            })
            .map_err(|err| format!("failed to draw frame: {err}"))?;

        // poll doubles as the frame pacer
        if !event::poll(FRAME_INTERVAL).map_err(|err| format!("failed to poll input: {err}"))? {
            continue;
        }
        for _ in 0..EVENT_BATCH {
            let event = event::read().map_err(|err| format!("failed to read input: {err}"))?;
            let forwarded = match event {
                Event::Key(key) => handle_key(key, &mut input, &snapshot),
                Event::Mouse(mouse) => handle_mouse(mouse, &orb, orb_area),
                _ => None,
            };
            if let Some(ui_event) = forwarded {
                let quitting = matches!(ui_event, UiEvent::Quit);
                if ctx.ui_tx.blocking_send(ui_event).is_err() || quitting {
                    return Ok(());
                }
            }
            if !event::poll(Duration::ZERO)
                .map_err(|err| format!("failed to poll input: {err}"))?
            {
                break;
            }
        }
    }
}

/// Maps a key press to the event the controller should see. Buffer
/// editing stays local.
fn handle_key(key: KeyEvent, input: &mut String, snapshot: &UiSnapshot) -> Option<UiEvent> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match (key.code, key.modifiers) {
        (KeyCode::Char('c'), m) if m.contains(KeyModifiers::CONTROL) => Some(UiEvent::Quit),
        (KeyCode::Char('s'), m) if m.contains(KeyModifiers::CONTROL) => {
            Some(UiEvent::ToggleSpeaker)
        }
        (KeyCode::Esc, _) => Some(UiEvent::CloseResults),
        (KeyCode::Enter, _) => {
            let text = input.trim().to_string();
            if text.is_empty() {
                return None;
            }
            // while busy the controller drops the query, so the buffer
            // survives for a retry
            if snapshot.state == UiState::Idle {
                input.clear();
            }
            Some(UiEvent::SubmitText { text })
        }
        (KeyCode::Backspace, _) => {
            input.pop();
            None
        }
        (KeyCode::Char(' '), _) => {
            if input.is_empty() && snapshot.state == UiState::Idle {
                Some(UiEvent::VoiceKey)
            } else {
                if snapshot.results.is_none() {
                    input.push(' ');
                }
                None
            }
        }
        (KeyCode::Char('q'), m) if m.is_empty() && input.is_empty() => Some(UiEvent::Quit),
        (KeyCode::Char(c), m) if !m.contains(KeyModifiers::CONTROL) => {
            if snapshot.results.is_none() {
                input.push(c);
            }
            None
        }
        _ => None,
    }
}

fn handle_mouse(mouse: MouseEvent, orb: &OrbVisual, orb_area: Rect) -> Option<UiEvent> {
    match mouse.kind {
        MouseEventKind::Down(MouseButton::Left) => {
            let over_orb = orb_area.contains(Position::new(mouse.column, mouse.row))
                && orb.hit_test(mouse.column - orb_area.x, mouse.row - orb_area.y);
            Some(UiEvent::PointerDown {
                x: mouse.column,
                y: mouse.row,
                over_orb,
            })
        }
        MouseEventKind::Drag(MouseButton::Left) => Some(UiEvent::PointerMove {
            x: mouse.column,
            y: mouse.row,
        }),
        MouseEventKind::Up(MouseButton::Left) => Some(UiEvent::PointerUp {
            x: mouse.column,
            y: mouse.row,
        }),
        _ => None,
    }
}

/// Draws one frame and returns the orb canvas area for hit testing.
fn draw(frame: &mut Frame, orb: &mut OrbVisual, snapshot: &UiSnapshot, input: &str) -> Rect {
    let chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(10),
        Constraint::Length(3),
        Constraint::Length(1),
    ])
    .split(frame.area());

    // the greeting yields to an open results card
    if snapshot.results.is_none() {
        let greeting = Paragraph::new(vec![
            Line::default(),
            Line::from(Span::styled(
                GREETING,
                Style::default()
                    .fg(Color::White)
                    .add_modifier(Modifier::BOLD),
            )),
        ])
        .alignment(Alignment::Center);
        frame.render_widget(greeting, chunks[0]);
    }

    let orb_area = chunks[1];
    orb.resize(orb_area.width, orb_area.height);
    let orb_frame = orb.render();
    let canvas = Canvas::default()
        .marker(Marker::Braille)
        .x_bounds([0.0, orb_frame.width as f64])
        .y_bounds([0.0, orb_frame.height as f64])
        .paint(|ctx| {
            for layer in &orb_frame.layers {
                ctx.draw(&Points {
                    coords: &layer.coords,
                    color: Color::Rgb(layer.color.0, layer.color.1, layer.color.2),
                });
            }
        });
    frame.render_widget(canvas, orb_area);

    frame.render_widget(input_bar(snapshot, input), chunks[2]);
    frame.render_widget(
        Paragraph::new(Line::from(Span::styled(
            " enter=send  space=talk  ctrl-s=speaker  esc=close  q=quit ",
            Style::default().fg(Color::DarkGray),
        )))
        .alignment(Alignment::Center),
        chunks[3],
    );

    if let Some(card) = &snapshot.results {
        draw_results(frame, card);
    }
    if let Some(notice) = &snapshot.notice {
        draw_notice(frame, notice);
    }

    orb_area
}

fn input_bar<'a>(snapshot: &'a UiSnapshot, input: &'a str) -> Paragraph<'a> {
    let status_style = match snapshot.state {
        UiState::Idle | UiState::Results => Style::default().fg(Color::DarkGray),
        UiState::Listening => Style::default().fg(Color::LightRed),
        UiState::Searching => Style::default().fg(Color::LightCyan),
    };
    let title = if snapshot.status.is_empty() {
        " jarvet ".to_string()
    } else {
        format!(" {} ", snapshot.status)
    };
    let connection = if snapshot.connected {
        Span::styled(" ● ", Style::default().fg(Color::Green))
    } else {
        Span::styled(" ○ ", Style::default().fg(Color::Red))
    };
    let speaker = Span::styled(
        if snapshot.speaker_enabled {
            "voice on "
        } else {
            "voice off "
        },
        Style::default().fg(Color::DarkGray),
    );
    let block = Block::bordered()
        .border_style(Style::default().fg(Color::DarkGray))
        .title(Line::from(Span::styled(title, status_style)))
        .title(Line::from(vec![connection, speaker]).right_aligned());

    let line = if input.is_empty() {
        Line::from(Span::styled(
            INPUT_HINT,
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        Line::from(vec![
            Span::raw(input),
            Span::styled("▏", Style::default().fg(Color::Cyan)),
        ])
    };
    Paragraph::new(line).block(block)
}

fn draw_results(frame: &mut Frame, card: &ResultsCard) {
    let area = frame.area();
    let popup = centered(
        area,
        ((area.width as u32 * 7 / 10) as u16).max(30),
        ((area.height as u32 * 3 / 5) as u16).max(7),
    );
    frame.render_widget(Clear, popup);
    let block = Block::bordered()
        .border_style(Style::default().fg(Color::Cyan))
        .title(Line::from(format!(" {} ", card.query)))
        .title_bottom(
            Line::from(Span::styled(
                " esc to close ",
                Style::default().fg(Color::DarkGray),
            ))
            .right_aligned(),
        );
    let body = Paragraph::new(card_lines(card))
        .wrap(Wrap { trim: false })
        .block(block);
    frame.render_widget(body, popup);
}

fn draw_notice(frame: &mut Frame, notice: &str) {
    let area = frame.area();
    let popup = centered(area, notice.chars().count() as u16 + 4, 3);
    frame.render_widget(Clear, popup);
    let body = Paragraph::new(Line::from(notice.to_string()))
        .alignment(Alignment::Center)
        .block(Block::bordered().border_style(Style::default().fg(Color::Red)));
    frame.render_widget(body, popup);
}

fn card_lines(card: &ResultsCard) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    for block in &card.blocks {
        if !lines.is_empty() {
            lines.push(Line::default());
        }
        match block {
            ResponseBlock::Heading(text) => lines.push(Line::from(Span::styled(
                text.clone(),
                Style::default()
                    .fg(Color::LightCyan)
                    .add_modifier(Modifier::BOLD),
            ))),
            ResponseBlock::Paragraph(text) => lines.push(Line::from(text.clone())),
            ResponseBlock::Bullets(items) => {
                for item in items {
                    lines.push(Line::from(format!(" • {item}")));
                }
            }
            ResponseBlock::Numbered(items) => {
                for (index, item) in items.iter().enumerate() {
                    lines.push(Line::from(format!(" {}. {item}", index + 1)));
                }
            }
        }
    }
    lines
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_snapshot() -> UiSnapshot {
        UiSnapshot::initial(true)
    }

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn line_text(line: &Line) -> String {
        line.spans.iter().map(|span| span.content.as_ref()).collect()
    }

    #[test]
    fn typing_builds_the_buffer() {
        let snapshot = idle_snapshot();
        let mut input = String::new();
        assert!(handle_key(press(KeyCode::Char('h')), &mut input, &snapshot).is_none());
        assert!(handle_key(press(KeyCode::Char('i')), &mut input, &snapshot).is_none());
        assert_eq!(input, "hi");
        assert!(handle_key(press(KeyCode::Backspace), &mut input, &snapshot).is_none());
        assert_eq!(input, "h");
    }

    #[test]
    fn enter_submits_and_clears_when_idle() {
        let snapshot = idle_snapshot();
        let mut input = "  lights on ".to_string();
        let event = handle_key(press(KeyCode::Enter), &mut input, &snapshot);
        assert!(matches!(event, Some(UiEvent::SubmitText { text }) if text == "lights on"));
        assert!(input.is_empty());
    }

    #[test]
    fn enter_keeps_the_buffer_while_busy() {
        let mut snapshot = idle_snapshot();
        snapshot.state = UiState::Searching;
        let mut input = "next".to_string();
        let event = handle_key(press(KeyCode::Enter), &mut input, &snapshot);
        assert!(matches!(event, Some(UiEvent::SubmitText { text }) if text == "next"));
        assert_eq!(input, "next");
    }

    #[test]
    fn enter_with_empty_buffer_is_silent() {
        let snapshot = idle_snapshot();
        let mut input = "   ".to_string();
        assert!(handle_key(press(KeyCode::Enter), &mut input, &snapshot).is_none());
    }

    #[test]
    fn space_triggers_voice_only_with_empty_buffer() {
        let snapshot = idle_snapshot();
        let mut input = String::new();
        let event = handle_key(press(KeyCode::Char(' ')), &mut input, &snapshot);
        assert!(matches!(event, Some(UiEvent::VoiceKey)));
        assert!(input.is_empty());

        input.push('a');
        let event = handle_key(press(KeyCode::Char(' ')), &mut input, &snapshot);
        assert!(event.is_none());
        assert_eq!(input, "a ");
    }

    #[test]
    fn space_while_busy_is_just_a_character() {
        let mut snapshot = idle_snapshot();
        snapshot.state = UiState::Listening;
        let mut input = String::new();
        let event = handle_key(press(KeyCode::Char(' ')), &mut input, &snapshot);
        assert!(event.is_none());
        assert_eq!(input, " ");
    }

    #[test]
    fn escape_always_closes() {
        let mut snapshot = idle_snapshot();
        snapshot.state = UiState::Results;
        let mut input = "draft".to_string();
        let event = handle_key(press(KeyCode::Esc), &mut input, &snapshot);
        assert!(matches!(event, Some(UiEvent::CloseResults)));
        assert_eq!(input, "draft");
    }

    #[test]
    fn quit_keys() {
        let snapshot = idle_snapshot();
        let mut input = String::new();
        assert!(matches!(
            handle_key(press(KeyCode::Char('q')), &mut input, &snapshot),
            Some(UiEvent::Quit)
        ));
        assert!(matches!(
            handle_key(
                KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL),
                &mut input,
                &snapshot
            ),
            Some(UiEvent::Quit)
        ));

        // q inside a word is just a letter
        let mut input = "s".to_string();
        assert!(handle_key(press(KeyCode::Char('q')), &mut input, &snapshot).is_none());
        assert_eq!(input, "sq");
    }

    #[test]
    fn ctrl_s_toggles_the_speaker() {
        let snapshot = idle_snapshot();
        let mut input = String::new();
        let event = handle_key(
            KeyEvent::new(KeyCode::Char('s'), KeyModifiers::CONTROL),
            &mut input,
            &snapshot,
        );
        assert!(matches!(event, Some(UiEvent::ToggleSpeaker)));
    }

    #[test]
    fn key_releases_are_ignored() {
        let snapshot = idle_snapshot();
        let mut input = String::new();
        let release = KeyEvent::new_with_kind(
            KeyCode::Char('q'),
            KeyModifiers::NONE,
            KeyEventKind::Release,
        );
        assert!(handle_key(release, &mut input, &snapshot).is_none());
    }

    #[test]
    fn typing_is_suppressed_under_an_open_card() {
        let mut snapshot = idle_snapshot();
        snapshot.state = UiState::Results;
        snapshot.results = Some(ResultsCard {
            query: "q".to_string(),
            blocks: vec![ResponseBlock::Paragraph("a".to_string())],
        });
        let mut input = String::new();
        assert!(handle_key(press(KeyCode::Char('x')), &mut input, &snapshot).is_none());
        assert!(input.is_empty());
    }

    #[test]
    fn card_lines_render_blocks() {
        let card = ResultsCard {
            query: "weather".to_string(),
            blocks: vec![
                ResponseBlock::Heading("Today:".to_string()),
                ResponseBlock::Bullets(vec!["sunny".to_string(), "21 degrees".to_string()]),
                ResponseBlock::Numbered(vec!["first".to_string()]),
            ],
        };
        let lines = card_lines(&card);
        let rendered: Vec<String> = lines.iter().map(line_text).collect();
        assert_eq!(
            rendered,
            vec![
                "Today:".to_string(),
                String::new(),
                " • sunny".to_string(),
                " • 21 degrees".to_string(),
                String::new(),
                " 1. first".to_string(),
            ]
        );
    }

    #[test]
    fn centered_clamps_to_the_area() {
        let area = Rect::new(0, 0, 80, 24);
        let popup = centered(area, 40, 10);
        assert_eq!(popup, Rect::new(20, 7, 40, 10));

        let oversized = centered(area, 200, 50);
        assert_eq!(oversized, Rect::new(0, 0, 80, 24));
    }
}

use color_eyre::eyre::{Result, eyre};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use lottery_client::{Address, EngineView, LotteryAction, NoticeLevel, Settlement, TxPhase, types::format_ether};
use ratatui::{prelude::*, widgets::*};
use std::io::stdout;
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserEvent {
    Quit,
    Connect,
    Disconnect,
    Action(LotteryAction),
    Refresh,
    Redraw,
}

pub type InputEventReceiver = mpsc::UnboundedReceiver<std::io::Result<Event>>;

#[derive(Default)]
pub struct UiState {
    network: String,
    terminal: Option<Terminal<CrosstermBackend<std::io::Stdout>>>,
}

impl UiState {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            terminal: None,
        }
    }
}

pub fn terminal_enter(state: &mut UiState) -> Result<()> {
    enable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout());
    let terminal = Terminal::new(backend)?;
    state.terminal = Some(terminal);
    Ok(())
}

pub fn terminal_exit() -> Result<()> {
    disable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::LeaveAlternateScreen)?;
    Ok(())
}

pub fn draw(state: &mut UiState, view: &EngineView) -> Result<()> {
    if let Some(mut term) = state.terminal.take() {
        term.draw(|f| ui(f, state, view))?;
        state.terminal = Some(term);
    }
    Ok(())
}

/// Reads terminal events on a dedicated thread, since crossterm's reader blocks.
pub fn input_event_stream() -> InputEventReceiver {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        loop {
            let event = event::read();
            let failed = event.is_err();
            if tx.send(event).is_err() || failed {
                break;
            }
        }
    });
    rx
}

pub async fn next_raw_event(input_events: &mut InputEventReceiver) -> Result<Event> {
    match input_events.recv().await {
        Some(event) => Ok(event?),
        None => Err(eyre!("terminal input closed")),
    }
}

pub fn interpret_event(event: Event) -> Option<UserEvent> {
    match event {
        Event::Key(key) => interpret_key(key),
        Event::Resize(_, _) => Some(UserEvent::Redraw),
        _ => None,
    }
}

fn interpret_key(key: KeyEvent) -> Option<UserEvent> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(UserEvent::Quit)
        }
        KeyCode::Char('q') | KeyCode::Esc => Some(UserEvent::Quit),
        KeyCode::Char('c') => Some(UserEvent::Connect),
        KeyCode::Char('d') => Some(UserEvent::Disconnect),
        KeyCode::Char('e') | KeyCode::Enter => Some(UserEvent::Action(LotteryAction::Enter)),
        KeyCode::Char('s') => Some(UserEvent::Action(LotteryAction::StartRound)),
        KeyCode::Char('x') => Some(UserEvent::Action(LotteryAction::EndRound)),
        KeyCode::Char('r') => Some(UserEvent::Refresh),
        _ => None,
    }
}

fn ui(f: &mut Frame, state: &UiState, view: &EngineView) {
    f.render_widget(Clear, f.area());
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(5), // wallet
            Constraint::Length(8), // round
            Constraint::Length(6), // actions
            Constraint::Min(3),    // status
            Constraint::Length(3), // help
        ])
        .split(f.area());

    draw_wallet_panel(f, chunks[0], state, view);
    draw_lottery_panel(f, chunks[1], view);
    draw_actions_panel(f, chunks[2], view);
    draw_status_panel(f, chunks[3], view);

    let help = Paragraph::new(
        "c connect | d disconnect | e/Enter enter | s start round | x end round | r refresh | q/Esc quit",
    )
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, chunks[4]);
}

fn draw_wallet_panel(f: &mut Frame, area: Rect, state: &UiState, view: &EngineView) {
    let status = &view.status;
    let account = match status.address {
        Some(address) => format!("Connected: {address}"),
        None if status.wallet_available => "Not connected".to_string(),
        None => "No wallet provider".to_string(),
    };
    let chain = status
        .chain_id
        .map_or_else(|| String::from("N/A"), |id| id.to_string());
    let lines = vec![
        Line::from(account),
        Line::from(format!("Network: {} | Chain: {}", state.network, chain)),
        Line::from(format!("Contract: {}", view.contract)),
    ];
    let widget =
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Wallet"));
    f.render_widget(widget, area);
}

fn draw_lottery_panel(f: &mut Frame, area: Rect, view: &EngineView) {
    let title = if view.loading { "Lottery (refreshing)" } else { "Lottery" };
    let lines = match &view.snapshot {
        Some(snapshot) => {
            let state_style = if view.derived.is_round_open {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Red)
            };
            vec![
                Line::from(format!("Round: {}", snapshot.round_id)),
                Line::from(vec![
                    Span::raw("State: "),
                    Span::styled(snapshot.round_state.label(), state_style),
                ]),
                Line::from(format!("Players: {}", snapshot.player_count)),
                Line::from(format!("Last winner: {}", winner_text(snapshot.last_winner))),
                Line::from(format!(
                    "Owner: {}{}",
                    snapshot.owner,
                    if view.derived.is_owner { " (you)" } else { "" }
                )),
                Line::from(format!("Entry fee: {} ETH", format_ether(view.entry_fee))),
            ]
        }
        None if view.loading => vec![Line::from("Loading contract state...")],
        None => vec![Line::from("Contract state unavailable")],
    };
    let widget = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(widget, area);
}

fn draw_actions_panel(f: &mut Frame, area: Rect, view: &EngineView) {
    let derived = &view.derived;
    let mut lines = vec![Line::from(Span::styled(
        derived.primary_action_label.clone(),
        enabled_style(derived.entry_allowed),
    ))];
    if derived.is_owner {
        lines.push(Line::from(vec![
            Span::styled("[s] Start round", enabled_style(derived.can_start_round)),
            Span::raw("  "),
            Span::styled("[x] End round", enabled_style(derived.can_end_round)),
        ]));
    }
    lines.push(Line::from(phase_text(&view.phase)));
    let widget =
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Actions"));
    f.render_widget(widget, area);
}

fn draw_status_panel(f: &mut Frame, area: Rect, view: &EngineView) {
    let widget = match &view.status.notice {
        Some(notice) => {
            let (title, color) = match notice.level {
                NoticeLevel::Info => ("Status", Color::Yellow),
                NoticeLevel::Success => ("Status", Color::Green),
                NoticeLevel::Error => ("Errors", Color::Red),
            };
            Paragraph::new(notice.message.clone())
                .block(Block::default().borders(Borders::ALL).title(title))
                .style(Style::default().fg(color))
        }
        None => Paragraph::new("Ready")
            .block(Block::default().borders(Borders::ALL).title("Status"))
            .style(Style::default().fg(Color::Green)),
    };
    f.render_widget(widget.wrap(Wrap { trim: false }), area);
}

fn enabled_style(enabled: bool) -> Style {
    if enabled {
        Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::DarkGray)
    }
}

fn winner_text(winner: Address) -> String {
    if winner.is_zero() {
        String::from("None yet")
    } else {
        winner.to_string()
    }
}

fn phase_text(phase: &TxPhase) -> String {
    match phase {
        TxPhase::Idle => String::from("No transaction pending"),
        TxPhase::Dispatching(pending) => {
            format!("Waiting for wallet to sign {}...", pending.action)
        }
        TxPhase::AwaitingConfirmation { pending, tx_hash } => {
            format!("{} sent ({}), waiting for confirmation...", pending.action, tx_hash.short())
        }
        TxPhase::Settled(Settlement::Success { action, .. }) => format!("{action} settled"),
        TxPhase::Settled(settlement @ Settlement::Failure { .. }) => settlement.message(),
    }
}

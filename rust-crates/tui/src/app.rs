use crate::{
    cli::ClientConfig,
    ui::{
        self,
        InputEventReceiver,
        UiState,
        UserEvent,
    },
};
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use lottery_client::{
    Engine,
    EngineView,
    HttpTransport,
    LotteryAction,
};

pub enum RunState {
    /// The wallet switched networks; build a fresh engine.
    Reload,
    Exit,
}

/// What a key press asks the engine to do, after the disabled controls are
/// filtered out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Intent {
    Connect,
    Disconnect,
    Action(LotteryAction),
    Refresh,
}

pub async fn run_app(config: ClientConfig) -> Result<()> {
    let mut ui_state = UiState::new(config.network.to_string());
    let mut input_events = ui::input_event_stream();

    tracing::info!("Starting UI");
    ui::terminal_enter(&mut ui_state)?;
    let res = run_sessions(&config, &mut ui_state, &mut input_events).await;
    ui::terminal_exit()?;
    res
}

async fn run_sessions(
    config: &ClientConfig,
    ui_state: &mut UiState,
    input_events: &mut InputEventReceiver,
) -> Result<()> {
    loop {
        let engine = build_engine(config)?;
        let state = run_loop(&engine, ui_state, input_events).await;
        engine.shutdown();
        match state? {
            RunState::Reload => {
                tracing::info!("Wallet switched networks, restarting engine");
            }
            RunState::Exit => return Ok(()),
        }
    }
}

fn build_engine(config: &ClientConfig) -> Result<Engine<HttpTransport>> {
    let timeout = config.engine.request_timeout;
    let fallback = HttpTransport::with_timeout(&config.rpc_url, timeout)
        .wrap_err("building read transport")?;
    let wallet = config
        .wallet_url
        .as_deref()
        .map(|url| HttpTransport::with_timeout(url, timeout))
        .transpose()
        .wrap_err("building wallet transport")?;
    tracing::info!(
        "Using contract {} on {} (reads via {}, wallet {:?})",
        config.engine.contract,
        config.network,
        config.rpc_url,
        config.wallet_url
    );
    Ok(Engine::new(config.engine.clone(), wallet, fallback))
}

async fn run_loop(
    engine: &Engine<HttpTransport>,
    ui_state: &mut UiState,
    input_events: &mut InputEventReceiver,
) -> Result<RunState> {
    tracing::info!("Running app loop");
    let mut watcher = engine.watch();
    ui::draw(ui_state, &engine.view()).wrap_err("initial draw failed")?;
    {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start().await });
    }

    loop {
        tokio::select! {
            alive = watcher.changed() => {
                if !alive {
                    tracing::warn!("engine channels closed");
                    return Ok(RunState::Exit);
                }
                ui::draw(ui_state, &engine.view()).wrap_err("draw after engine update failed")?;
            }
            _ = engine.reload_requested() => {
                return Ok(RunState::Reload);
            }
            _ = tokio::signal::ctrl_c() => {
                return Ok(RunState::Exit);
            }
            raw_ev = ui::next_raw_event(input_events) => {
                let Some(ev) = ui::interpret_event(raw_ev?) else {
                    continue;
                };
                let view = engine.view();
                match ev {
                    UserEvent::Quit => return Ok(RunState::Exit),
                    UserEvent::Redraw => {}
                    other => {
                        if let Some(intent) = intent_for(other, &view) {
                            perform(engine, intent);
                        }
                    }
                }
                ui::draw(ui_state, &engine.view()).wrap_err("draw after input failed")?;
            }
        }
    }
}

/// Mirrors what the controls show: disabled controls do nothing, except that
/// entering without a wallet still reaches the engine so it can explain why.
fn intent_for(event: UserEvent, view: &EngineView) -> Option<Intent> {
    let derived = &view.derived;
    let connected = view.status.address.is_some();
    match event {
        UserEvent::Connect if derived.can_toggle_connection && !connected => {
            Some(Intent::Connect)
        }
        UserEvent::Disconnect if derived.can_toggle_connection && connected => {
            Some(Intent::Disconnect)
        }
        UserEvent::Action(LotteryAction::Enter) if derived.entry_allowed || !connected => {
            Some(Intent::Action(LotteryAction::Enter))
        }
        UserEvent::Action(LotteryAction::StartRound) if derived.can_start_round => {
            Some(Intent::Action(LotteryAction::StartRound))
        }
        UserEvent::Action(LotteryAction::EndRound) if derived.can_end_round => {
            Some(Intent::Action(LotteryAction::EndRound))
        }
        UserEvent::Refresh if !view.loading => Some(Intent::Refresh),
        _ => None,
    }
}

fn perform(engine: &Engine<HttpTransport>, intent: Intent) {
    tracing::debug!(?intent, "user intent");
    match intent {
        Intent::Connect => {
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.request_connect().await {
                    tracing::warn!(%err, "connect request failed");
                }
            });
        }
        Intent::Disconnect => engine.request_disconnect(),
        Intent::Action(action) => {
            // the engine reports the outcome through its notices
            let _ = engine.request_action(action);
        }
        Intent::Refresh => {
            let engine = engine.clone();
            tokio::spawn(async move { engine.refresh().await });
        }
    }
}

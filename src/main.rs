mod api;
mod app;
mod auth;
mod config;
mod mailbox;
mod models;
mod reconcile;
mod session;
mod sync;
mod ui;

use crate::api::HttpApi;
use crate::app::{App, Toggle};
use crate::auth::{IdentityHint, RingStorage};
use crate::config::{Config, Keybindings, matches_key};
use crate::models::EmailId;
use crate::session::TrustState;
use crate::sync::Completion;
use crate::ui::{FocusedPanel, Form, FormKind, UIState};
use anyhow::{Context, bail};
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use futures::StreamExt;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use std::fs::OpenOptions;
use std::io::{self, Stdout};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "ismail_debug.log";

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    debug: bool,
    reset_cache: bool,
    server: Option<String>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut parsed = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--debug" => parsed.debug = true,
                "--reset-cache" => parsed.reset_cache = true,
                "--server" => match args.next() {
                    Some(url) => parsed.server = Some(url),
                    None => bail!("--server needs a URL"),
                },
                other => bail!("Unknown argument: {}", other),
            }
        }
        Ok(parsed)
    }
}

fn init_logging(debug: bool) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_FILE)
        .with_context(|| format!("Failed to open {}", LOG_FILE))?;

    let default_level = if debug { "ismail=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse(std::env::args().skip(1))?;

    if args.reset_cache {
        IdentityHint::new(Box::new(RingStorage)).clear();
        println!("Cached identity cleared.");
        return Ok(());
    }

    init_logging(args.debug)?;

    let mut config = Config::load();
    if let Some(server) = args.server {
        config.server.base_url = server;
    }
    info!(server = %config.server.base_url, "starting");

    let api = HttpApi::new(&config.server.base_url, config.server.timeout())?;
    let hint = IdentityHint::new(Box::new(RingStorage));
    let (mut app, completions) = App::new(Arc::new(api), hint, config.signatures.clone());

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    app.start();
    let result = run(&mut terminal, &mut app, completions, &config.keybindings).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(e) = &result {
        error!("exiting on error: {:#}", e);
    }
    result
}

async fn run(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
    mut completions: mpsc::UnboundedReceiver<Completion>,
    keys: &Keybindings,
) -> anyhow::Result<()> {
    let mut ui_state = UIState::default();
    let mut events = EventStream::new();

    loop {
        terminal.draw(|f| ui::render(f, app, &mut ui_state, keys))?;

        tokio::select! {
            Some(completion) = completions.recv() => {
                if let Some(notice) = app.handle(completion) {
                    ui_state.on_notice(notice);
                }
            }
            event = events.next() => match event {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                    if handle_key(key, app, &mut ui_state, keys) == Flow::Quit {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("Failed to read terminal events"),
                None => break,
            },
        }
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

fn is_ctrl(key: KeyEvent, c: char) -> bool {
    key.code == KeyCode::Char(c) && key.modifiers.contains(KeyModifiers::CONTROL)
}

fn handle_key(key: KeyEvent, app: &mut App, ui_state: &mut UIState<'_>, keys: &Keybindings) -> Flow {
    if is_ctrl(key, 'c') {
        return Flow::Quit;
    }

    match app.session.trust() {
        TrustState::Unknown | TrustState::Checking => {
            if key.code == KeyCode::Esc || matches_key(key, &keys.quit) {
                return Flow::Quit;
            }
            Flow::Continue
        }
        TrustState::Anonymous => handle_auth_key(key, app, ui_state),
        TrustState::Authenticated => {
            if ui_state.popup.is_some() {
                handle_popup_key(key, app, ui_state, keys);
                Flow::Continue
            } else {
                handle_browsing_key(key, app, ui_state, keys)
            }
        }
    }
}

fn handle_auth_key(key: KeyEvent, app: &mut App, ui_state: &mut UIState<'_>) -> Flow {
    let form = &mut ui_state.auth_form;
    match key.code {
        KeyCode::Esc => return Flow::Quit,
        _ if is_ctrl(key, 'r') => {
            *form = match form.kind() {
                FormKind::Register => Form::login(),
                _ => Form::register(),
            };
            app.clear_status();
        }
        KeyCode::Tab => form.next_field(),
        KeyCode::BackTab => form.prev_field(),
        KeyCode::Enter if !form.on_last_field() => form.next_field(),
        KeyCode::Enter => match form.kind() {
            FormKind::Register => {
                app.register(&form.value(0), &form.value(1), &form.value(2), &form.value(3))
            }
            _ => app.login(&form.value(0), &form.value(1)),
        },
        _ => form.input(key),
    }
    Flow::Continue
}

fn handle_popup_key(key: KeyEvent, app: &mut App, ui_state: &mut UIState<'_>, keys: &Keybindings) {
    let Some(form) = &mut ui_state.popup else {
        return;
    };
    let submit = match key.code {
        KeyCode::Esc => {
            ui_state.popup = None;
            app.clear_status();
            return;
        }
        _ if matches_key(key, &keys.send_message) => true,
        KeyCode::Tab => {
            form.next_field();
            false
        }
        KeyCode::BackTab => {
            form.prev_field();
            false
        }
        KeyCode::Enter if !form.focused_is_multiline() => {
            if form.kind() == FormKind::ChangePassword && form.on_last_field() {
                true
            } else {
                form.next_field();
                false
            }
        }
        _ => {
            form.input(key);
            false
        }
    };

    if submit {
        match form.kind() {
            FormKind::ChangePassword => {
                app.change_password(&form.value(0), &form.value(1), &form.value(2))
            }
            _ => app.send(&form.draft()),
        }
    }
}

/// The email an action key applies to: the open one when the detail pane has
/// focus, otherwise the highlighted list row.
fn target_email(app: &App, ui_state: &UIState<'_>) -> Option<EmailId> {
    if ui_state.focused_panel == FocusedPanel::Detail {
        if let Some(email) = app.detail() {
            return Some(email.id);
        }
    }
    ui_state.selected(app.mailbox.emails()).map(|e| e.id)
}

fn handle_browsing_key(
    key: KeyEvent,
    app: &mut App,
    ui_state: &mut UIState<'_>,
    keys: &Keybindings,
) -> Flow {
    if matches_key(key, &keys.quit) {
        return Flow::Quit;
    }

    if key.code == KeyCode::Esc {
        app.close_detail();
        app.clear_status();
        ui_state.detail_scroll = 0;
    } else if matches_key(key, &keys.logout) {
        app.logout();
        *ui_state = UIState::default();
    } else if matches_key(key, &keys.refresh) {
        app.clear_status();
        app.refresh();
    } else if matches_key(key, &keys.change_password) {
        app.clear_status();
        ui_state.popup = Some(Form::change_password());
    } else if matches_key(key, &keys.new_message) {
        app.clear_status();
        ui_state.popup = Some(Form::compose(&app.compose_new()));
    } else if matches_key(key, &keys.reply) {
        if let Some(draft) = target_email(app, ui_state).and_then(|id| app.compose_reply(id)) {
            app.clear_status();
            ui_state.popup = Some(Form::compose(&draft));
        }
    }
    // Panel switching
    else if matches_key(key, &keys.prev_panel) {
        ui_state.focused_panel = match ui_state.focused_panel {
            FocusedPanel::Detail => FocusedPanel::Emails,
            FocusedPanel::Emails | FocusedPanel::Folders => FocusedPanel::Folders,
        };
    } else if matches_key(key, &keys.next_panel) {
        ui_state.focused_panel = match ui_state.focused_panel {
            FocusedPanel::Folders => FocusedPanel::Emails,
            FocusedPanel::Emails | FocusedPanel::Detail => FocusedPanel::Detail,
        };
    }
    // Navigation within panels
    else if matches_key(key, &keys.move_down) {
        match ui_state.focused_panel {
            FocusedPanel::Folders => {
                app.select_folder(app.mailbox.active_folder().next());
                ui_state.selected_email = 0;
                ui_state.detail_scroll = 0;
            }
            FocusedPanel::Emails => {
                if ui_state.selected_email + 1 < app.mailbox.emails().len() {
                    ui_state.selected_email += 1;
                }
            }
            FocusedPanel::Detail => {
                ui_state.detail_scroll = ui_state.detail_scroll.saturating_add(1);
            }
        }
    } else if matches_key(key, &keys.move_up) {
        match ui_state.focused_panel {
            FocusedPanel::Folders => {
                app.select_folder(app.mailbox.active_folder().prev());
                ui_state.selected_email = 0;
                ui_state.detail_scroll = 0;
            }
            FocusedPanel::Emails => {
                ui_state.selected_email = ui_state.selected_email.saturating_sub(1);
            }
            FocusedPanel::Detail => {
                ui_state.detail_scroll = ui_state.detail_scroll.saturating_sub(1);
            }
        }
    }
    // Email actions
    else if matches_key(key, &keys.open) {
        if let Some(id) = ui_state.selected(app.mailbox.emails()).map(|e| e.id) {
            app.clear_status();
            app.open_email(id);
            ui_state.detail_scroll = 0;
        }
    } else if matches_key(key, &keys.mark_read) {
        if let Some(id) = target_email(app, ui_state) {
            app.toggle(id, Toggle::Read);
        }
    } else if matches_key(key, &keys.archive) {
        if let Some(id) = target_email(app, ui_state) {
            app.toggle(id, Toggle::Archive);
        }
    } else if matches_key(key, &keys.delete) {
        if let Some(id) = target_email(app, ui_state) {
            app.delete(id);
            ui_state.clamp_selection(app.mailbox.emails().len());
        }
    }

    Flow::Continue
}

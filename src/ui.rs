use crate::app::{App, Draft, Notice, Status};
use crate::config::Keybindings;
use crate::mailbox::LoadState;
use crate::models::{Email, Folder, User};
use crate::session::TrustState;
use crossterm::event::KeyEvent;
use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
};
use tui_textarea::TextArea;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum FocusedPanel {
    Folders,
    #[default]
    Emails,
    Detail,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FormKind {
    Login,
    Register,
    Compose,
    ChangePassword,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum FieldKind {
    Text,
    Secret,
    Multiline,
}

struct Field<'a> {
    label: &'static str,
    kind: FieldKind,
    input: TextArea<'a>,
}

/// A stack of labelled inputs. Used for every form the client shows.
pub struct Form<'a> {
    kind: FormKind,
    fields: Vec<Field<'a>>,
    focused: usize,
}

impl<'a> Form<'a> {
    fn new(kind: FormKind, specs: &[(&'static str, FieldKind, &str)]) -> Self {
        let fields = specs
            .iter()
            .map(|&(label, kind, initial)| {
                let mut input = TextArea::from(initial.lines());
                input.set_cursor_line_style(Style::default());
                if kind == FieldKind::Secret {
                    input.set_mask_char('\u{2022}');
                }
                Field { label, kind, input }
            })
            .collect();
        let mut form = Self {
            kind,
            fields,
            focused: 0,
        };
        form.focus(0);
        form
    }

    pub fn login() -> Self {
        Self::new(
            FormKind::Login,
            &[
                ("Username", FieldKind::Text, ""),
                ("Password", FieldKind::Secret, ""),
            ],
        )
    }

    pub fn register() -> Self {
        Self::new(
            FormKind::Register,
            &[
                ("Username", FieldKind::Text, ""),
                ("Email", FieldKind::Text, ""),
                ("Password", FieldKind::Secret, ""),
                ("Confirm password", FieldKind::Secret, ""),
            ],
        )
    }

    pub fn compose(draft: &Draft) -> Self {
        let mut form = Self::new(
            FormKind::Compose,
            &[
                ("To", FieldKind::Text, draft.recipient.as_str()),
                ("Subject", FieldKind::Text, draft.subject.as_str()),
                ("Body", FieldKind::Multiline, draft.body.as_str()),
            ],
        );
        // Replies arrive addressed, so typing starts in the body above the quote
        if !draft.recipient.is_empty() {
            form.focus(2);
        }
        form
    }

    pub fn change_password() -> Self {
        Self::new(
            FormKind::ChangePassword,
            &[
                ("Current password", FieldKind::Secret, ""),
                ("New password", FieldKind::Secret, ""),
                ("Confirm new password", FieldKind::Secret, ""),
            ],
        )
    }

    pub fn kind(&self) -> FormKind {
        self.kind
    }

    pub fn value(&self, index: usize) -> String {
        self.fields
            .get(index)
            .map(|f| f.input.lines().join("\n"))
            .unwrap_or_default()
    }

    pub fn draft(&self) -> Draft {
        Draft {
            recipient: self.value(0),
            subject: self.value(1),
            body: self.value(2),
        }
    }

    fn focus(&mut self, index: usize) {
        self.focused = index.min(self.fields.len().saturating_sub(1));
        for (i, field) in self.fields.iter_mut().enumerate() {
            let style = if i == self.focused {
                Style::default().add_modifier(Modifier::REVERSED)
            } else {
                Style::default()
            };
            field.input.set_cursor_style(style);
        }
    }

    pub fn next_field(&mut self) {
        self.focus((self.focused + 1) % self.fields.len().max(1));
    }

    pub fn prev_field(&mut self) {
        let len = self.fields.len().max(1);
        self.focus((self.focused + len - 1) % len);
    }

    pub fn on_last_field(&self) -> bool {
        self.focused + 1 == self.fields.len()
    }

    pub fn focused_is_multiline(&self) -> bool {
        self.fields
            .get(self.focused)
            .is_some_and(|f| f.kind == FieldKind::Multiline)
    }

    pub fn input(&mut self, key: KeyEvent) {
        if let Some(field) = self.fields.get_mut(self.focused) {
            field.input.input(key);
        }
    }
}

pub struct UIState<'a> {
    pub focused_panel: FocusedPanel,
    pub selected_email: usize,
    pub email_list_state: ListState,
    pub detail_scroll: u16,
    pub auth_form: Form<'a>,
    pub popup: Option<Form<'a>>,
}

impl<'a> Default for UIState<'a> {
    fn default() -> Self {
        Self {
            focused_panel: FocusedPanel::default(),
            selected_email: 0,
            email_list_state: ListState::default(),
            detail_scroll: 0,
            auth_form: Form::login(),
            popup: None,
        }
    }
}

impl<'a> UIState<'a> {
    pub fn clamp_selection(&mut self, len: usize) {
        if self.selected_email >= len {
            self.selected_email = len.saturating_sub(1);
        }
    }

    pub fn selected<'e>(&self, emails: &'e [Email]) -> Option<&'e Email> {
        emails.get(self.selected_email)
    }

    pub fn on_notice(&mut self, notice: Notice) {
        match notice {
            Notice::SignedIn | Notice::SignedOut => *self = Self::default(),
            Notice::Sent | Notice::PasswordChanged => self.popup = None,
        }
    }
}

pub fn render(f: &mut Frame, app: &App, state: &mut UIState<'_>, keys: &Keybindings) {
    match app.session.trust() {
        TrustState::Unknown | TrustState::Checking => render_checking(f, app),
        TrustState::Anonymous => render_authentication(f, app, state),
        TrustState::Authenticated => render_mailbox(f, app, state, keys),
    }
}

fn panel_style(focused: bool) -> Style {
    if focused {
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::Gray)
    }
}

/// First configured key for an action, for on-screen hints.
fn hint(bindings: &[String]) -> String {
    match bindings.first().map(String::as_str) {
        Some(" ") => "Space".to_string(),
        Some(key) => key.to_string(),
        None => "?".to_string(),
    }
}

fn render_checking(f: &mut Frame, app: &App) {
    let area = centered_rect(50, 20, f.area());
    f.render_widget(Clear, area);

    // The cached identity is only a greeting; nothing is loaded until the server answers
    let text = match app.session.identity() {
        Some(user) => format!("Welcome back, {}.\n\nChecking your session…", user.username),
        None => "Checking your session…".to_string(),
    };
    let paragraph = Paragraph::new(text)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" ismail ")
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn render_authentication(f: &mut Frame, app: &App, state: &mut UIState<'_>) {
    let area = centered_rect(50, 60, f.area());
    f.render_widget(Clear, area);

    let (title, footer) = match state.auth_form.kind() {
        FormKind::Register => (
            " Create account ",
            "Enter: next / submit   Tab: switch field   Ctrl-R: back to sign in   Esc: quit",
        ),
        _ => (
            " Sign in ",
            "Enter: next / submit   Tab: switch field   Ctrl-R: create an account   Esc: quit",
        ),
    };
    render_form(f, area, title, &mut state.auth_form, footer, app.status());
}

fn render_mailbox(f: &mut Frame, app: &App, state: &mut UIState<'_>, keys: &Keybindings) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(f.area());

    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(15),
            Constraint::Percentage(35),
            Constraint::Percentage(50),
        ])
        .split(rows[0]);

    render_folders(f, app, state, chunks[0]);
    render_email_list(f, app, state, keys, chunks[1]);
    render_detail(f, app, state, chunks[2]);
    render_status_line(f, app, rows[1]);

    if let Some(popup) = &mut state.popup {
        let area = centered_rect(80, 80, f.area());
        f.render_widget(Clear, area);
        let send = hint(&keys.send_message);
        let (title, footer) = match popup.kind() {
            FormKind::ChangePassword => (
                match app.session.identity() {
                    Some(user) => format!(" Change password · {} ", account_summary(user)),
                    None => " Change password ".to_string(),
                },
                "Enter: next / submit   Tab: switch field   Esc: cancel".to_string(),
            ),
            _ => (
                " New message ".to_string(),
                format!("{}: send   Tab: switch field   Esc: cancel", send),
            ),
        };
        render_form(f, area, &title, popup, &footer, app.status());
    }
}

fn account_summary(user: &User) -> String {
    format!(
        "{} <{}> · member since {}",
        user.username,
        user.email,
        user.created_at.format("%b %-d, %Y")
    )
}

fn render_folders(f: &mut Frame, app: &App, state: &UIState<'_>, area: Rect) {
    let active = app.mailbox.active_folder();
    let items: Vec<ListItem> = Folder::ALL
        .iter()
        .map(|folder| {
            let style = if *folder == active {
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            ListItem::new(folder.title()).style(style)
        })
        .collect();

    let block = Block::default()
        .borders(Borders::ALL)
        .title("Folders")
        .border_style(panel_style(state.focused_panel == FocusedPanel::Folders));
    f.render_widget(List::new(items).block(block), area);
}

fn pad(s: String, len: usize) -> String {
    let char_count = s.chars().count();
    if char_count > len {
        let truncated: String = s.chars().take(len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    } else {
        format!("{:width$}", s, width = len)
    }
}

fn render_email_list(
    f: &mut Frame,
    app: &App,
    state: &mut UIState<'_>,
    keys: &Keybindings,
    area: Rect,
) {
    let folder = app.mailbox.active_folder();
    let caps = folder.capabilities();
    let emails = app.mailbox.emails();
    state.clamp_selection(emails.len());

    let mut hints = Vec::new();
    if caps.show_read_toggle {
        hints.push(format!("{}: read", hint(&keys.mark_read)));
    }
    if caps.show_archive_toggle {
        hints.push(format!("{}: archive", hint(&keys.archive)));
    }
    hints.push(format!("{}: delete", hint(&keys.delete)));
    if caps.offers_compose {
        hints.push(format!("{}: compose", hint(&keys.new_message)));
    }
    let title = if app.mailbox.load_state() == LoadState::Loading && !emails.is_empty() {
        format!("{} (refreshing…)", folder)
    } else {
        format!("{} [{}]", folder, hints.join(" "))
    };

    let block = Block::default()
        .borders(Borders::ALL)
        .title(title)
        .border_style(panel_style(state.focused_panel == FocusedPanel::Emails));

    if emails.is_empty() {
        let (text, style) = match app.mailbox.load_state() {
            LoadState::Idle | LoadState::Loading => (
                format!("⏳ Loading \"{}\"…\n\n  Please wait.", folder),
                Style::default().fg(Color::Yellow),
            ),
            LoadState::Failed => (
                app.mailbox.error().unwrap_or("Failed to load emails").to_string(),
                Style::default().fg(Color::Red),
            ),
            LoadState::Ready => (
                caps.empty_message.to_string(),
                Style::default().fg(Color::DarkGray),
            ),
        };
        let paragraph = Paragraph::new(text)
            .block(block)
            .style(style)
            .wrap(Wrap { trim: true });
        f.render_widget(paragraph, area);
        return;
    }

    let inner_len = (area.width.saturating_sub(2) as usize).saturating_sub(2);
    let separator = "─".repeat(inner_len);
    let mut items: Vec<ListItem> = Vec::new();

    for (i, email) in emails.iter().enumerate() {
        let is_selected = i == state.selected_email;
        let correspondent = if folder == Folder::Sent {
            format!(" To: {}", app.user_name(email.recipient_id))
        } else {
            format!(" From: {}", app.user_name(email.sender_id))
        };
        let time = format!(" Time: {}", email.created_at.format("%b %d %Y @ %-I:%M%p"));

        let mut markers = String::new();
        if app.reconciler.is_pending(email.id) {
            markers.push_str("⋯ ");
        }
        if email.is_archived && folder != Folder::Archived {
            markers.push_str("[archived] ");
        }
        let subject = format!(" {}Subj: {}", markers, email.subject);

        let mut style = if is_selected {
            Style::default().fg(Color::Yellow)
        } else {
            Style::default()
        };
        if !email.is_read && folder != Folder::Sent {
            style = style.add_modifier(Modifier::BOLD);
        }

        let indicator = if is_selected { "█" } else { " " };
        let text = format!(
            "{i}{}\n{i}{}\n{i}{}",
            pad(correspondent, inner_len),
            pad(time, inner_len),
            pad(subject, inner_len),
            i = indicator
        );
        items.push(ListItem::new(text).style(style));
        if i + 1 < emails.len() {
            items.push(ListItem::new(separator.clone()).style(Style::default().fg(Color::DarkGray)));
        }
    }

    // Every email is followed by a separator row
    state.email_list_state.select(Some(state.selected_email * 2));
    f.render_stateful_widget(List::new(items).block(block), area, &mut state.email_list_state);
}

fn render_detail(f: &mut Frame, app: &App, state: &UIState<'_>, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Email")
        .border_style(panel_style(state.focused_panel == FocusedPanel::Detail));

    let content = match app.detail() {
        Some(email) => {
            let mut flags = Vec::new();
            if email.is_spam {
                flags.push("spam");
            }
            if email.is_archived {
                flags.push("archived");
            }
            if !email.is_read {
                flags.push("unread");
            }
            let mut text = format!(
                "From: {}\nTo: {}\nDate: {}\nSubject: {}\n",
                app.user_name(email.sender_id),
                app.user_name(email.recipient_id),
                email.created_at.format("%Y-%m-%d %H:%M"),
                email.subject,
            );
            if !flags.is_empty() {
                text.push_str(&format!("Flags: {}\n", flags.join(", ")));
            }
            if app.detail_loading() {
                text.push_str("\nLoading…");
            } else {
                text.push('\n');
                text.push_str(&clean_body(&email.body));
            }
            text
        }
        None if app.detail_loading() => "Loading…".to_string(),
        None => "No email selected".to_string(),
    };

    let paragraph = Paragraph::new(content)
        .block(block)
        .wrap(Wrap { trim: false })
        .scroll((state.detail_scroll, 0));
    f.render_widget(paragraph, area);
}

fn render_status_line(f: &mut Frame, app: &App, area: Rect) {
    let (text, style) = match app.status() {
        Some(Status::Error(message)) => (format!(" {}", message), Style::default().fg(Color::Red)),
        Some(Status::Info(message)) => (format!(" {}", message), Style::default().fg(Color::Green)),
        None => {
            let who = app
                .session
                .identity()
                .map(|u| u.username.clone())
                .unwrap_or_default();
            let count = app.mailbox.emails().len();
            let mut text = format!(" {} · {} · {} emails", who, app.mailbox.active_folder(), count);
            let pending = app.reconciler.pending().count();
            if pending > 0 {
                text.push_str(&format!(" · {} pending", pending));
            }
            (text, Style::default().fg(Color::DarkGray))
        }
    };
    f.render_widget(Paragraph::new(text).style(style), area);
}

fn render_form(
    f: &mut Frame,
    area: Rect,
    title: &str,
    form: &mut Form<'_>,
    footer: &str,
    status: Option<&Status>,
) {
    let block = Block::default()
        .title(title.to_string())
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));
    let inner = block.inner(area);
    f.render_widget(block, area);

    let mut constraints: Vec<Constraint> = form
        .fields
        .iter()
        .map(|field| match field.kind {
            FieldKind::Multiline => Constraint::Min(5),
            _ => Constraint::Length(3),
        })
        .collect();
    if !form.fields.iter().any(|field| field.kind == FieldKind::Multiline) {
        constraints.push(Constraint::Min(0));
    }
    constraints.push(Constraint::Length(2));

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints(constraints)
        .split(inner);

    let focused = form.focused;
    for (i, field) in form.fields.iter_mut().enumerate() {
        let style = if i == focused {
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::Gray)
        };
        field.input.set_block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!(" {} ", field.label))
                .border_style(style),
        );
        f.render_widget(&field.input, chunks[i]);
    }

    let (text, style) = match status {
        Some(Status::Error(message)) => (message.clone(), Style::default().fg(Color::Red)),
        Some(Status::Info(message)) => (message.clone(), Style::default().fg(Color::Green)),
        None => (footer.to_string(), Style::default().fg(Color::Gray)),
    };
    let footer = Paragraph::new(text).style(style).wrap(Wrap { trim: true });
    if let Some(last) = chunks.last() {
        f.render_widget(footer, *last);
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

/// Normalizes line endings, trims trailing whitespace and collapses runs of
/// blank lines to one.
fn clean_body(body: &str) -> String {
    let normalized = body.replace("\r\n", "\n").replace('\r', "\n");
    let mut result = String::with_capacity(normalized.len());
    let mut blank_run = 0;

    for line in normalized.split('\n').map(str::trim_end) {
        if line.is_empty() {
            blank_run += 1;
            continue;
        }
        if !result.is_empty() {
            result.push_str(if blank_run > 0 { "\n\n" } else { "\n" });
        }
        result.push_str(line);
        blank_run = 0;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeApi;
    use crate::auth::IdentityHint;
    use crate::auth::memory::MemoryStore;
    use crate::config::Signatures;
    use crate::models::tests::{email, user};
    use crossterm::event::{KeyCode, KeyModifiers};
    use ratatui::{Terminal, backend::TestBackend};
    use std::sync::Arc;

    fn signed_in_app() -> App {
        let api = Arc::new(FakeApi::default());
        let hint = IdentityHint::new(Box::new(MemoryStore::default()));
        let (mut app, _rx) = App::new(api, hint, Signatures::default());
        app.session.login(user(1, "emin"));
        app
    }

    fn draw(app: &App, state: &mut UIState<'_>) -> String {
        let mut terminal = Terminal::new(TestBackend::new(120, 30)).unwrap();
        let keys = Keybindings::default();
        terminal.draw(|f| render(f, app, state, &keys)).unwrap();

        let buffer = terminal.backend().buffer();
        let mut text = String::new();
        for y in 0..buffer.area.height {
            for x in 0..buffer.area.width {
                text.push_str(buffer[(x, y)].symbol());
            }
            text.push('\n');
        }
        text
    }

    #[test]
    fn clean_body_collapses_blank_runs() {
        assert_eq!(clean_body("a\n\n\n\nb\n \t\nc"), "a\n\nb\n\nc");
        assert_eq!(clean_body("\r\n\r\nhello  \r\nworld\r\n"), "hello\nworld");
        assert_eq!(clean_body(""), "");
    }

    #[test]
    fn compose_form_round_trips_draft() {
        let draft = Draft {
            recipient: "ayse".into(),
            subject: "Re: lunch".into(),
            body: "\n\nsee you".into(),
        };
        let form = Form::compose(&draft);
        assert_eq!(form.draft(), draft);
        assert!(form.focused_is_multiline());

        let blank = Form::compose(&Draft::default());
        assert!(!blank.focused_is_multiline());
    }

    #[test]
    fn form_focus_wraps_and_accepts_input() {
        let mut form = Form::login();
        form.input(KeyEvent::new(KeyCode::Char('e'), KeyModifiers::empty()));
        form.next_field();
        assert!(form.on_last_field());
        form.input(KeyEvent::new(KeyCode::Char('x'), KeyModifiers::empty()));
        form.next_field();
        assert!(!form.on_last_field());

        assert_eq!(form.value(0), "e");
        assert_eq!(form.value(1), "x");
        assert_eq!(form.value(7), "");
    }

    #[test]
    fn anonymous_client_sees_sign_in() {
        let api = Arc::new(FakeApi::default());
        let hint = IdentityHint::new(Box::new(MemoryStore::default()));
        let (mut app, _rx) = App::new(api, hint, Signatures::default());
        app.session.logout();

        let screen = draw(&app, &mut UIState::default());
        assert!(screen.contains("Sign in"));
        assert!(screen.contains("Username"));
    }

    #[test]
    fn empty_folder_shows_its_own_message() {
        let mut app = signed_in_app();
        let ticket = app.mailbox.select_folder(Folder::Spam).unwrap();
        app.mailbox.complete_fetch(ticket, Ok(Vec::new()));

        let screen = draw(&app, &mut UIState::default());
        assert!(screen.contains("No spam emails detected."));
    }

    #[test]
    fn list_shows_emails_and_clamps_selection() {
        let mut app = signed_in_app();
        let ticket = app.mailbox.select_folder(Folder::Inbox).unwrap();
        app.mailbox.complete_fetch(ticket, Ok(vec![email(1), email(2)]));

        let mut state = UIState {
            selected_email: 9,
            ..UIState::default()
        };
        let screen = draw(&app, &mut state);
        assert!(screen.contains("Subj: subject 1"));
        assert!(screen.contains("Subj: subject 2"));
        assert_eq!(state.selected_email, 1);
    }

    #[test]
    fn change_password_popup_shows_account() {
        let app = signed_in_app();
        let mut state = UIState {
            popup: Some(Form::change_password()),
            ..UIState::default()
        };
        let screen = draw(&app, &mut state);
        assert!(screen.contains("emin <emin@example.com> · member since Jan 1, 2024"));
    }
}

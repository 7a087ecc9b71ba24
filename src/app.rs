use crate::api::{ApiError, MailApi};
use crate::auth::IdentityHint;
use crate::config::Signatures;
use crate::mailbox::{FetchOutcome, Mailbox};
use crate::models::{
    ActionKind, Credentials, Email, EmailId, Folder, OutgoingEmail, PasswordChange,
    Registration, User, UserId,
};
use crate::reconcile::{ActionOutcome, Dispatch, Reconciler};
use crate::session::{CheckOutcome, SessionStore};
use crate::sync::{Completion, Syncer};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Info(String),
    Error(String),
}

/// Transitions the presentation layer reacts to (switching screens, closing forms).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    SignedIn,
    SignedOut,
    Sent,
    PasswordChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Read,
    Archive,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

const ORIGINAL_MESSAGE_MARKER: &str = "------------ Original Message ------------";

/// Owns the session, the mailbox view and the action reconciler, and feeds
/// them the results of the requests it issues.
pub struct App {
    pub session: SessionStore,
    pub mailbox: Mailbox,
    pub reconciler: Reconciler,
    syncer: Syncer,
    directory: Vec<User>,
    detail: Option<Email>,
    detail_request: Option<EmailId>,
    status: Option<Status>,
    signatures: Signatures,
}

impl App {
    pub fn new(
        api: Arc<dyn MailApi>,
        hint: IdentityHint,
        signatures: Signatures,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (syncer, rx) = Syncer::new(api);
        let app = Self {
            session: SessionStore::new(hint),
            mailbox: Mailbox::default(),
            reconciler: Reconciler::default(),
            syncer,
            directory: Vec::new(),
            detail: None,
            detail_request: None,
            status: None,
            signatures,
        };
        (app, rx)
    }

    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    pub fn clear_status(&mut self) {
        self.status = None;
    }

    fn info(&mut self, message: impl Into<String>) {
        self.status = Some(Status::Info(message.into()));
    }

    fn error(&mut self, message: impl Into<String>) {
        self.status = Some(Status::Error(message.into()));
    }

    /// The email open in the detail pane, with flags taken from the list when it
    /// is still there (the list carries the optimistic edits).
    pub fn detail(&self) -> Option<Email> {
        let mut email = self.detail.clone()?;
        if let Some(listed) = self.mailbox.email(email.id) {
            email.is_read = listed.is_read;
            email.is_archived = listed.is_archived;
            email.is_spam = listed.is_spam;
        }
        Some(email)
    }

    pub fn detail_loading(&self) -> bool {
        self.detail_request.is_some() && self.detail.is_none()
    }

    pub fn user_name(&self, id: UserId) -> String {
        self.directory
            .iter()
            .find(|u| u.id == id)
            .map(|u| u.username.clone())
            .unwrap_or_else(|| format!("user #{}", id))
    }

    /// Everyone the current user can write to.
    pub fn recipients(&self) -> impl Iterator<Item = &User> {
        let me = self.session.identity().map(|u| u.id);
        self.directory.iter().filter(move |u| Some(u.id) != me)
    }

    // Session

    pub fn start(&mut self) {
        if self.session.begin_bootstrap() {
            self.syncer.check_auth();
        }
    }

    pub fn login(&mut self, username: &str, password: &str) {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            self.reject(ApiError::Validation("Missing required fields".into()));
            return;
        }
        self.info("Signing in...");
        self.syncer.login(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    pub fn register(&mut self, username: &str, email: &str, password: &str, confirm: &str) {
        let (username, email) = (username.trim(), email.trim());
        if username.is_empty() || email.is_empty() || password.is_empty() || confirm.is_empty() {
            self.reject(ApiError::Validation("Missing required fields".into()));
            return;
        }
        if !email.contains('@') {
            self.reject(ApiError::Validation("Please enter a valid email address".into()));
            return;
        }
        if password != confirm {
            self.reject(ApiError::Validation("Passwords do not match".into()));
            return;
        }
        self.info("Creating account...");
        self.syncer.register(Registration {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
            confirm_password: confirm.to_string(),
        });
    }

    pub fn logout(&mut self) {
        self.session.logout();
        self.clear_view();
        self.syncer.logout();
        self.info("Logged out");
    }

    pub fn change_password(&mut self, old: &str, new: &str, confirm: &str) {
        if !self.session.is_authenticated() {
            return;
        }
        if old.is_empty() || new.is_empty() || confirm.is_empty() {
            self.reject(ApiError::Validation("Missing required fields".into()));
            return;
        }
        if old == new {
            self.reject(ApiError::Validation(
                "New password cannot be the same as old password".into(),
            ));
            return;
        }
        if new != confirm {
            self.reject(ApiError::Validation("New passwords do not match".into()));
            return;
        }
        self.syncer.change_password(PasswordChange {
            old_password: old.to_string(),
            new_password: new.to_string(),
        });
    }

    /// Surfaces a failed request; connectivity failures get a retry hint.
    fn fail(&mut self, err: &ApiError) {
        if err.is_retryable() {
            self.error(format!("{}. Please try again.", err));
        } else {
            self.error(err.to_string());
        }
    }

    fn reject(&mut self, err: ApiError) {
        debug!("rejected locally: {}", err);
        self.error(err.to_string());
    }

    // Mailbox

    pub fn select_folder(&mut self, folder: Folder) {
        if !self.session.is_authenticated() {
            debug!(%folder, "not authenticated, ignoring folder selection");
            return;
        }
        if folder != self.mailbox.active_folder() {
            self.close_detail();
        }
        if let Some(ticket) = self.mailbox.select_folder(folder) {
            self.syncer.fetch(ticket);
        }
    }

    /// Re-fetches the active folder and re-confirms the session with the server.
    pub fn refresh(&mut self) {
        if !self.session.is_authenticated() {
            return;
        }
        let ticket = self.mailbox.refresh();
        self.syncer.fetch(ticket);
        if self.session.begin_recheck() {
            self.syncer.check_auth();
        }
    }

    pub fn apply_action(&mut self, id: EmailId, kind: ActionKind) {
        if !self.session.is_authenticated() {
            return;
        }
        match self.reconciler.apply_action(&mut self.mailbox, id, kind) {
            Dispatch::Issued(request) => self.syncer.confirm_action(request),
            Dispatch::Queued => self.info("Waiting for the previous change to this email"),
            Dispatch::NotInView => debug!(id, %kind, "email not in view, action ignored"),
        }
    }

    /// Resolves a toggle key against the active folder's capabilities and the
    /// email's current flags.
    pub fn toggle(&mut self, id: EmailId, toggle: Toggle) {
        let folder = self.mailbox.active_folder();
        let caps = folder.capabilities();
        let allowed = match toggle {
            Toggle::Read => caps.show_read_toggle,
            Toggle::Archive => caps.show_archive_toggle,
        };
        if !allowed {
            self.info(format!("Not available in {}", folder));
            return;
        }
        let Some(email) = self.mailbox.email(id) else {
            return;
        };
        let kind = match toggle {
            Toggle::Read => ActionKind::toggle_read(email),
            Toggle::Archive => ActionKind::toggle_archive(email),
        };
        self.apply_action(id, kind);
    }

    pub fn delete(&mut self, id: EmailId) {
        if self.detail_request == Some(id) {
            self.close_detail();
        }
        self.apply_action(id, ActionKind::Delete);
    }

    pub fn open_email(&mut self, id: EmailId) {
        if !self.session.is_authenticated() {
            return;
        }
        let listed = self.mailbox.email(id).cloned();
        self.detail = listed.clone();
        self.detail_request = Some(id);
        self.syncer.load_detail(id);

        // Opening an unread email addressed to us marks it read, unless a change
        // to it is still settling
        let me = self.session.identity().map(|u| u.id);
        if let Some(email) = listed {
            if !email.is_read && Some(email.recipient_id) == me && !self.reconciler.is_pending(id) {
                self.apply_action(id, ActionKind::Read);
            }
        }
    }

    pub fn close_detail(&mut self) {
        self.detail = None;
        self.detail_request = None;
    }

    // Compose

    pub fn compose_new(&self) -> Draft {
        Draft {
            body: self
                .signatures
                .new_message
                .as_ref()
                .map(|sig| format!("\n\n{}", sig))
                .unwrap_or_default(),
            ..Draft::default()
        }
    }

    pub fn compose_reply(&self, id: EmailId) -> Option<Draft> {
        let original = self
            .detail
            .clone()
            .filter(|e| e.id == id)
            .or_else(|| self.mailbox.email(id).cloned())?;

        let recipient = self
            .directory
            .iter()
            .find(|u| u.id == original.sender_id)
            .map(|u| u.username.clone())
            .unwrap_or_default();
        let subject = if original.subject.starts_with("Re: ") {
            original.subject.clone()
        } else {
            format!("Re: {}", original.subject)
        };
        let quote = format!("{}\n{}", ORIGINAL_MESSAGE_MARKER, original.body);
        let body = match &self.signatures.reply {
            Some(sig) => format!("\n\n{}\n\n{}", sig, quote),
            None => format!("\n\n{}", quote),
        };

        Some(Draft {
            recipient,
            subject,
            body,
        })
    }

    pub fn send(&mut self, draft: &Draft) {
        if !self.session.is_authenticated() {
            return;
        }
        match self.validate_draft(draft) {
            Ok(email) => {
                self.info("Sending...");
                self.syncer.send(email);
            }
            Err(e) => self.reject(e),
        }
    }

    fn validate_draft(&self, draft: &Draft) -> Result<OutgoingEmail, ApiError> {
        let wanted = draft.recipient.trim();
        if wanted.is_empty() {
            return Err(ApiError::Validation("Please choose a recipient".into()));
        }
        let recipient = self
            .recipients()
            .find(|u| u.username.eq_ignore_ascii_case(wanted) || u.email.eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ApiError::Validation(format!("Unknown recipient: {}", wanted)))?;
        if draft.subject.trim().is_empty() || draft.body.trim().is_empty() {
            return Err(ApiError::Validation("Missing required fields".into()));
        }
        Ok(OutgoingEmail {
            recipient_id: recipient.id,
            subject: draft.subject.trim().to_string(),
            body: draft.body.clone(),
        })
    }

    // Completions

    pub fn handle(&mut self, completion: Completion) -> Option<Notice> {
        match completion {
            Completion::AuthChecked(result) => {
                let was_authenticated = self.session.is_authenticated();
                match self.session.complete_check(result) {
                    CheckOutcome::Confirmed(_) if !was_authenticated => {
                        self.on_signed_in();
                        Some(Notice::SignedIn)
                    }
                    CheckOutcome::Confirmed(_) | CheckOutcome::Ignored => None,
                    CheckOutcome::SignedOut(err) => {
                        self.clear_view();
                        if was_authenticated {
                            self.error("Your session has expired. Please log in again.");
                        } else if let Some(err) = err {
                            self.error(err.to_string());
                        }
                        Some(Notice::SignedOut)
                    }
                    CheckOutcome::Retained(err) => {
                        self.fail(&err);
                        None
                    }
                }
            }
            Completion::LoggedIn(result) => match result {
                Ok(user) if !self.session.is_authenticated() => {
                    self.session.login(user);
                    self.on_signed_in();
                    Some(Notice::SignedIn)
                }
                Ok(_) => None,
                Err(e) => {
                    self.fail(&e);
                    None
                }
            },
            Completion::Registered(result) => {
                if self.session.is_authenticated() {
                    return None;
                }
                match self.session.register_result(result) {
                    Ok(()) => {
                        self.on_signed_in();
                        Some(Notice::SignedIn)
                    }
                    Err(message) => {
                        self.error(message);
                        None
                    }
                }
            }
            Completion::LoggedOut(result) => {
                if let Err(e) = result {
                    warn!("Server logout failed: {}", e);
                }
                None
            }
            Completion::Fetched { ticket, result } => {
                match self.mailbox.complete_fetch(ticket, result) {
                    FetchOutcome::Applied | FetchOutcome::Superseded => None,
                    FetchOutcome::Failed(message) => {
                        self.error(message);
                        None
                    }
                    FetchOutcome::AuthRejected => self.session_rejected(),
                }
            }
            Completion::ActionSettled { request, result } => {
                let settled = self
                    .reconciler
                    .complete_action(&mut self.mailbox, request, result);
                if let ActionOutcome::Failed {
                    message,
                    rolled_back,
                    session_rejected,
                } = settled.outcome
                {
                    if !rolled_back {
                        debug!(id = request.email_id, "view changed since the action, nothing to roll back");
                    }
                    self.error(message);
                    if session_rejected {
                        return self.session_rejected();
                    }
                }
                if let Some(next) = settled.next {
                    self.syncer.confirm_action(next);
                }
                None
            }
            Completion::DetailLoaded { id, result } => {
                if self.detail_request != Some(id) {
                    debug!(id, "dropping superseded detail");
                    return None;
                }
                match result {
                    Ok(email) => {
                        self.detail = Some(email);
                        None
                    }
                    Err(e) if e.is_auth_rejected() => self.session_rejected(),
                    Err(e) => {
                        self.error(format!("Failed to fetch email details: {}", e));
                        None
                    }
                }
            }
            Completion::Sent(result) => match result {
                Ok(email) => {
                    info!(id = email.id, "email sent");
                    self.info("Email sent successfully!");
                    if self.mailbox.active_folder() == Folder::Sent && self.session.is_authenticated() {
                        let ticket = self.mailbox.refresh();
                        self.syncer.fetch(ticket);
                    }
                    Some(Notice::Sent)
                }
                Err(e) if e.is_auth_rejected() => self.session_rejected(),
                Err(e) => {
                    self.fail(&e);
                    None
                }
            },
            Completion::Directory(result) => match result {
                Ok(users) if self.session.is_authenticated() => {
                    self.directory = users;
                    None
                }
                Ok(_) => None,
                Err(e) if e.is_auth_rejected() => self.session_rejected(),
                Err(e) => {
                    self.error(format!("Failed to fetch users: {}", e));
                    None
                }
            },
            Completion::PasswordChanged(result) => match result {
                Ok(()) => {
                    self.info("Password changed successfully");
                    Some(Notice::PasswordChanged)
                }
                Err(e) => {
                    // "Old password is incorrect" is also a 401; let the server
                    // tell us whether the session itself is still good
                    if e.is_auth_rejected() && self.session.begin_recheck() {
                        self.syncer.check_auth();
                    }
                    self.error(e.to_string());
                    None
                }
            },
        }
    }

    fn on_signed_in(&mut self) {
        self.status = None;
        self.select_folder(Folder::Inbox);
        self.syncer.load_directory();
    }

    fn session_rejected(&mut self) -> Option<Notice> {
        if !self.session.is_authenticated() {
            return None;
        }
        self.session.invalidate();
        self.clear_view();
        self.error("Your session has expired. Please log in again.");
        Some(Notice::SignedOut)
    }

    fn clear_view(&mut self) {
        self.mailbox.clear();
        self.reconciler.clear();
        self.directory.clear();
        self.close_detail();
    }
}

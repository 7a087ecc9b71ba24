use crate::api::{ApiResult, MailApi};
use crate::mailbox::FetchTicket;
use crate::models::{
    Credentials, Email, EmailId, OutgoingEmail, PasswordChange, Registration, User,
};
use crate::reconcile::ActionRequest;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A finished network call, delivered back to the control loop.
#[derive(Debug)]
pub enum Completion {
    AuthChecked(ApiResult<Option<User>>),
    LoggedIn(ApiResult<User>),
    Registered(ApiResult<User>),
    LoggedOut(ApiResult<()>),
    Fetched {
        ticket: FetchTicket,
        result: ApiResult<Vec<Email>>,
    },
    ActionSettled {
        request: ActionRequest,
        result: ApiResult<()>,
    },
    DetailLoaded {
        id: EmailId,
        result: ApiResult<Email>,
    },
    Sent(ApiResult<Email>),
    Directory(ApiResult<Vec<User>>),
    PasswordChanged(ApiResult<()>),
}

/// Runs every request as its own task. Nothing here touches client state: results
/// come back as [`Completion`]s, in whatever order the server answers.
#[derive(Clone)]
pub struct Syncer {
    api: Arc<dyn MailApi>,
    tx: mpsc::UnboundedSender<Completion>,
}

impl Syncer {
    pub fn new(api: Arc<dyn MailApi>) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { api, tx }, rx)
    }

    fn spawn<F, Fut>(&self, call: F)
    where
        F: FnOnce(Arc<dyn MailApi>) -> Fut,
        Fut: std::future::Future<Output = Completion> + Send + 'static,
    {
        let tx = self.tx.clone();
        let fut = call(self.api.clone());
        tokio::spawn(async move {
            let completion = fut.await;
            if tx.send(completion).is_err() {
                debug!("control loop gone, dropping completion");
            }
        });
    }

    pub fn check_auth(&self) {
        self.spawn(|api| async move { Completion::AuthChecked(api.check_auth().await) });
    }

    pub fn login(&self, credentials: Credentials) {
        self.spawn(|api| async move { Completion::LoggedIn(api.login(&credentials).await) });
    }

    pub fn register(&self, registration: Registration) {
        self.spawn(|api| async move { Completion::Registered(api.register(&registration).await) });
    }

    pub fn logout(&self) {
        self.spawn(|api| async move { Completion::LoggedOut(api.logout().await) });
    }

    pub fn fetch(&self, ticket: FetchTicket) {
        self.spawn(move |api| async move {
            let result = api.list_folder(ticket.folder).await;
            Completion::Fetched { ticket, result }
        });
    }

    pub fn confirm_action(&self, request: ActionRequest) {
        self.spawn(move |api| async move {
            let result = api.email_action(request.email_id, request.kind).await;
            Completion::ActionSettled { request, result }
        });
    }

    pub fn load_detail(&self, id: EmailId) {
        self.spawn(move |api| async move {
            let result = api.get_email(id).await;
            Completion::DetailLoaded { id, result }
        });
    }

    pub fn send(&self, email: OutgoingEmail) {
        self.spawn(|api| async move { Completion::Sent(api.send_email(&email).await) });
    }

    pub fn load_directory(&self) {
        self.spawn(|api| async move { Completion::Directory(api.list_users().await) });
    }

    pub fn change_password(&self, change: PasswordChange) {
        self.spawn(|api| async move { Completion::PasswordChanged(api.change_password(&change).await) });
    }
}

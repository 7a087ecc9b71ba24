use crate::api::{ApiError, ApiResult};
use crate::models::{Email, EmailId, Folder};
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Idle,
    Loading,
    Ready,
    Failed,
}

/// Identifies one issued folder fetch. The response is only applied while
/// `generation` is still the mailbox's current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub folder: Folder,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied,
    /// A later selection or refresh already replaced this request.
    Superseded,
    Failed(String),
    /// The server refused the session; the caller signs out.
    AuthRejected,
}

/// The one mailbox view the client displays.
#[derive(Debug, Default)]
pub struct Mailbox {
    active_folder: Folder,
    emails: Vec<Email>,
    load_state: LoadState,
    fetch_generation: u64,
    /// Bumped whenever `emails` is replaced wholesale; issuing a refresh does not count.
    view_epoch: u64,
    error: Option<String>,
}

impl Mailbox {
    pub fn active_folder(&self) -> Folder {
        self.active_folder
    }

    pub fn emails(&self) -> &[Email] {
        &self.emails
    }

    pub fn load_state(&self) -> LoadState {
        self.load_state
    }

    pub fn generation(&self) -> u64 {
        self.fetch_generation
    }

    pub fn view_epoch(&self) -> u64 {
        self.view_epoch
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Makes `folder` active. Returns the fetch to issue, or `None` when the
    /// folder is already displayed and loaded.
    pub fn select_folder(&mut self, folder: Folder) -> Option<FetchTicket> {
        if folder == self.active_folder && self.load_state == LoadState::Ready {
            debug!(%folder, "folder already loaded, not refetching");
            return None;
        }
        if folder != self.active_folder {
            // Never show one folder's emails under another folder's title
            self.emails.clear();
            self.view_epoch += 1;
        }
        self.active_folder = folder;
        Some(self.begin_fetch())
    }

    /// Re-fetches the active folder; current emails stay visible until the answer lands.
    pub fn refresh(&mut self) -> FetchTicket {
        self.begin_fetch()
    }

    fn begin_fetch(&mut self) -> FetchTicket {
        self.fetch_generation += 1;
        self.load_state = LoadState::Loading;
        self.error = None;
        let ticket = FetchTicket {
            folder: self.active_folder,
            generation: self.fetch_generation,
        };
        info!(folder = %ticket.folder, generation = ticket.generation, "fetching folder");
        ticket
    }

    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.generation == self.fetch_generation
    }

    pub fn complete_fetch(&mut self, ticket: FetchTicket, result: ApiResult<Vec<Email>>) -> FetchOutcome {
        if !self.is_current(&ticket) {
            debug!(
                folder = %ticket.folder,
                generation = ticket.generation,
                current = self.fetch_generation,
                "discarding superseded fetch"
            );
            return FetchOutcome::Superseded;
        }

        match result {
            Ok(emails) => {
                self.emails = normalize(ticket.folder, emails);
                self.view_epoch += 1;
                self.load_state = LoadState::Ready;
                self.error = None;
                info!(folder = %ticket.folder, count = self.emails.len(), "folder loaded");
                FetchOutcome::Applied
            }
            Err(ApiError::AuthRejected(reason)) => {
                warn!(folder = %ticket.folder, "fetch rejected: {}", reason);
                FetchOutcome::AuthRejected
            }
            Err(e) => {
                warn!(folder = %ticket.folder, "fetch failed: {}", e);
                let message = e.to_string();
                self.load_state = LoadState::Failed;
                self.error = Some(message.clone());
                FetchOutcome::Failed(message)
            }
        }
    }

    /// Drops the view entirely, e.g. on logout. Outstanding fetches become stale.
    pub fn clear(&mut self) {
        self.fetch_generation += 1;
        self.view_epoch += 1;
        self.emails.clear();
        self.load_state = LoadState::Idle;
        self.error = None;
        self.active_folder = Folder::default();
    }

    // Mutation surface for optimistic actions

    pub fn email(&self, id: EmailId) -> Option<&Email> {
        self.emails.iter().find(|e| e.id == id)
    }

    pub fn email_mut(&mut self, id: EmailId) -> Option<&mut Email> {
        self.emails.iter_mut().find(|e| e.id == id)
    }

    /// Removes the email, returning where it sat so it can be put back.
    pub fn remove_email(&mut self, id: EmailId) -> Option<(usize, Email)> {
        let index = self.emails.iter().position(|e| e.id == id)?;
        Some((index, self.emails.remove(index)))
    }

    /// Re-inserts a removed email at its old index (clamped). Refuses duplicates.
    pub fn restore_email(&mut self, index: usize, email: Email) -> bool {
        if self.email(email.id).is_some() {
            return false;
        }
        let index = index.min(self.emails.len());
        self.emails.insert(index, email);
        true
    }
}

/// Server order is kept; duplicate ids keep their first occurrence.
fn normalize(folder: Folder, emails: Vec<Email>) -> Vec<Email> {
    let mut seen = HashSet::new();
    emails
        .into_iter()
        .filter(|e| seen.insert(e.id))
        .map(|mut e| {
            folder.apply_implied_flags(&mut e);
            e
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::email;

    fn ids(mailbox: &Mailbox) -> Vec<EmailId> {
        mailbox.emails().iter().map(|e| e.id).collect()
    }

    #[test]
    fn first_selection_fetches() {
        let mut mailbox = Mailbox::default();
        assert_eq!(mailbox.load_state(), LoadState::Idle);

        let ticket = mailbox.select_folder(Folder::Inbox).unwrap();
        assert_eq!(ticket.generation, 1);
        assert_eq!(mailbox.load_state(), LoadState::Loading);

        assert_eq!(
            mailbox.complete_fetch(ticket, Ok(vec![email(1), email(2)])),
            FetchOutcome::Applied
        );
        assert_eq!(mailbox.load_state(), LoadState::Ready);
        assert_eq!(ids(&mailbox), vec![1, 2]);
    }

    #[test]
    fn reselecting_loaded_folder_is_a_no_op() {
        let mut mailbox = Mailbox::default();
        let ticket = mailbox.select_folder(Folder::Inbox).unwrap();
        mailbox.complete_fetch(ticket, Ok(vec![email(1)]));

        assert_eq!(mailbox.select_folder(Folder::Inbox), None);
        assert_eq!(mailbox.generation(), 1);
    }

    #[test]
    fn reselecting_while_loading_refetches() {
        let mut mailbox = Mailbox::default();
        let first = mailbox.select_folder(Folder::Inbox).unwrap();
        let second = mailbox.select_folder(Folder::Inbox).unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(mailbox.complete_fetch(first, Ok(vec![email(9)])), FetchOutcome::Superseded);
        assert!(mailbox.emails().is_empty());
    }

    #[test]
    fn late_inbox_response_does_not_overwrite_spam() {
        let mut mailbox = Mailbox::default();
        let inbox = mailbox.select_folder(Folder::Inbox).unwrap();
        let spam = mailbox.select_folder(Folder::Spam).unwrap();
        assert_eq!((inbox.generation, spam.generation), (1, 2));

        assert_eq!(mailbox.complete_fetch(spam, Ok(vec![email(20)])), FetchOutcome::Applied);
        assert_eq!(
            mailbox.complete_fetch(inbox, Ok(vec![email(10), email(11)])),
            FetchOutcome::Superseded
        );

        assert_eq!(mailbox.active_folder(), Folder::Spam);
        assert_eq!(ids(&mailbox), vec![20]);
        assert!(mailbox.emails()[0].is_spam);
    }

    #[test]
    fn last_selection_wins_for_any_completion_order() {
        let folders = [Folder::Inbox, Folder::Sent, Folder::Archived, Folder::Spam];
        let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];

        for order in orders {
            let mut mailbox = Mailbox::default();
            let tickets: Vec<_> = folders
                .iter()
                .map(|f| mailbox.select_folder(*f).unwrap())
                .collect();

            for i in order {
                let payload = vec![email(100 + i as EmailId)];
                mailbox.complete_fetch(tickets[i], Ok(payload));
            }

            assert_eq!(mailbox.active_folder(), Folder::Spam);
            assert_eq!(ids(&mailbox), vec![103], "order {:?}", order);
            assert_eq!(mailbox.load_state(), LoadState::Ready);
        }
    }

    #[test]
    fn current_failure_is_surfaced_but_stale_failure_is_not() {
        let mut mailbox = Mailbox::default();
        let inbox = mailbox.select_folder(Folder::Inbox).unwrap();
        let sent = mailbox.select_folder(Folder::Sent).unwrap();

        let stale = mailbox.complete_fetch(inbox, Err(ApiError::Transport("reset".into())));
        assert_eq!(stale, FetchOutcome::Superseded);
        assert_eq!(mailbox.load_state(), LoadState::Loading);
        assert_eq!(mailbox.error(), None);

        let current = mailbox.complete_fetch(sent, Err(ApiError::Transport("reset".into())));
        assert_eq!(current, FetchOutcome::Failed("Network error: reset".into()));
        assert_eq!(mailbox.load_state(), LoadState::Failed);
        assert_eq!(mailbox.error(), Some("Network error: reset"));
    }

    #[test]
    fn failed_folder_can_be_reselected() {
        let mut mailbox = Mailbox::default();
        let ticket = mailbox.select_folder(Folder::Inbox).unwrap();
        mailbox.complete_fetch(ticket, Err(ApiError::Transport("down".into())));
        assert!(mailbox.select_folder(Folder::Inbox).is_some());
    }

    #[test]
    fn auth_rejection_is_reported() {
        let mut mailbox = Mailbox::default();
        let ticket = mailbox.select_folder(Folder::Inbox).unwrap();
        let outcome = mailbox.complete_fetch(
            ticket,
            Err(ApiError::AuthRejected("Authentication required".into())),
        );
        assert_eq!(outcome, FetchOutcome::AuthRejected);
    }

    #[test]
    fn refresh_keeps_emails_until_answer() {
        let mut mailbox = Mailbox::default();
        let ticket = mailbox.select_folder(Folder::Inbox).unwrap();
        mailbox.complete_fetch(ticket, Ok(vec![email(1)]));

        let refresh = mailbox.refresh();
        assert_eq!(mailbox.load_state(), LoadState::Loading);
        assert_eq!(ids(&mailbox), vec![1]);
        mailbox.complete_fetch(refresh, Ok(vec![email(2), email(1)]));
        assert_eq!(ids(&mailbox), vec![2, 1]);
    }

    #[test]
    fn issuing_refresh_keeps_the_view_epoch() {
        let mut mailbox = Mailbox::default();
        let ticket = mailbox.select_folder(Folder::Inbox).unwrap();
        mailbox.complete_fetch(ticket, Ok(vec![email(1)]));
        let epoch = mailbox.view_epoch();

        let refresh = mailbox.refresh();
        assert_eq!(mailbox.view_epoch(), epoch);
        mailbox.complete_fetch(refresh, Err(ApiError::Transport("connection refused".into())));
        assert_eq!(mailbox.view_epoch(), epoch);

        let refresh = mailbox.refresh();
        mailbox.complete_fetch(refresh, Ok(vec![email(1)]));
        assert!(mailbox.view_epoch() > epoch);
    }

    #[test]
    fn switching_folder_clears_previous_emails() {
        let mut mailbox = Mailbox::default();
        let ticket = mailbox.select_folder(Folder::Inbox).unwrap();
        mailbox.complete_fetch(ticket, Ok(vec![email(1)]));

        mailbox.select_folder(Folder::Archived);
        assert!(mailbox.emails().is_empty());
    }

    #[test]
    fn duplicate_ids_are_collapsed() {
        let mut mailbox = Mailbox::default();
        let ticket = mailbox.select_folder(Folder::Archived).unwrap();
        let mut dup = email(1);
        dup.subject = "second copy".into();
        mailbox.complete_fetch(ticket, Ok(vec![email(1), email(2), dup]));

        assert_eq!(ids(&mailbox), vec![1, 2]);
        assert_eq!(mailbox.emails()[0].subject, "subject 1");
        assert!(mailbox.emails().iter().all(|e| e.is_archived));
    }

    #[test]
    fn clear_makes_in_flight_fetches_stale() {
        let mut mailbox = Mailbox::default();
        let ticket = mailbox.select_folder(Folder::Sent).unwrap();
        mailbox.clear();

        assert_eq!(mailbox.complete_fetch(ticket, Ok(vec![email(1)])), FetchOutcome::Superseded);
        assert!(mailbox.emails().is_empty());
        assert_eq!(mailbox.load_state(), LoadState::Idle);
        assert_eq!(mailbox.active_folder(), Folder::Inbox);
    }

    #[test]
    fn restore_puts_email_back_in_place() {
        let mut mailbox = Mailbox::default();
        let ticket = mailbox.select_folder(Folder::Inbox).unwrap();
        mailbox.complete_fetch(ticket, Ok(vec![email(1), email(2), email(3)]));

        let (index, removed) = mailbox.remove_email(2).unwrap();
        assert_eq!(ids(&mailbox), vec![1, 3]);
        assert!(mailbox.restore_email(index, removed.clone()));
        assert_eq!(ids(&mailbox), vec![1, 2, 3]);
        assert!(!mailbox.restore_email(index, removed));
    }
}

use crate::api::ApiResult;
use crate::mailbox::Mailbox;
use crate::models::{ActionKind, Email, EmailId};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// State needed to undo an optimistic edit.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Snapshot {
    Flags { is_read: bool, is_archived: bool },
    /// Deleted emails are kept whole, with the index they were removed from.
    Position { index: usize, email: Email },
}

#[derive(Debug, Clone)]
pub struct PendingAction {
    pub email_id: EmailId,
    pub kind: ActionKind,
    seq: u64,
    view_epoch: u64,
    snapshot: Snapshot,
}

/// Confirmation request to send to the server for an applied action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionRequest {
    pub email_id: EmailId,
    pub kind: ActionKind,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Applied locally; the request must now be sent.
    Issued(ActionRequest),
    /// Another action on the same email is outstanding; this one waits its turn.
    Queued,
    /// The email is not in the current view.
    NotInView,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Confirmed,
    Failed {
        message: String,
        /// False when the view was replaced since; the new view already shows server truth.
        rolled_back: bool,
        session_rejected: bool,
    },
    /// No longer tracked (the reconciler was cleared since).
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub outcome: ActionOutcome,
    /// The next queued action for the same email, already applied locally.
    pub next: Option<ActionRequest>,
}

/// Applies folder actions optimistically and settles them one at a time per email.
#[derive(Debug, Default)]
pub struct Reconciler {
    in_flight: HashMap<EmailId, PendingAction>,
    queued: HashMap<EmailId, VecDeque<ActionKind>>,
    next_seq: u64,
}

impl Reconciler {
    pub fn is_pending(&self, id: EmailId) -> bool {
        self.in_flight.contains_key(&id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingAction> {
        self.in_flight.values()
    }

    pub fn apply_action(&mut self, mailbox: &mut Mailbox, id: EmailId, kind: ActionKind) -> Dispatch {
        if self.in_flight.contains_key(&id) {
            debug!(id, %kind, "action queued behind pending one");
            self.queued.entry(id).or_default().push_back(kind);
            return Dispatch::Queued;
        }
        match self.start(mailbox, id, kind) {
            Some(request) => Dispatch::Issued(request),
            None => Dispatch::NotInView,
        }
    }

    fn start(&mut self, mailbox: &mut Mailbox, id: EmailId, kind: ActionKind) -> Option<ActionRequest> {
        let view_epoch = mailbox.view_epoch();
        let snapshot = match kind {
            ActionKind::Delete => {
                let (index, email) = mailbox.remove_email(id)?;
                Snapshot::Position { index, email }
            }
            _ => {
                let email = mailbox.email_mut(id)?;
                let snapshot = Snapshot::Flags {
                    is_read: email.is_read,
                    is_archived: email.is_archived,
                };
                match kind {
                    ActionKind::Read => email.is_read = true,
                    ActionKind::Unread => email.is_read = false,
                    ActionKind::Archive => email.is_archived = true,
                    ActionKind::Unarchive => email.is_archived = false,
                    ActionKind::Delete => {}
                }
                snapshot
            }
        };

        self.next_seq += 1;
        let request = ActionRequest {
            email_id: id,
            kind,
            seq: self.next_seq,
        };
        self.in_flight.insert(
            id,
            PendingAction {
                email_id: id,
                kind,
                seq: request.seq,
                view_epoch,
                snapshot,
            },
        );
        info!(id, %kind, "applied optimistically");
        Some(request)
    }

    pub fn complete_action(
        &mut self,
        mailbox: &mut Mailbox,
        request: ActionRequest,
        result: ApiResult<()>,
    ) -> Settled {
        let pending = match self.in_flight.remove(&request.email_id) {
            Some(pending) if pending.seq == request.seq => pending,
            other => {
                if let Some(newer) = other {
                    self.in_flight.insert(newer.email_id, newer);
                }
                debug!(id = request.email_id, seq = request.seq, "dropping stale action confirmation");
                return Settled {
                    outcome: ActionOutcome::Stale,
                    next: None,
                };
            }
        };

        let outcome = match result {
            Ok(()) => {
                debug!(id = pending.email_id, kind = %pending.kind, "action confirmed");
                ActionOutcome::Confirmed
            }
            Err(e) => {
                let rolled_back = self.roll_back(mailbox, &pending);
                warn!(
                    id = pending.email_id,
                    kind = %pending.kind,
                    rolled_back,
                    "action failed: {}",
                    e
                );
                if e.is_auth_rejected() {
                    self.queued.remove(&pending.email_id);
                }
                ActionOutcome::Failed {
                    message: format!("Failed to {}: {}", pending.kind.description(), e),
                    rolled_back,
                    session_rejected: e.is_auth_rejected(),
                }
            }
        };

        Settled {
            outcome,
            next: self.start_next(mailbox, pending.email_id),
        }
    }

    fn roll_back(&self, mailbox: &mut Mailbox, pending: &PendingAction) -> bool {
        if mailbox.view_epoch() != pending.view_epoch {
            return false;
        }
        match &pending.snapshot {
            Snapshot::Flags { is_read, is_archived } => match mailbox.email_mut(pending.email_id) {
                Some(email) => {
                    email.is_read = *is_read;
                    email.is_archived = *is_archived;
                    true
                }
                None => false,
            },
            Snapshot::Position { index, email } => mailbox.restore_email(*index, email.clone()),
        }
    }

    fn start_next(&mut self, mailbox: &mut Mailbox, id: EmailId) -> Option<ActionRequest> {
        loop {
            let Some(kind) = self.queued.get_mut(&id).and_then(|q| q.pop_front()) else {
                self.queued.remove(&id);
                return None;
            };
            if let Some(request) = self.start(mailbox, id, kind) {
                if self.queued.get(&id).is_some_and(|q| q.is_empty()) {
                    self.queued.remove(&id);
                }
                return Some(request);
            }
            // A queued action whose email left the view is a no-op
            debug!(id, %kind, "queued action no longer applicable");
        }
    }

    /// Forgets every pending and queued action; their confirmations become stale.
    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.queued.clear();
    }
}

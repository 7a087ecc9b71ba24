use crate::api::{ApiError, ApiResult};
use crate::auth::IdentityHint;
use crate::models::User;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustState {
    #[default]
    Unknown,
    Checking,
    Authenticated,
    Anonymous,
}

/// What a finished `/check_auth` round trip means for the rest of the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The server vouched for the session.
    Confirmed(User),
    /// The session is gone; carries the error if the check itself failed.
    SignedOut(Option<ApiError>),
    /// A re-check could not reach the server; the session is kept.
    Retained(ApiError),
    /// Nobody was waiting for this answer any more.
    Ignored,
}

/// Owns the client's identity. `trust` only becomes `Authenticated` on the
/// server's word; the cached hint may fill `identity` early but never `trust`.
pub struct SessionStore {
    identity: Option<User>,
    trust: TrustState,
    hint: IdentityHint,
    bootstrapped: bool,
    recheck_pending: bool,
}

impl SessionStore {
    pub fn new(hint: IdentityHint) -> Self {
        Self {
            identity: None,
            trust: TrustState::Unknown,
            hint,
            bootstrapped: false,
            recheck_pending: false,
        }
    }

    pub fn identity(&self) -> Option<&User> {
        self.identity.as_ref()
    }

    pub fn trust(&self) -> TrustState {
        self.trust
    }

    pub fn is_authenticated(&self) -> bool {
        self.trust == TrustState::Authenticated
    }

    /// Starts the one bootstrap of this process. Returns `true` when the caller
    /// must now issue the server identity check.
    pub fn begin_bootstrap(&mut self) -> bool {
        if self.bootstrapped {
            warn!("Session bootstrap requested twice, ignoring");
            return false;
        }
        self.bootstrapped = true;
        self.trust = TrustState::Checking;
        self.identity = self.hint.load();
        if let Some(user) = &self.identity {
            debug!(user = %user.username, "painting cached identity while checking");
        }
        true
    }

    /// Re-confirms an authenticated session. Returns `true` when a check must be issued.
    pub fn begin_recheck(&mut self) -> bool {
        if self.trust != TrustState::Authenticated || self.recheck_pending {
            return false;
        }
        self.recheck_pending = true;
        true
    }

    pub fn complete_check(&mut self, result: ApiResult<Option<User>>) -> CheckOutcome {
        match self.trust {
            TrustState::Checking => match result {
                Ok(Some(user)) => {
                    info!(user = %user.username, "session confirmed");
                    self.confirm(user.clone());
                    CheckOutcome::Confirmed(user)
                }
                Ok(None) => {
                    info!("no active session");
                    self.reset();
                    CheckOutcome::SignedOut(None)
                }
                Err(e) => {
                    warn!("Auth check failed: {}", e);
                    self.reset();
                    CheckOutcome::SignedOut(Some(e))
                }
            },
            TrustState::Authenticated if self.recheck_pending => {
                self.recheck_pending = false;
                match result {
                    Ok(Some(user)) => {
                        self.confirm(user.clone());
                        CheckOutcome::Confirmed(user)
                    }
                    Ok(None) => {
                        info!("session expired on the server");
                        self.reset();
                        CheckOutcome::SignedOut(None)
                    }
                    Err(e) if e.is_auth_rejected() => {
                        info!("session rejected on re-check: {}", e);
                        self.reset();
                        CheckOutcome::SignedOut(Some(e))
                    }
                    Err(e) => {
                        warn!("Session re-check failed, keeping session: {}", e);
                        CheckOutcome::Retained(e)
                    }
                }
            }
            _ => {
                debug!(trust = ?self.trust, "dropping stale auth check");
                CheckOutcome::Ignored
            }
        }
    }

    /// Records an identity the server has just issued a session for.
    pub fn login(&mut self, user: User) {
        info!(user = %user.username, "logged in");
        self.confirm(user);
    }

    /// Applies the server's answer to a registration. Failure leaves the
    /// session untouched and is returned as a message.
    pub fn register_result(&mut self, result: ApiResult<User>) -> Result<(), String> {
        match result {
            Ok(user) => {
                self.login(user);
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Local half of logout; unconditional, whatever the server says.
    pub fn logout(&mut self) {
        info!("logging out");
        self.reset();
    }

    /// The server refused the session in the middle of some other request.
    pub fn invalidate(&mut self) {
        if self.trust == TrustState::Anonymous {
            return;
        }
        warn!("Session rejected by server, signing out");
        self.reset();
    }

    fn confirm(&mut self, user: User) {
        self.hint.store(&user);
        self.identity = Some(user);
        self.trust = TrustState::Authenticated;
    }

    fn reset(&mut self) {
        self.identity = None;
        self.trust = TrustState::Anonymous;
        self.recheck_pending = false;
        self.hint.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::memory::MemoryStore;
    use crate::models::tests::user;

    pub(crate) fn store_with(raw: Option<&str>) -> (SessionStore, MemoryStore) {
        let memory = match raw {
            Some(raw) => MemoryStore::holding(raw),
            None => MemoryStore::default(),
        };
        let session = SessionStore::new(IdentityHint::new(Box::new(memory.clone())));
        (session, memory)
    }

    fn cached(user: &User) -> String {
        serde_json::to_string(user).unwrap()
    }

    #[test]
    fn cached_identity_paints_without_trust() {
        let (mut session, _) = store_with(Some(&cached(&user(1, "emin"))));
        assert_eq!(session.trust(), TrustState::Unknown);

        assert!(session.begin_bootstrap());
        assert_eq!(session.trust(), TrustState::Checking);
        assert_eq!(session.identity().map(|u| u.id), Some(1));
        assert!(!session.is_authenticated());
    }

    #[test]
    fn confirmed_bootstrap_authenticates_and_persists_hint() {
        let (mut session, memory) = store_with(None);
        session.begin_bootstrap();

        let outcome = session.complete_check(Ok(Some(user(5, "ayse"))));
        assert_eq!(outcome, CheckOutcome::Confirmed(user(5, "ayse")));
        assert_eq!(session.trust(), TrustState::Authenticated);
        assert_eq!(memory.raw(), Some(cached(&user(5, "ayse"))));
    }

    #[test]
    fn negative_bootstrap_clears_hint_and_identity() {
        let (mut session, memory) = store_with(Some(&cached(&user(1, "emin"))));
        session.begin_bootstrap();

        assert_eq!(session.complete_check(Ok(None)), CheckOutcome::SignedOut(None));
        assert_eq!(session.trust(), TrustState::Anonymous);
        assert!(session.identity().is_none());
        assert_eq!(memory.raw(), None);
    }

    #[test]
    fn unreachable_server_at_bootstrap_signs_out() {
        let (mut session, memory) = store_with(Some(&cached(&user(1, "emin"))));
        session.begin_bootstrap();

        let err = ApiError::Transport("connection refused".into());
        assert_eq!(
            session.complete_check(Err(err.clone())),
            CheckOutcome::SignedOut(Some(err))
        );
        assert_eq!(session.trust(), TrustState::Anonymous);
        assert_eq!(memory.raw(), None);
    }

    #[test]
    fn malformed_cache_falls_back_to_server_check() {
        let (mut session, memory) = store_with(Some("{\"username\": 12"));
        assert!(session.begin_bootstrap());
        assert_eq!(session.trust(), TrustState::Checking);
        assert!(session.identity().is_none());
        assert_eq!(memory.raw(), None);

        session.complete_check(Ok(Some(user(2, "deniz"))));
        assert!(session.is_authenticated());
    }

    #[test]
    fn bootstrap_runs_once() {
        let (mut session, _) = store_with(None);
        assert!(session.begin_bootstrap());
        session.complete_check(Ok(None));
        assert!(!session.begin_bootstrap());
        assert_eq!(session.trust(), TrustState::Anonymous);
    }

    #[test]
    fn logout_always_clears() {
        let (mut session, memory) = store_with(None);
        session.login(user(9, "can"));
        assert!(memory.raw().is_some());

        session.logout();
        assert_eq!(session.trust(), TrustState::Anonymous);
        assert!(session.identity().is_none());
        assert_eq!(memory.raw(), None);
    }

    #[test]
    fn failed_registration_leaves_state_alone() {
        let (mut session, memory) = store_with(None);
        session.begin_bootstrap();
        session.complete_check(Ok(None));

        let err = session.register_result(Err(ApiError::Conflict("Username already exists".into())));
        assert_eq!(err, Err("Username already exists".to_string()));
        assert_eq!(session.trust(), TrustState::Anonymous);
        assert_eq!(memory.raw(), None);

        assert_eq!(session.register_result(Ok(user(3, "ece"))), Ok(()));
        assert!(session.is_authenticated());
        assert!(memory.raw().is_some());
    }

    #[test]
    fn recheck_keeps_session_on_transport_failure() {
        let (mut session, _) = store_with(None);
        session.login(user(1, "emin"));

        assert!(session.begin_recheck());
        assert!(!session.begin_recheck());
        let err = ApiError::Transport("timed out".into());
        assert_eq!(session.complete_check(Err(err.clone())), CheckOutcome::Retained(err));
        assert!(session.is_authenticated());
    }

    #[test]
    fn recheck_rejection_signs_out() {
        let (mut session, _) = store_with(None);
        session.login(user(1, "emin"));
        session.begin_recheck();

        assert_eq!(session.complete_check(Ok(None)), CheckOutcome::SignedOut(None));
        assert_eq!(session.trust(), TrustState::Anonymous);
    }

    #[test]
    fn check_arriving_after_logout_is_ignored() {
        let (mut session, _) = store_with(Some(&cached(&user(1, "emin"))));
        session.begin_bootstrap();
        session.logout();

        assert_eq!(session.complete_check(Ok(Some(user(1, "emin")))), CheckOutcome::Ignored);
        assert_eq!(session.trust(), TrustState::Anonymous);
    }
}

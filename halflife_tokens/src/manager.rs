use std::{
    error, fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use halflife_clock::{Clock, System, UnixTime};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::Instrument;

use crate::{
    login::NeedLoginEvent,
    schedule::{RefreshSchedule, TokenStatus},
    sources::{CredentialStore, RefreshEndpoint},
    AccessToken, Claims, Error, Subject,
};

/// The outcome of a single refresh, shared by every caller that waited on it
type Outcome = Result<Option<AccessToken>, Error>;

/// Options recognized by a [`TokenManager`]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TokenManagerConfig {
    /// The name the credential is stored under, such as a cookie name
    ///
    /// A refresh fails with a configuration error while this is unset or empty.
    pub credential_name: Option<String>,
    /// Whether the server is asked to reissue a credential that needs refreshing
    ///
    /// When disabled, credentials are expected to be issued entirely out of
    /// band and the skipped request is treated as successful.
    pub allow_server_token_refresh: bool,
    /// Whether to attempt a refresh, and fire the need-login handlers, even
    /// when no credential is available at all
    pub always_request_login: bool,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            credential_name: None,
            allow_server_token_refresh: true,
            always_request_login: false,
        }
    }
}

impl TokenManagerConfig {
    /// Constructs a configuration reading the credential stored under `name`
    pub fn new(credential_name: impl Into<String>) -> Self {
        Self {
            credential_name: Some(credential_name.into()),
            ..Self::default()
        }
    }
}

/// Caches the current credential and coordinates its renewal
///
/// A credential is reused until half of its lifetime has passed. After that,
/// the next call to [`get_token()`][Self::get_token()] starts a refresh, and
/// every call made while that refresh is running waits on its outcome rather
/// than starting another one.
///
/// The manager is a cheap handle; clones share the same credential and
/// refresh state.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Box<dyn CredentialStore>,
    endpoint: Box<dyn RefreshEndpoint>,
    clock: Box<dyn Clock>,
    config: Mutex<TokenManagerConfig>,
    state: Mutex<State>,
    need_login: NeedLoginEvent,
}

#[derive(Default)]
struct State {
    credential: Option<AccessToken>,
    schedule: Option<RefreshSchedule>,
    subject: Option<Subject>,
    phase: Phase,
}

#[derive(Default)]
enum Phase {
    #[default]
    Idle,
    Refreshing(watch::Receiver<Option<Outcome>>),
}

enum Next {
    Ready(Option<AccessToken>),
    Start(watch::Sender<Option<Outcome>>, watch::Receiver<Option<Outcome>>),
    Join(watch::Receiver<Option<Outcome>>),
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("TokenManager")
            .field("credential", &state.credential)
            .field("schedule", &state.schedule)
            .field("subject", &state.subject)
            .field("refreshing", &matches!(state.phase, Phase::Refreshing(_)))
            .field("config", &*self.inner.lock_config())
            .field("need_login", &self.inner.need_login)
            .finish()
    }
}

/// Builds a [`TokenManager`]
pub struct TokenManagerBuilder {
    store: Box<dyn CredentialStore>,
    endpoint: Box<dyn RefreshEndpoint>,
    clock: Box<dyn Clock>,
    config: TokenManagerConfig,
}

impl fmt::Debug for TokenManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenManagerBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TokenManagerBuilder {
    /// Replaces the configuration
    pub fn with_config(mut self, config: TokenManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the name the credential is stored under
    pub fn with_credential_name(mut self, name: impl Into<String>) -> Self {
        self.config.credential_name = Some(name.into());
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Builds the token manager
    pub fn build(self) -> TokenManager {
        TokenManager {
            inner: Arc::new(Inner {
                store: self.store,
                endpoint: self.endpoint,
                clock: self.clock,
                config: Mutex::new(self.config),
                state: Mutex::new(State::default()),
                need_login: NeedLoginEvent::default(),
            }),
        }
    }
}

impl TokenManager {
    /// Starts building a token manager that reads credentials from `store`
    /// and asks `endpoint` to reissue them
    pub fn builder(
        store: impl CredentialStore + 'static,
        endpoint: impl RefreshEndpoint + 'static,
    ) -> TokenManagerBuilder {
        TokenManagerBuilder {
            store: Box::new(store),
            endpoint: Box::new(endpoint),
            clock: Box::new(System),
            config: TokenManagerConfig::default(),
        }
    }

    /// Gets the current credential, refreshing it first if required
    ///
    /// Resolves to `Ok(None)` when no credential could be established; that is
    /// a valid outcome and not an error. Errors are shared: every caller that
    /// waited on the same refresh receives the same error.
    ///
    /// Refreshes run on a spawned task, so this must be called from within a
    /// Tokio runtime. A refresh that has started runs to completion even if
    /// every caller stops waiting on it.
    pub async fn get_token(&self) -> Result<Option<AccessToken>, Error> {
        let mut rx = match self.next_step() {
            Next::Ready(token) => return Ok(token),
            Next::Start(tx, rx) => {
                self.spawn_refresh(tx);
                rx
            }
            Next::Join(rx) => {
                tracing::trace!("waiting on in-flight credential refresh");
                rx
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };

        outcome.unwrap_or(Err(Error::RefreshAbandoned))
    }

    /// Whether the next call to [`get_token()`][Self::get_token()] would
    /// need to refresh the credential
    pub fn needs_refresh(&self) -> bool {
        let now = self.inner.clock.now();
        self.inner.lock_state().needs_refresh_at(now)
    }

    /// Whether a refresh is currently running
    pub fn is_refreshing(&self) -> bool {
        matches!(self.inner.lock_state().phase, Phase::Refreshing(_))
    }

    /// The subject established by the first credential this manager decoded
    pub fn current_subject(&self) -> Option<Subject> {
        self.inner.lock_state().subject.clone()
    }

    /// The refresh schedule of the cached credential
    pub fn schedule(&self) -> Option<RefreshSchedule> {
        self.inner.lock_state().schedule
    }

    /// The current time according to the manager's clock
    pub fn now(&self) -> UnixTime {
        self.inner.clock.now()
    }

    /// The status of the cached credential as of [`now()`][Self::now()]
    pub fn status(&self) -> Option<TokenStatus> {
        let now = self.now();
        self.schedule().map(|s| s.status_at(now))
    }

    /// Forgets the cached credential, its schedule, and the established subject
    ///
    /// A refresh that is already running is not interrupted.
    pub fn clear(&self) {
        tracing::debug!("clearing cached credential state");
        self.inner.lock_state().clear();
    }

    /// The handlers fired when the credential cannot be refreshed
    pub fn on_need_login(&self) -> &NeedLoginEvent {
        &self.inner.need_login
    }

    /// A snapshot of the current configuration
    pub fn config(&self) -> TokenManagerConfig {
        self.inner.lock_config().clone()
    }

    /// Changes the name the credential is stored under
    pub fn set_credential_name(&self, name: Option<String>) {
        self.inner.lock_config().credential_name = name;
    }

    /// Enables or disables asking the server to reissue credentials
    pub fn set_allow_server_token_refresh(&self, value: bool) {
        self.inner.lock_config().allow_server_token_refresh = value;
    }

    /// Enables or disables refreshing when no credential is available
    pub fn set_always_request_login(&self, value: bool) {
        self.inner.lock_config().always_request_login = value;
    }

    fn next_step(&self) -> Next {
        let now = self.inner.clock.now();
        let mut state = self.inner.lock_state();

        if let Phase::Refreshing(rx) = &state.phase {
            return Next::Join(rx.clone());
        }

        if !state.needs_refresh_at(now) {
            return Next::Ready(state.credential.clone());
        }

        let (tx, rx) = watch::channel(None);
        state.phase = Phase::Refreshing(rx.clone());
        Next::Start(tx, rx)
    }

    fn spawn_refresh(&self, tx: watch::Sender<Option<Outcome>>) {
        let manager = self.clone();
        let join = tokio::spawn(
            async move {
                let outcome = manager.refresh().await;
                manager.inner.lock_state().phase = Phase::Idle;

                match &outcome {
                    Ok(Some(_)) => tracing::debug!("credential refresh complete"),
                    Ok(None) => tracing::debug!("credential refresh complete, no credential available"),
                    Err(error) => tracing::warn!(
                        error = (error as &dyn error::Error),
                        "credential refresh failed"
                    ),
                }

                tx.send_replace(Some(outcome));
            }
            .instrument(tracing::debug_span!("credential_refresh")),
        );

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(err) = join.await {
                if err.is_panic() {
                    tracing::error!("credential refresh panicked!")
                } else if err.is_cancelled() {
                    tracing::info!("credential refresh was cancelled")
                }

                let mut state = manager.inner.lock_state();
                state.phase = Phase::Idle;
                state.schedule = None;
            }
        });
    }

    async fn refresh(&self) -> Outcome {
        let config = self.config();
        let name = config
            .credential_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(Error::Configuration(
                "a credential name must be set to read access tokens",
            ))?;

        let attempt_refresh = {
            let now = self.inner.clock.now();
            let mut state = self.inner.lock_state();
            if state.credential.is_none() {
                state.credential = self.inner.store.read_raw(name);
            }
            state.process_current()?;

            (state.credential.is_some() || config.always_request_login)
                && state.needs_refresh_at(now)
        };

        if attempt_refresh
            && !self.refresh_from_server(&config).await
            && !self.inner.need_login.fire(self).await
        {
            tracing::warn!("unable to refresh credential and no login was performed");
            self.inner.lock_state().schedule = None;
            return Err(Error::RefreshFailed);
        }

        // Read the store even if no refresh was attempted; a login performed
        // out of band may have placed a credential there.
        let mut state = self.inner.lock_state();
        state.credential = self.inner.store.read_raw(name);
        state.process_current()?;
        Ok(state.credential.clone())
    }

    async fn refresh_from_server(&self, config: &TokenManagerConfig) -> bool {
        if !config.allow_server_token_refresh {
            tracing::debug!("server token refresh disabled, skipping");
            return true;
        }

        match self.inner.endpoint.request_refresh().await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    error = (&*error as &dyn error::Error),
                    "server refused to refresh credential"
                );
                false
            }
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_config(&self) -> MutexGuard<'_, TokenManagerConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn needs_refresh_at(&self, now: UnixTime) -> bool {
        self.schedule.map_or(true, |s| s.is_due_at(now))
    }

    fn clear(&mut self) {
        self.credential = None;
        self.schedule = None;
        self.subject = None;
    }

    /// Decodes the cached credential, checking it still belongs to the
    /// established subject
    ///
    /// Any failure clears all cached state.
    fn process_current(&mut self) -> Result<(), Error> {
        let claims = match self.credential.as_deref().map(Claims::decode) {
            None => return Ok(()),
            Some(Ok(claims)) => claims,
            Some(Err(error)) => {
                self.clear();
                return Err(error.into());
            }
        };

        match &self.subject {
            Some(expected) if expected.as_str() != claims.subject().as_str() => {
                let expected = expected.clone();
                tracing::warn!(
                    expected = %expected,
                    found = %claims.subject(),
                    "credential subject changed, clearing cached credential"
                );
                self.clear();
                return Err(Error::IdentityMismatch {
                    expected,
                    found: claims.subject().to_owned(),
                });
            }
            Some(_) => {}
            None => {
                tracing::info!(subject = %claims.subject(), "established credential subject");
                self.subject = Some(claims.subject().to_owned());
            }
        }

        let schedule = RefreshSchedule::from_claims(&claims);
        if self.schedule != Some(schedule) {
            tracing::info!(
                not_before = schedule.anchor().0,
                half_life = schedule.half_life().0,
                expiry = schedule.expiry().0,
                "accepted credential"
            );
        }
        self.schedule = Some(schedule);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use halflife_clock::{DurationSecs, TestClock, UnixTime};
    use tokio::sync::Semaphore;

    use super::*;
    use crate::{claims::test_util::token_for, sources::InMemoryCredentialStore};

    const NAME: &str = "bearer";
    const NOW: UnixTime = UnixTime(10_000);

    /// Plays the server: on refresh, writes the next credential into the store
    #[derive(Default)]
    struct FakeServer {
        store: InMemoryCredentialStore,
        calls: AtomicUsize,
        reject: AtomicBool,
        revoke: AtomicBool,
        issue: Mutex<Option<AccessToken>>,
        gate: Option<Semaphore>,
    }

    impl FakeServer {
        fn new(store: &InMemoryCredentialStore) -> Self {
            Self {
                store: store.clone(),
                ..Self::default()
            }
        }

        fn issuing(self, token: AccessToken) -> Self {
            *self.issue.lock().unwrap() = Some(token);
            self
        }

        fn rejecting(self) -> Self {
            self.reject.store(true, Ordering::Release);
            self
        }

        fn revoking(self) -> Self {
            self.revoke.store(true, Ordering::Release);
            self
        }

        fn gated(mut self) -> Self {
            self.gate = Some(Semaphore::new(0));
            self
        }

        fn open_gate(&self) {
            if let Some(gate) = &self.gate {
                gate.add_permits(1);
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Acquire)
        }
    }

    #[async_trait]
    impl RefreshEndpoint for FakeServer {
        async fn request_refresh(
            &self,
        ) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>> {
            self.calls.fetch_add(1, Ordering::AcqRel);

            if let Some(gate) = &self.gate {
                gate.acquire().await?.forget();
            }

            if self.reject.load(Ordering::Acquire) {
                return Err("401 Unauthorized".into());
            }

            if self.revoke.load(Ordering::Acquire) {
                self.store.remove(NAME);
            }

            if let Some(token) = self.issue.lock().unwrap().clone() {
                self.store.set(NAME, token);
            }
            Ok(())
        }
    }

    struct Fixture {
        store: InMemoryCredentialStore,
        server: Arc<FakeServer>,
        clock: TestClock,
        manager: TokenManager,
    }

    fn fixture(configure: impl FnOnce(FakeServer) -> FakeServer) -> Fixture {
        fixture_with_config(TokenManagerConfig::new(NAME), configure)
    }

    fn fixture_with_config(
        config: TokenManagerConfig,
        configure: impl FnOnce(FakeServer) -> FakeServer,
    ) -> Fixture {
        let store = InMemoryCredentialStore::new();
        let server = Arc::new(configure(FakeServer::new(&store)));
        let clock = TestClock::new(NOW);
        let manager = TokenManager::builder(store.clone(), server.clone())
            .with_config(config)
            .with_clock(clock.clone())
            .build();

        Fixture {
            store,
            server,
            clock,
            manager,
        }
    }

    /// A credential issued at `NOW`, valid for 100 seconds
    fn fresh(sub: &str) -> AccessToken {
        token_for(sub, NOW.0, NOW.0 + 100)
    }

    /// A credential whose half-life passed long ago
    fn stale(sub: &str) -> AccessToken {
        token_for(sub, NOW.0 - 1_000, NOW.0 + 100)
    }

    async fn wait_until_idle(manager: &TokenManager) {
        for _ in 0..100 {
            if !manager.is_refreshing() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("refresh did not complete");
    }

    mod when_a_fresh_credential_is_stored {
        use super::*;

        #[tokio::test]
        async fn returns_it_without_asking_the_server() {
            let f = fixture(|s| s);
            f.store.set(NAME, fresh("alice"));

            let first = f.manager.get_token().await.unwrap();
            f.clock.advance(DurationSecs(20));
            let second = f.manager.get_token().await.unwrap();

            assert_eq!(first, Some(fresh("alice")));
            assert_eq!(second, first);
            assert_eq!(f.server.calls(), 0);
            assert_eq!(f.manager.current_subject().unwrap().as_str(), "alice");
        }

        #[tokio::test]
        async fn refresh_is_due_only_after_half_life() {
            let f = fixture(|s| s);
            f.store.set(NAME, fresh("alice"));
            f.manager.get_token().await.unwrap();

            f.clock.set(UnixTime(NOW.0 + 49));
            assert!(!f.manager.needs_refresh());

            f.clock.set(UnixTime(NOW.0 + 51));
            assert!(f.manager.needs_refresh());
        }

        #[tokio::test]
        async fn status_follows_the_managers_clock() {
            let f = fixture(|s| s);
            assert_eq!(f.manager.status(), None);
            f.store.set(NAME, fresh("alice"));
            f.manager.get_token().await.unwrap();

            assert_eq!(f.manager.now(), NOW);
            assert_eq!(f.manager.status(), Some(TokenStatus::Fresh));

            f.clock.set(UnixTime(NOW.0 + 51));
            assert_eq!(f.manager.status(), Some(TokenStatus::Stale));
            assert!(f.manager.needs_refresh());

            f.clock.set(UnixTime(NOW.0 + 100));
            assert_eq!(f.manager.status(), Some(TokenStatus::Expired));
        }

        #[tokio::test]
        async fn is_refreshed_once_half_life_passes() {
            let renewed = token_for("alice", NOW.0 + 60, NOW.0 + 160);
            let f = fixture(|s| s.issuing(renewed.clone()));
            f.store.set(NAME, fresh("alice"));
            f.manager.get_token().await.unwrap();

            f.clock.set(UnixTime(NOW.0 + 60));
            let token = f.manager.get_token().await.unwrap();

            assert_eq!(token, Some(renewed));
            assert_eq!(f.server.calls(), 1);
            assert!(!f.manager.needs_refresh());
        }
    }

    mod when_the_credential_needs_refreshing {
        use super::*;

        #[tokio::test]
        async fn concurrent_callers_share_one_refresh() {
            let f = fixture(|s| s.issuing(fresh("alice")));
            f.store.set(NAME, stale("alice"));

            let (a, b, c, d) = tokio::join!(
                f.manager.get_token(),
                f.manager.get_token(),
                f.manager.get_token(),
                f.manager.get_token(),
            );

            assert_eq!(f.server.calls(), 1);
            for result in [a, b, c, d] {
                assert_eq!(result.unwrap(), Some(fresh("alice")));
            }
        }

        #[tokio::test]
        async fn late_callers_join_the_in_flight_refresh() {
            let f = fixture(|s| s.issuing(fresh("alice")).gated());
            f.store.set(NAME, stale("alice"));

            let first = tokio::spawn({
                let manager = f.manager.clone();
                async move { manager.get_token().await }
            });
            while f.server.calls() == 0 {
                tokio::task::yield_now().await;
            }
            assert!(f.manager.is_refreshing());

            let second = tokio::spawn({
                let manager = f.manager.clone();
                async move { manager.get_token().await }
            });
            tokio::task::yield_now().await;
            f.server.open_gate();

            assert_eq!(first.await.unwrap().unwrap(), Some(fresh("alice")));
            assert_eq!(second.await.unwrap().unwrap(), Some(fresh("alice")));
            assert_eq!(f.server.calls(), 1);
        }

        #[tokio::test]
        async fn refresh_completes_when_every_caller_gives_up() {
            let f = fixture(|s| s.issuing(fresh("alice")).gated());
            f.store.set(NAME, stale("alice"));

            let caller = tokio::spawn({
                let manager = f.manager.clone();
                async move { manager.get_token().await }
            });
            while f.server.calls() == 0 {
                tokio::task::yield_now().await;
            }
            caller.abort();
            f.server.open_gate();
            wait_until_idle(&f.manager).await;

            let token = f.manager.get_token().await.unwrap();

            assert_eq!(token, Some(fresh("alice")));
            assert_eq!(f.server.calls(), 1);
        }

        #[tokio::test]
        async fn concurrent_callers_share_the_failure() {
            let f = fixture(FakeServer::rejecting);
            f.store.set(NAME, stale("alice"));

            let (a, b, c) = tokio::join!(
                f.manager.get_token(),
                f.manager.get_token(),
                f.manager.get_token(),
            );

            assert_eq!(f.server.calls(), 1);
            for result in [a, b, c] {
                assert!(matches!(result, Err(Error::RefreshFailed)), "{result:?}");
            }
        }

        #[tokio::test]
        async fn failure_clears_only_the_schedule() {
            let f = fixture(FakeServer::rejecting);
            f.store.set(NAME, stale("alice"));

            let err = f.manager.get_token().await.unwrap_err();

            assert!(matches!(err, Error::RefreshFailed), "{err:?}");
            assert!(f.manager.schedule().is_none());
            assert!(f.manager.needs_refresh());
            assert_eq!(f.manager.current_subject().unwrap().as_str(), "alice");

            let _ = f.manager.get_token().await;
            assert_eq!(f.server.calls(), 2);
        }

        #[tokio::test]
        async fn disabled_server_refresh_is_treated_as_success() {
            let mut config = TokenManagerConfig::new(NAME);
            config.allow_server_token_refresh = false;
            let f = fixture_with_config(config, FakeServer::rejecting);
            f.store.set(NAME, stale("alice"));

            let token = f.manager.get_token().await.unwrap();

            assert_eq!(token, Some(stale("alice")));
            assert_eq!(f.server.calls(), 0);
        }

        #[tokio::test]
        async fn revoked_credential_yields_none() {
            let f = fixture(FakeServer::revoking);
            f.store.set(NAME, stale("alice"));

            let token = f.manager.get_token().await.unwrap();

            assert_eq!(token, None);
            assert_eq!(f.server.calls(), 1);
        }
    }

    mod when_the_subject_changes {
        use super::*;

        #[tokio::test]
        async fn state_is_cleared_and_mismatch_reported() {
            let bob = token_for("bob", NOW.0 + 60, NOW.0 + 160);
            let f = fixture(|s| s.issuing(bob.clone()));
            f.store.set(NAME, fresh("alice"));
            f.manager.get_token().await.unwrap();

            f.clock.set(UnixTime(NOW.0 + 60));
            let err = f.manager.get_token().await.unwrap_err();

            match err {
                Error::IdentityMismatch { expected, found } => {
                    assert_eq!(expected.as_str(), "alice");
                    assert_eq!(found.as_str(), "bob");
                }
                other => panic!("unexpected error: {other:?}"),
            }
            assert!(f.manager.current_subject().is_none());
            assert!(f.manager.schedule().is_none());
            assert!(f.manager.needs_refresh());
        }

        #[tokio::test]
        async fn next_call_starts_fresh_with_the_new_subject() {
            let bob = token_for("bob", NOW.0 + 60, NOW.0 + 160);
            let f = fixture(|s| s.issuing(bob.clone()));
            f.store.set(NAME, fresh("alice"));
            f.manager.get_token().await.unwrap();
            f.clock.set(UnixTime(NOW.0 + 60));
            f.manager.get_token().await.unwrap_err();

            let token = f.manager.get_token().await.unwrap();

            assert_eq!(token, Some(bob));
            assert_eq!(f.manager.current_subject().unwrap().as_str(), "bob");
            assert_eq!(f.server.calls(), 1);
        }

        #[tokio::test]
        async fn explicit_clear_accepts_a_new_subject() {
            let f = fixture(|s| s);
            f.store.set(NAME, fresh("alice"));
            f.manager.get_token().await.unwrap();

            f.manager.clear();
            f.store.set(NAME, fresh("bob"));
            let token = f.manager.get_token().await.unwrap();

            assert_eq!(token, Some(fresh("bob")));
            assert_eq!(f.manager.current_subject().unwrap().as_str(), "bob");
            assert_eq!(f.server.calls(), 0);
        }
    }

    mod when_refresh_fails {
        use super::*;

        #[tokio::test]
        async fn first_successful_login_handler_recovers() {
            let f = fixture(FakeServer::rejecting);
            f.store.set(NAME, stale("alice"));
            let fired = Arc::new(AtomicUsize::new(0));

            for (idx, answer) in [false, true, false].into_iter().enumerate() {
                let fired = fired.clone();
                let store = f.store.clone();
                f.manager.on_need_login().add(move |_: TokenManager| {
                    fired.fetch_add(1, Ordering::AcqRel);
                    if idx == 1 {
                        store.set(NAME, fresh("alice"));
                    }
                    async move { Some(answer) }
                });
            }

            let token = f.manager.get_token().await.unwrap();

            assert_eq!(token, Some(fresh("alice")));
            assert_eq!(fired.load(Ordering::Acquire), 3);
        }

        #[tokio::test]
        async fn declining_login_handlers_fail_the_refresh() {
            let f = fixture(FakeServer::rejecting);
            f.store.set(NAME, stale("alice"));
            f.manager
                .on_need_login()
                .add(|_: TokenManager| async { Some(false) });
            f.manager.on_need_login().add(|_: TokenManager| async { None });

            let err = f.manager.get_token().await.unwrap_err();

            assert!(matches!(err, Error::RefreshFailed), "{err:?}");
        }

        #[tokio::test]
        async fn removed_handler_is_not_fired() {
            let f = fixture(FakeServer::rejecting);
            f.store.set(NAME, stale("alice"));
            let id = f
                .manager
                .on_need_login()
                .add(|_: TokenManager| async { Some(true) });

            assert!(f.manager.on_need_login().remove(id));
            assert!(!f.manager.on_need_login().remove(id));
            assert!(f.manager.on_need_login().is_empty());

            let err = f.manager.get_token().await.unwrap_err();
            assert!(matches!(err, Error::RefreshFailed), "{err:?}");
        }

        #[tokio::test]
        async fn handler_receives_the_manager() {
            let f = fixture(FakeServer::rejecting);
            f.store.set(NAME, stale("alice"));
            f.manager.on_need_login().add(|manager: TokenManager| async move {
                Some(manager.is_refreshing())
            });

            let token = f.manager.get_token().await.unwrap();

            assert_eq!(token, Some(stale("alice")));
        }
    }

    mod when_no_credential_is_stored {
        use super::*;

        #[tokio::test]
        async fn resolves_to_none_without_refreshing() {
            let f = fixture(|s| s.issuing(fresh("alice")));

            let token = f.manager.get_token().await.unwrap();

            assert_eq!(token, None);
            assert_eq!(f.server.calls(), 0);
            assert!(f.manager.needs_refresh());
        }

        #[tokio::test]
        async fn always_request_login_fires_handlers() {
            let mut config = TokenManagerConfig::new(NAME);
            config.always_request_login = true;
            let f = fixture_with_config(config, FakeServer::rejecting);
            let store = f.store.clone();
            f.manager.on_need_login().add(move |_: TokenManager| {
                store.set(NAME, fresh("alice"));
                async { Some(true) }
            });

            let token = f.manager.get_token().await.unwrap();

            assert_eq!(token, Some(fresh("alice")));
            assert_eq!(f.server.calls(), 1);
        }

        #[tokio::test]
        async fn always_request_login_picks_up_server_issued_credential() {
            let mut config = TokenManagerConfig::new(NAME);
            config.always_request_login = true;
            let f = fixture_with_config(config, |s| s.issuing(fresh("alice")));

            let token = f.manager.get_token().await.unwrap();

            assert_eq!(token, Some(fresh("alice")));
            assert_eq!(f.server.calls(), 1);
        }

        #[tokio::test]
        async fn always_request_login_can_be_enabled_at_runtime() {
            let f = fixture(|s| s.issuing(fresh("alice")));
            assert_eq!(f.manager.get_token().await.unwrap(), None);

            f.manager.set_always_request_login(true);
            let token = f.manager.get_token().await.unwrap();

            assert!(f.manager.config().always_request_login);
            assert_eq!(token, Some(fresh("alice")));
            assert_eq!(f.server.calls(), 1);
        }
    }

    mod when_misconfigured_or_malformed {
        use super::*;

        #[tokio::test]
        async fn missing_credential_name_is_a_configuration_error() {
            let f = fixture_with_config(TokenManagerConfig::default(), |s| s);

            let err = f.manager.get_token().await.unwrap_err();

            assert!(matches!(err, Error::Configuration(_)), "{err:?}");
        }

        #[tokio::test]
        async fn credential_name_can_be_set_at_runtime() {
            let f = fixture_with_config(TokenManagerConfig::default(), |s| s);
            f.store.set(NAME, fresh("alice"));
            f.manager.get_token().await.unwrap_err();

            f.manager.set_credential_name(Some(NAME.to_owned()));
            let token = f.manager.get_token().await.unwrap();

            assert_eq!(token, Some(fresh("alice")));
        }

        #[tokio::test]
        async fn malformed_credential_clears_state() {
            let f = fixture(|s| s);
            f.store.set(NAME, fresh("alice"));
            f.manager.get_token().await.unwrap();
            f.store.set(NAME, "not-a-credential");
            f.clock.set(UnixTime(NOW.0 + 60));

            let err = f.manager.get_token().await.unwrap_err();

            assert!(matches!(err, Error::MalformedCredential(_)), "{err:?}");
            assert!(f.manager.current_subject().is_none());
            assert!(f.manager.schedule().is_none());
        }
    }

    mod when_the_refresh_task_panics {
        use super::*;

        struct PanickingServer;

        #[async_trait]
        impl RefreshEndpoint for PanickingServer {
            async fn request_refresh(
                &self,
            ) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>> {
                panic!("refresh endpoint exploded")
            }
        }

        #[tokio::test]
        async fn waiters_observe_abandonment_and_manager_recovers() {
            let store = InMemoryCredentialStore::new();
            store.set(NAME, stale("alice"));
            let manager = TokenManager::builder(store.clone(), PanickingServer)
                .with_credential_name(NAME)
                .with_clock(TestClock::new(NOW))
                .build();

            let err = manager.get_token().await.unwrap_err();
            assert!(matches!(err, Error::RefreshAbandoned), "{err:?}");

            wait_until_idle(&manager).await;
            assert!(manager.needs_refresh());
        }
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: TokenManagerConfig =
            serde_json::from_str(r#"{"credential_name":"bearer"}"#).unwrap();

        assert_eq!(config, TokenManagerConfig::new("bearer"));
        assert!(config.allow_server_token_refresh);
        assert!(!config.always_request_login);
    }
}

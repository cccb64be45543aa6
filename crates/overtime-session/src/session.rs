//! Session manager: the single authority for the current user, the
//! authentication state and the bearer token on outgoing requests.
//!
//! Authentication flow:
//! 1. `is_logged_in` restores an offline session, creates an anonymous device
//!    user, or validates the stored token.
//! 2. `validate_auth_token` exchanges the token for a refreshed one and the
//!    canonical user id, retrying transient failures with backoff.
//! 3. A device user that later verifies a phone number is migrated onto the
//!    authenticated account.

use std::sync::Arc;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::app_config::ApplicationConfiguration;
use crate::cache::ObjectCache;
use crate::config::{Environment, SessionConfig};
use crate::error::RequestError;
use crate::fetch::ApiClient;
use crate::platform::{
    AnalyticsSink, NetworkMonitor, NoopAnalytics, NoopPush, PushRegistrar, report_error,
    track_event,
};
use crate::settings::{MemorySettings, SettingsStore, keys};
use crate::transport::{Request, Transport};
use crate::types::User;

/// Broadcast channel capacity for session events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Where the session is in its authentication lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthPhase {
    #[default]
    LoggedOut,
    AuthenticatingDeviceUser,
    AuthenticatingToken,
    Authenticated,
    Migrating,
}

/// Observable session state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub phase: AuthPhase,
    pub current_user_id: Option<String>,
    pub is_authenticated: bool,
    pub is_authenticating: bool,
    pub is_admin: bool,
    pub is_tester: bool,
}

/// Outcome of exchanging a token with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenValidation {
    Valid,
    /// The server refused the token (4xx).
    Rejected,
    /// Retrying stopped on shutdown or an exhausted retry budget. Nothing is
    /// known about the token.
    Cancelled,
}

/// Session change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The current user id changed, or the current user first landed in the cache.
    CurrentUserChanged(Option<String>),
    AuthenticationChanged(bool),
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub(crate) token: String,
}

#[derive(Debug, Deserialize)]
struct TokenRefreshResponse {
    token: String,
    data: AuthenticationData,
}

#[derive(Debug, Deserialize)]
struct AuthenticationData {
    user: AuthenticationUser,
}

#[derive(Debug, Deserialize)]
struct AuthenticationUser {
    uuid: String,
    #[serde(default)]
    roles: Option<Vec<String>>,
}

/// Session manager.
pub struct SessionManager {
    pub(crate) config: SessionConfig,
    pub(crate) api: ApiClient,
    pub(crate) settings: Arc<dyn SettingsStore>,
    pub(crate) network: Arc<NetworkMonitor>,
    pub(crate) analytics: Arc<dyn AnalyticsSink>,
    push: Arc<dyn PushRegistrar>,
    state: RwLock<SessionState>,
    pub(crate) configuration: RwLock<Option<ApplicationConfiguration>>,
    events_tx: broadcast::Sender<SessionEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl SessionManager {
    /// Start building a session manager.
    pub fn builder(config: SessionConfig) -> SessionManagerBuilder {
        SessionManagerBuilder::new(config)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn cache(&self) -> &Arc<ObjectCache> {
        self.api.cache()
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Point subsequent requests at a different environment.
    pub async fn set_environment(&self, environment: Environment) {
        self.api.transport().set_environment(environment).await;
    }

    // ========================================================================
    // State accessors
    // ========================================================================

    pub async fn state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn phase(&self) -> AuthPhase {
        self.state.read().await.phase
    }

    pub async fn session_token(&self) -> Option<String> {
        self.api.transport().token().await
    }

    pub async fn current_user_id(&self) -> Option<String> {
        self.state.read().await.current_user_id.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.is_authenticated
    }

    pub async fn is_authenticating(&self) -> bool {
        self.state.read().await.is_authenticating
    }

    pub async fn is_admin(&self) -> bool {
        self.state.read().await.is_admin
    }

    pub async fn is_tester(&self) -> bool {
        self.state.read().await.is_tester
    }

    /// Frozen copy of the current user, re-resolved from the cache.
    ///
    /// In offline mode an unset current user falls back to the last
    /// persisted id.
    pub async fn current_user(&self) -> Option<User> {
        let id = match self.current_user_id().await {
            Some(id) => Some(id),
            None if self.config.allow_offline_mode => {
                self.settings.get(keys::CURRENT_USER_ID).await
            }
            None => None,
        }?;
        self.cache().find_one::<User>(&id).await
    }

    /// Whether the current user is anonymous. True when there is no user.
    pub async fn is_device_user(&self) -> bool {
        self.current_user()
            .await
            .is_none_or(|user| user.is_device_user())
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Establish a session, returning whether a user is logged in.
    #[instrument(skip(self))]
    pub async fn is_logged_in(&self) -> bool {
        let was_device_user = self.is_device_user().await;
        self.update_state(|s| s.is_authenticating = true).await;

        if !self.config.allow_anonymous_login
            && self.config.allow_offline_mode
            && !self.network.is_network_connected()
        {
            let user_id = self.settings.get(keys::CURRENT_USER_ID).await;
            info!(user_id = ?user_id, "network unavailable, restoring offline session");
            self.set_current_user_id(user_id).await;
            self.set_authenticated(false).await;
            self.finish_authenticating().await;
            return self.current_user().await.is_some();
        }

        let validated = match self.session_token().await {
            Some(token) => match self.validate_token(&token).await {
                TokenValidation::Valid => true,
                TokenValidation::Rejected => {
                    self.logout().await;
                    false
                }
                TokenValidation::Cancelled => {
                    info!("token validation cancelled, keeping stored session");
                    false
                }
            },
            None if !self.config.allow_anonymous_login => {
                debug!("no stored token and anonymous login disallowed");
                false
            }
            None => self.create_device_user().await,
        };

        if !validated {
            self.finish_authenticating().await;
            return false;
        }

        if !self.config.allow_anonymous_login && self.is_device_user().await {
            debug!("device user rejected while anonymous login disallowed");
            self.finish_authenticating().await;
            return false;
        }

        if was_device_user && !self.migrate_device_user().await {
            debug!("device user migration skipped or failed");
        }

        self.finish_authenticating().await;
        true
    }

    /// Validate a token against the server and adopt the refreshed token.
    ///
    /// Returns false on an explicit 4xx rejection. Other failures return true
    /// when offline mode is allowed and are otherwise retried with backoff
    /// until success, rejection or shutdown. A cancelled retry also returns
    /// false but, unlike a rejection, never logs the session out.
    pub async fn validate_auth_token(&self, token: &str) -> bool {
        self.validate_token(token).await == TokenValidation::Valid
    }

    #[instrument(skip(self, token))]
    async fn validate_token(&self, token: &str) -> TokenValidation {
        self.api.transport().set_token(Some(token.to_string())).await;
        if let Err(e) = self.settings.set(keys::AUTH_TOKEN, token).await {
            warn!(error = %e, "failed to persist auth token");
        }
        self.update_state(|s| {
            s.is_authenticating = true;
            if s.phase != AuthPhase::AuthenticatingDeviceUser {
                s.phase = AuthPhase::AuthenticatingToken;
            }
        })
        .await;

        let mut backoff = self.config.retry.backoff();
        loop {
            let request = Request::get("api/auth/refresh_token").authenticated();
            match self.api.decoded::<TokenRefreshResponse>(&request).await {
                Ok(response) => {
                    self.adopt_session(response).await;
                    return TokenValidation::Valid;
                }
                Err(e) => {
                    self.set_authenticated(false).await;
                    report_error(self.analytics.as_ref(), "Failed to verify token", &e);

                    if e.is_client_rejection() {
                        return TokenValidation::Rejected;
                    }
                    if self.config.allow_offline_mode {
                        debug!("offline mode allowed, assuming token is valid");
                        return TokenValidation::Valid;
                    }
                    if !self.wait_for_retry(&mut backoff).await {
                        return TokenValidation::Cancelled;
                    }
                }
            }
        }
    }

    async fn adopt_session(&self, response: TokenRefreshResponse) {
        let TokenRefreshResponse { token, data } = response;
        let user = data.user;

        self.api.transport().set_token(Some(token.clone())).await;
        if let Err(e) = self.settings.set(keys::AUTH_TOKEN, &token).await {
            warn!(error = %e, "failed to persist refreshed token");
        }
        if let Err(e) = self.settings.set(keys::CURRENT_USER_ID, &user.uuid).await {
            warn!(error = %e, "failed to persist current user id");
        }

        let roles = user.roles.unwrap_or_default();
        let is_admin = roles.iter().any(|r| r == "mod");
        let is_tester = roles.iter().any(|r| r == "tester");

        self.set_current_user_id(Some(user.uuid.clone())).await;
        self.update_state(|s| {
            s.is_admin = is_admin;
            s.is_tester = is_tester;
        })
        .await;

        if let Err(e) = self.update_presence().await {
            debug!(error = %e, "presence update after validation failed");
        }
        if let Err(e) = self.refresh_user(true).await {
            report_error(self.analytics.as_ref(), "Failed to refresh user", &e);
        }

        self.set_authenticated(true).await;
        info!(user_id = %user.uuid, is_admin, is_tester, "session authenticated");
    }

    /// Exchange this device's id for an anonymous user token.
    #[instrument(skip(self))]
    pub async fn create_device_user(&self) -> bool {
        self.update_state(|s| {
            s.is_authenticating = true;
            s.phase = AuthPhase::AuthenticatingDeviceUser;
        })
        .await;

        let device_id = match self.settings.get(keys::DEVICE_ID).await {
            Some(device_id) => device_id,
            None => {
                let device_id = Uuid::new_v4().to_string();
                if let Err(e) = self.settings.set(keys::DEVICE_ID, &device_id).await {
                    warn!(error = %e, "failed to persist device id");
                }
                device_id
            }
        };

        let request = Request::post("api/auth/device_id").parameters(json!({
            "device_id": device_id,
        }));

        let mut backoff = self.config.retry.backoff();
        loop {
            match self.api.decoded::<TokenResponse>(&request).await {
                Ok(response) => {
                    let verified = self.validate_auth_token(&response.token).await;
                    if verified {
                        if let Some(user_id) = self.current_user_id().await {
                            if let Err(e) = self.settings.set(keys::DEVICE_USER_ID, &user_id).await {
                                warn!(error = %e, "failed to persist device user id");
                            }
                        }
                    }
                    return verified;
                }
                Err(e @ RequestError::Decode(_)) => {
                    report_error(
                        self.analytics.as_ref(),
                        "Received unexpected response on device user fetch",
                        &e,
                    );
                    return false;
                }
                Err(e) => {
                    report_error(self.analytics.as_ref(), "Failed to fetch device user", &e);
                    if e.is_client_rejection() || !self.wait_for_retry(&mut backoff).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Move the anonymous device user's data onto the current user.
    ///
    /// Idempotent: a stored migration marker or the device id already being on
    /// the user's device list count as done.
    #[instrument(skip(self))]
    pub async fn migrate_device_user(&self) -> bool {
        let Some(current_user_id) = self.current_user_id().await else {
            return false;
        };
        let Some(current_user) = self.current_user().await else {
            return false;
        };
        if !self.config.allow_anonymous_login {
            return true;
        }

        let device_id = self.settings.get(keys::DEVICE_ID).await;
        let device_user_id = self.settings.get(keys::DEVICE_USER_ID).await;

        let (Some(device_id), Some(device_user_id)) = (device_id, device_user_id.clone()) else {
            warn!("no device user id to migrate");
            if device_user_id.is_none() {
                if let Err(e) = self.settings.set(keys::DEVICE_USER_ID, &current_user.id).await {
                    warn!(error = %e, "failed to persist device user id");
                }
            }
            return false;
        };

        if current_user_id == device_user_id {
            return true;
        }
        if self.settings.get(keys::MIGRATED_USER_ID).await.as_deref() == Some(current_user_id.as_str()) {
            debug!(user_id = %current_user_id, "device user already migrated");
            return true;
        }
        if current_user.device_ids.contains(&device_id) {
            debug!(user_id = %current_user_id, "device id already on user");
            self.mark_migrated(&current_user_id).await;
            return true;
        }

        self.update_state(|s| s.phase = AuthPhase::Migrating).await;

        let request = Request::post(format!(
            "api/writer/users/v1/{}/transfer_from/{}",
            current_user_id, device_user_id
        ))
        .authenticated();

        let migrated = match self.api.request(&request).await {
            Ok(_) => match self.refresh_user(true).await {
                Ok(refreshed) => refreshed,
                Err(e) => {
                    report_error(self.analytics.as_ref(), "Failed to refresh migrated user", &e);
                    false
                }
            },
            Err(e) => {
                report_error(self.analytics.as_ref(), "Failed to migrate user", &e);
                false
            }
        };

        if migrated {
            info!(user_id = %current_user_id, from = %device_user_id, "migrated device user");
            self.mark_migrated(&current_user_id).await;
        }
        self.settle_phase().await;
        migrated
    }

    async fn mark_migrated(&self, user_id: &str) {
        if let Err(e) = self.settings.set(keys::MIGRATED_USER_ID, user_id).await {
            warn!(error = %e, "failed to persist migration marker");
        }
    }

    /// Wipe the token, settings, user state and the entity cache.
    #[instrument(skip(self))]
    pub async fn logout(&self) {
        track_event(self.analytics.as_ref(), "Logged Out");

        self.api.transport().set_token(None).await;
        self.push.unregister();

        if let Err(e) = self.settings.clear().await {
            warn!(error = %e, "failed to clear settings");
        }

        self.set_current_user_id(None).await;
        self.set_authenticated(false).await;
        self.update_state(|s| {
            s.is_admin = false;
            s.is_tester = false;
            s.is_authenticating = false;
            s.phase = AuthPhase::LoggedOut;
        })
        .await;

        if let Err(e) = self.cache().delete_all().await {
            report_error(self.analytics.as_ref(), "Failed to clear cache", &e);
        }
        info!("logged out");
    }

    // ========================================================================
    // Background work
    // ========================================================================

    /// Ping presence on the configured interval until shutdown.
    ///
    /// The task only holds a weak reference and stops once the manager is
    /// dropped.
    pub fn start_presence(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.presence_interval;

        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                let Some(manager) = session.upgrade() else {
                    break;
                };
                if let Err(e) = manager.update_presence().await {
                    debug!(error = %e, "presence ping failed");
                }
                drop(manager);

                tokio::select! {
                    result = shutdown_rx.changed() => {
                        if result.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("presence loop stopped");
        })
    }

    /// Stop background work and cancel pending retries.
    pub fn shutdown(&self) {
        info!("session shutting down");
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Sleep for the next backoff interval. Returns false when retries are
    /// exhausted or the session is shutting down.
    async fn wait_for_retry(&self, backoff: &mut ExponentialBackoff) -> bool {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return false;
        }
        let Some(wait) = backoff.next_backoff() else {
            warn!("retry time exhausted");
            return false;
        };

        debug!(wait_ms = wait.as_millis() as u64, "retrying after backoff");
        tokio::select! {
            _ = shutdown_rx.changed() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    // ========================================================================
    // State mutation
    // ========================================================================

    async fn update_state(&self, f: impl FnOnce(&mut SessionState)) {
        f(&mut *self.state.write().await);
    }

    async fn finish_authenticating(&self) {
        self.update_state(|s| s.is_authenticating = false).await;
        self.settle_phase().await;
    }

    async fn settle_phase(&self) {
        self.update_state(|s| {
            s.phase = if s.is_authenticated {
                AuthPhase::Authenticated
            } else {
                AuthPhase::LoggedOut
            };
        })
        .await;
    }

    async fn set_authenticated(&self, value: bool) {
        let changed = {
            let mut state = self.state.write().await;
            let changed = state.is_authenticated != value;
            state.is_authenticated = value;
            changed
        };
        if changed {
            self.emit(SessionEvent::AuthenticationChanged(value));
        }
    }

    async fn set_current_user_id(&self, user_id: Option<String>) {
        let changed = {
            let mut state = self.state.write().await;
            let changed = state.current_user_id != user_id;
            state.current_user_id = user_id.clone();
            changed
        };
        if changed {
            self.emit(SessionEvent::CurrentUserChanged(user_id));
            self.update_session_identity().await;
        }
    }

    /// Forward the current user to analytics.
    pub async fn update_session_identity(&self) {
        match self.current_user().await {
            Some(user) => {
                debug!(username = ?user.username, "session identity set");
                self.analytics.set_user_identity(&user);
            }
            None => debug!("no user logged in"),
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("no subscribers for session event");
        }
    }
}

/// Builder for a [`SessionManager`] with injected collaborators.
pub struct SessionManagerBuilder {
    config: SessionConfig,
    settings: Option<Arc<dyn SettingsStore>>,
    cache: Option<Arc<ObjectCache>>,
    network: Option<Arc<NetworkMonitor>>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
    push: Option<Arc<dyn PushRegistrar>>,
}

impl SessionManagerBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            settings: None,
            cache: None,
            network: None,
            analytics: None,
            push: None,
        }
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn cache(mut self, cache: Arc<ObjectCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn network(mut self, network: Arc<NetworkMonitor>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn push(mut self, push: Arc<dyn PushRegistrar>) -> Self {
        self.push = Some(push);
        self
    }

    /// Build the manager, restoring the persisted token.
    pub async fn build(self) -> Arc<SessionManager> {
        let settings = self
            .settings
            .unwrap_or_else(|| Arc::new(MemorySettings::new()));
        let cache = self.cache.unwrap_or_else(ObjectCache::new);

        let transport = Transport::with_timeout(
            self.config.environment.clone(),
            self.config.request_timeout,
        );
        let token = settings.get(keys::AUTH_TOKEN).await;
        if token.is_some() {
            debug!("restored persisted auth token");
        }
        transport.set_token(token).await;

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(SessionManager {
            config: self.config,
            api: ApiClient::new(Arc::new(transport), cache),
            settings,
            network: self.network.unwrap_or_default(),
            analytics: self.analytics.unwrap_or_else(|| Arc::new(NoopAnalytics)),
            push: self.push.unwrap_or_else(|| Arc::new(NoopPush)),
            state: RwLock::new(SessionState::default()),
            configuration: RwLock::new(None),
            events_tx,
            shutdown_tx,
        })
    }
}

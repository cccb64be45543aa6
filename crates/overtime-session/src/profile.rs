//! User-facing account operations built on the session.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::dates;
use crate::error::{RequestError, SessionError};
use crate::fetch::FetchResponse;
use crate::platform::report_error;
use crate::session::{SessionEvent, SessionManager, TokenResponse};
use crate::settings::keys;
use crate::transport::Request;
use crate::types::{User, UserFetchResponse, UserNotificationTypesFetchResponse};

/// Outcome of requesting a verification code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendVerificationResult {
    Success,
    /// The number was rejected (400).
    BadRequest,
    /// Sending was refused (403).
    Forbidden,
    NetworkFailure,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserPresence {
    #[serde(default, deserialize_with = "dates::deserialize_option")]
    pub consecutive_days_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserPresenceFetchResponse {
    pub user_presence: UserPresence,
}

impl FetchResponse for UserPresenceFetchResponse {
    type Object = UserPresence;

    fn objects(&self) -> Vec<&UserPresence> {
        vec![&self.user_presence]
    }
}

/// Normalize a phone number to E.164: ten digits get a `+1` prefix, anything
/// else a bare `+`.
pub fn normalize_phone(phone: &str) -> String {
    if phone.chars().count() == 10 {
        format!("+1{}", phone)
    } else {
        format!("+{}", phone)
    }
}

impl SessionManager {
    /// Fetch the current user into the cache, optionally with notification types.
    ///
    /// Returns `Ok(false)` without a current user.
    #[instrument(skip(self))]
    pub async fn refresh_user(&self, with_children: bool) -> Result<bool, RequestError> {
        let Some(user_id) = self.current_user_id().await else {
            return Ok(false);
        };

        let was_cached = self.cache().find_one::<User>(&user_id).await.is_some();

        let request = Request::get(format!("api/users/v1/{}?nocache=true", user_id)).authenticated();
        self.api
            .fetch_and_persist::<UserFetchResponse>(&request)
            .await?;

        if !was_cached {
            self.emit(SessionEvent::CurrentUserChanged(Some(user_id.clone())));
            self.update_session_identity().await;
        }

        if with_children {
            let request =
                Request::get(format!("api/users/v1/{}/notification_types", user_id)).authenticated();
            let response = self
                .api
                .fetch::<UserNotificationTypesFetchResponse>(&request)
                .await?;
            self.store_notification_types(&user_id, response.notification_types)
                .await?;
        }

        Ok(true)
    }

    async fn store_notification_types(
        &self,
        user_id: &str,
        notification_types: Vec<String>,
    ) -> Result<(), RequestError> {
        self.cache()
            .write(|txn| {
                if let Some(user) = txn.get_mut::<User>(user_id) {
                    user.notification_types = notification_types;
                }
                Ok(())
            })
            .await
            .map_err(|e| RequestError::Write(e.to_string()))
    }

    /// Update profile fields of the current user.
    #[instrument(skip(self, fields))]
    pub async fn update_profile(&self, fields: Value) -> bool {
        let Some(user_id) = self.current_user_id().await else {
            return false;
        };

        let request = Request::put(format!("api/writer/users/v1/{}", user_id))
            .parameters(fields)
            .authenticated();
        match self
            .api
            .fetch_and_persist::<UserFetchResponse>(&request)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                report_error(self.analytics.as_ref(), "Failed to update profile", &e);
                false
            }
        }
    }

    pub async fn check_username_availability(&self, username: &str) -> bool {
        let request =
            Request::get(format!("api/users/v1/username_available/{}", username)).authenticated();
        self.api.request(&request).await.is_ok()
    }

    /// Text a verification code to a phone number.
    #[instrument(skip(self, phone))]
    pub async fn send_verification(&self, phone: &str) -> SendVerificationResult {
        let device_id = self
            .settings
            .get(keys::DEVICE_ID)
            .await
            .unwrap_or_default();
        let request = Request::post("api/auth/send_code").parameters(json!({
            "phone": normalize_phone(phone),
            "device_id": device_id,
        }));

        match self.api.request(&request).await {
            Ok(_) => SendVerificationResult::Success,
            Err(e) => {
                report_error(self.analytics.as_ref(), "Failed to send verification code", &e);
                match e {
                    RequestError::BadStatus(400) => SendVerificationResult::BadRequest,
                    RequestError::BadStatus(403) => SendVerificationResult::Forbidden,
                    _ => SendVerificationResult::NetworkFailure,
                }
            }
        }
    }

    pub async fn resend_code(&self, phone: &str) -> bool {
        let request = Request::post("api/auth/resend_code").parameters(json!({
            "phone": normalize_phone(phone),
        }));

        match self.api.request(&request).await {
            Ok(_) => true,
            Err(e) => {
                report_error(self.analytics.as_ref(), "Failed to resend verification code", &e);
                false
            }
        }
    }

    /// Exchange a phone number and code for an auth token.
    #[instrument(skip(self, phone, code))]
    pub async fn verify(&self, phone: &str, code: &str) -> Result<String, SessionError> {
        let request = Request::post("api/auth/verify_code").parameters(json!({
            "phone": normalize_phone(phone),
            "code": code,
        }));

        match self.api.decoded::<TokenResponse>(&request).await {
            Ok(response) => Ok(response.token),
            Err(e) => {
                report_error(self.analytics.as_ref(), "Failed to verify verification code", &e);
                Err(SessionError::Verification)
            }
        }
    }

    /// Verify a code, adopt the resulting token and migrate any device user.
    pub async fn sign_in(&self, phone: &str, code: &str) -> Result<bool, SessionError> {
        let was_device_user = self.is_device_user().await;
        let token = self.verify(phone, code).await?;

        if !self.validate_auth_token(&token).await {
            return Ok(false);
        }
        if was_device_user && !self.migrate_device_user().await {
            debug!("device user migration skipped or failed");
        }
        Ok(true)
    }

    /// Subscribe the current user to a notification type.
    pub async fn enable_notification(&self, notification: &str) -> bool {
        let Some(user_id) = self.current_user_id().await else {
            return false;
        };
        let request = Request::post(format!("api/writer/users/v1/{}/notification_types", user_id))
            .parameters(json!({ "notification_type": notification }))
            .authenticated();
        self.apply_notification_change(&user_id, &request, "Failed to enable notification")
            .await
    }

    /// Unsubscribe the current user from a notification type.
    pub async fn disable_notification(&self, notification: &str) -> bool {
        let Some(user_id) = self.current_user_id().await else {
            return false;
        };
        let request = Request::delete(format!(
            "api/writer/users/v1/{}/notification_types/{}",
            user_id, notification
        ))
        .authenticated();
        self.apply_notification_change(&user_id, &request, "Failed to disable notification")
            .await
    }

    async fn apply_notification_change(
        &self,
        user_id: &str,
        request: &Request,
        description: &str,
    ) -> bool {
        let result = async {
            let response = self
                .api
                .fetch::<UserNotificationTypesFetchResponse>(request)
                .await?;
            self.store_notification_types(user_id, response.notification_types)
                .await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                report_error(self.analytics.as_ref(), description, &e);
                false
            }
        }
    }

    /// Store the platform push token, base64 encoded.
    pub async fn set_push_device_token(&self, token: &[u8]) {
        if let Err(e) = self
            .settings
            .set(keys::PUSH_DEVICE_TOKEN, &BASE64.encode(token))
            .await
        {
            warn!(error = %e, "failed to persist push device token");
        }
    }

    /// Report presence for this device.
    ///
    /// Skipped (`Ok(false)`) while offline, or until both a push token and a
    /// session token exist.
    pub async fn update_presence(&self) -> Result<bool, RequestError> {
        if !self.network.is_network_connected() {
            return Ok(false);
        }

        let device_token = self
            .settings
            .get(keys::PUSH_DEVICE_TOKEN)
            .await
            .filter(|t| !t.is_empty());
        let (Some(device_token), Some(_)) = (device_token, self.session_token().await) else {
            return Ok(false);
        };

        let app = &self.config.app;
        let request = Request::post("api/writer/user_presences/v1")
            .parameters(json!({
                "application_name": app.application_name(),
                "device_token": device_token,
                "bundle_identifier": app.bundle_id,
            }))
            .authenticated();
        let response = self
            .api
            .fetch::<UserPresenceFetchResponse>(&request)
            .await?;

        if let Some(user_id) = self.current_user_id().await {
            let started_at = response.user_presence.consecutive_days_started_at;
            self.cache()
                .write(|txn| {
                    if let Some(user) = txn.get_mut::<User>(&user_id) {
                        user.consecutive_days_started_at = started_at;
                    }
                    Ok(())
                })
                .await
                .map_err(|e| RequestError::Write(e.to_string()))?;
        }

        debug!("presence updated");
        Ok(true)
    }

    /// Delete the current user's account within an application context.
    pub async fn delete_account(&self, app_context: &str) -> bool {
        if self.current_user_id().await.is_none() {
            return false;
        }

        let request = Request::delete(format!("api/writer/{}/v1/accounts", app_context)).authenticated();
        match self.api.request(&request).await {
            Ok(_) => true,
            Err(e) => {
                report_error(self.analytics.as_ref(), "Failed to delete account", &e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("5551234567"), "+15551234567");
        assert_eq!(normalize_phone("445551234567"), "+445551234567");
    }

    #[test]
    fn test_presence_response_decodes() {
        let response: UserPresenceFetchResponse = serde_json::from_str(
            r#"{"user_presence": {"consecutive_days_started_at": "2024-08-23T00:00:00.000Z"}}"#,
        )
        .unwrap();
        assert!(response.user_presence.consecutive_days_started_at.is_some());
        assert_eq!(response.objects().len(), 1);
    }
}

//! Application configuration and build gating.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::fetch::FetchResponse;
use crate::platform::report_error;
use crate::session::SessionManager;
use crate::settings::keys;
use crate::transport::Request;

/// Minimum time between suggested-update prompts.
pub const UPDATE_PROMPT_INTERVAL: Duration = Duration::hours(6);

/// Server-side configuration for this application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfiguration {
    pub id: String,
    pub app_id: String,
    #[serde(default)]
    pub app_name: Option<String>,
    pub minimum_build_number: u32,
    #[serde(default)]
    pub suggested_build_number: Option<u32>,
    #[serde(default)]
    pub configuration: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfigurationFetchResponse {
    pub app_configuration: ApplicationConfiguration,
}

impl FetchResponse for AppConfigurationFetchResponse {
    type Object = ApplicationConfiguration;

    fn objects(&self) -> Vec<&ApplicationConfiguration> {
        vec![&self.app_configuration]
    }
}

/// Whether the running build must or should be updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppUpdateStatus {
    #[default]
    UpToDate,
    Required,
    Suggested,
}

impl AppUpdateStatus {
    /// Persisted status code.
    pub fn code(self) -> u8 {
        match self {
            AppUpdateStatus::UpToDate => 0,
            AppUpdateStatus::Required => 1,
            AppUpdateStatus::Suggested => 2,
        }
    }

    /// Decode a persisted code. Unknown codes are up to date.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => AppUpdateStatus::Required,
            2 => AppUpdateStatus::Suggested,
            _ => AppUpdateStatus::UpToDate,
        }
    }

    /// Compare a build number against the configured thresholds.
    pub fn evaluate(build_number: u32, configuration: Option<&ApplicationConfiguration>) -> Self {
        let Some(configuration) = configuration else {
            return AppUpdateStatus::UpToDate;
        };

        if build_number < configuration.minimum_build_number {
            AppUpdateStatus::Required
        } else if configuration
            .suggested_build_number
            .is_some_and(|suggested| build_number < suggested)
        {
            AppUpdateStatus::Suggested
        } else {
            AppUpdateStatus::UpToDate
        }
    }
}

/// Update prompt the host should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePrompt {
    Required,
    Suggested,
}

/// Outcome of application launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchState {
    pub logged_in: bool,
    pub update_prompt: Option<UpdatePrompt>,
    /// The current user has moderation flags to acknowledge.
    pub requires_moderation: bool,
}

impl SessionManager {
    /// Fetch this application's configuration and recompute the update status.
    #[instrument(skip(self))]
    pub async fn fetch_configuration(&self) -> bool {
        let bundle_id = self.config.app.bundle_id.clone();
        if bundle_id.is_empty() {
            warn!("no bundle identifier configured");
            self.set_application_configuration(None).await;
            return false;
        }

        let request =
            Request::get(format!("api/app_configurations/v1/app_id/{}", bundle_id)).authenticated();
        match self
            .api
            .fetch::<AppConfigurationFetchResponse>(&request)
            .await
        {
            Ok(response) => {
                self.set_application_configuration(Some(response.app_configuration))
                    .await;
                true
            }
            Err(e) => {
                report_error(self.analytics.as_ref(), "Failed to fetch app configuration", &e);
                self.set_application_configuration(None).await;
                false
            }
        }
    }

    pub async fn application_configuration(&self) -> Option<ApplicationConfiguration> {
        self.configuration.read().await.clone()
    }

    /// Free-form configuration values.
    pub async fn configuration(&self) -> Option<HashMap<String, String>> {
        self.configuration
            .read()
            .await
            .as_ref()
            .and_then(|c| c.configuration.clone())
    }

    /// Replace the configuration and recompute the update status.
    pub async fn set_application_configuration(
        &self,
        configuration: Option<ApplicationConfiguration>,
    ) {
        *self.configuration.write().await = configuration;
        self.refresh_app_update_status().await;
    }

    /// Recompute and persist the update status from the current configuration.
    pub async fn refresh_app_update_status(&self) -> AppUpdateStatus {
        let build_number = self.config.app.build_number;
        let status = {
            let configuration = self.configuration.read().await;
            if let Some(c) = configuration.as_ref() {
                debug!(
                    build_number,
                    minimum = c.minimum_build_number,
                    suggested = ?c.suggested_build_number,
                    "checking build"
                );
            }
            AppUpdateStatus::evaluate(build_number, configuration.as_ref())
        };

        if let Err(e) = self
            .settings
            .set(keys::APP_UPDATE_STATUS, &status.code().to_string())
            .await
        {
            warn!(error = %e, "failed to persist app update status");
        }
        status
    }

    /// Last computed update status.
    pub async fn app_update_status(&self) -> AppUpdateStatus {
        self.settings
            .get(keys::APP_UPDATE_STATUS)
            .await
            .and_then(|code| code.parse().ok())
            .map(AppUpdateStatus::from_code)
            .unwrap_or_default()
    }

    /// Which update prompt to show at `now`, if any.
    ///
    /// Suggested updates are prompted at most once per
    /// [`UPDATE_PROMPT_INTERVAL`] unless the debug override is set.
    pub async fn update_prompt(&self, now: DateTime<Utc>) -> Option<UpdatePrompt> {
        match self.app_update_status().await {
            AppUpdateStatus::UpToDate => None,
            AppUpdateStatus::Required => Some(UpdatePrompt::Required),
            AppUpdateStatus::Suggested => {
                let last_prompt = self
                    .settings
                    .get(keys::UPDATE_PROMPT_AT)
                    .await
                    .and_then(|raw| raw.parse::<f64>().ok())
                    .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0) as i64))
                    .unwrap_or(DateTime::UNIX_EPOCH);
                let debug_override = self
                    .settings
                    .get(keys::DEBUG_UPDATE_PROMPT)
                    .await
                    .is_some_and(|v| v == "true" || v == "1");

                if now <= last_prompt + UPDATE_PROMPT_INTERVAL && !debug_override {
                    return None;
                }

                let stamp = now.timestamp_millis() as f64 / 1000.0;
                if let Err(e) = self
                    .settings
                    .set(keys::UPDATE_PROMPT_AT, &stamp.to_string())
                    .await
                {
                    warn!(error = %e, "failed to persist update prompt time");
                }
                Some(UpdatePrompt::Suggested)
            }
        }
    }

    /// Launch sequence: configuration, login, update prompt, moderation check.
    #[instrument(skip(self))]
    pub async fn launch(&self) -> LaunchState {
        if !self.fetch_configuration().await {
            debug!("continuing launch without app configuration");
        }
        let logged_in = self.is_logged_in().await;
        // A rejected token clears settings, including the persisted status.
        self.refresh_app_update_status().await;
        let update_prompt = self.update_prompt(Utc::now()).await;
        let requires_moderation = self
            .current_user()
            .await
            .is_some_and(|u| u.requires_moderation_acknowledgement());

        info!(logged_in, ?update_prompt, requires_moderation, "launch complete");
        LaunchState {
            logged_in,
            update_prompt,
            requires_moderation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configuration(minimum: u32, suggested: Option<u32>) -> ApplicationConfiguration {
        ApplicationConfiguration {
            id: "c1".to_string(),
            app_id: "tv.overtime.app".to_string(),
            app_name: None,
            minimum_build_number: minimum,
            suggested_build_number: suggested,
            configuration: None,
        }
    }

    #[test]
    fn test_evaluate_boundaries() {
        let config = configuration(100, Some(120));

        assert_eq!(AppUpdateStatus::evaluate(99, Some(&config)), AppUpdateStatus::Required);
        assert_eq!(AppUpdateStatus::evaluate(100, Some(&config)), AppUpdateStatus::Suggested);
        assert_eq!(AppUpdateStatus::evaluate(119, Some(&config)), AppUpdateStatus::Suggested);
        assert_eq!(AppUpdateStatus::evaluate(120, Some(&config)), AppUpdateStatus::UpToDate);
    }

    #[test]
    fn test_evaluate_without_suggestion_or_configuration() {
        let config = configuration(100, None);
        assert_eq!(AppUpdateStatus::evaluate(100, Some(&config)), AppUpdateStatus::UpToDate);
        assert_eq!(AppUpdateStatus::evaluate(0, None), AppUpdateStatus::UpToDate);
    }

    #[test]
    fn test_status_codes() {
        for status in [
            AppUpdateStatus::UpToDate,
            AppUpdateStatus::Required,
            AppUpdateStatus::Suggested,
        ] {
            assert_eq!(AppUpdateStatus::from_code(status.code()), status);
        }
        assert_eq!(AppUpdateStatus::Required.code(), 1);
        assert_eq!(AppUpdateStatus::from_code(9), AppUpdateStatus::UpToDate);
    }

    #[test]
    fn test_configuration_decodes() {
        let response: AppConfigurationFetchResponse = serde_json::from_str(
            r#"{"app_configuration": {
                "id": "c1",
                "app_id": "tv.overtime.app",
                "minimum_build_number": 340,
                "configuration": {"feed": "v2"}
            }}"#,
        )
        .unwrap();

        let config = response.app_configuration;
        assert_eq!(config.minimum_build_number, 340);
        assert_eq!(config.suggested_build_number, None);
        assert_eq!(
            config.configuration.unwrap().get("feed").map(String::as_str),
            Some("v2")
        );
    }
}

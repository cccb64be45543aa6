//! Session core for Overtime client applications.
//!
//! This crate manages the authentication lifecycle against the Overtime API
//! and keeps fetched entities in a local object cache.
//!
//! ## Features
//!
//! - **Transport**: HTTP client with bearer auth and status classification
//! - **Fetch**: typed request, decode and persist pipeline
//! - **Cache**: single-writer entity cache with frozen snapshots
//! - **Session**: token validation, anonymous device users and migration
//! - **App config**: build gating and update prompts

pub mod app_config;
pub mod cache;
pub mod config;
pub mod dates;
mod error;
pub mod fetch;
pub mod permissions;
pub mod platform;
mod profile;
pub mod session;
pub mod settings;
pub mod transport;
pub mod types;
mod uploads;

pub use app_config::{
    AppUpdateStatus, ApplicationConfiguration, LaunchState, UPDATE_PROMPT_INTERVAL, UpdatePrompt,
};
pub use cache::{
    CacheUpdate, Entity, EntityKind, Merge, ObjectCache, Snapshot, Upsert, WriteTransaction,
};
pub use config::{AppInfo, Environment, RetryPolicy, SessionConfig};
pub use error::{CacheError, RequestError, SessionError, SettingsError};
pub use fetch::{ApiClient, FetchResponse};
pub use permissions::{Permission, PermissionAccess, PermissionProvider};
pub use platform::{
    AnalyticsSink, MemoryAnalytics, NetworkMonitor, NetworkStatus, NoopAnalytics, NoopPush,
    PushRegistrar,
};
pub use profile::{SendVerificationResult, UserPresence, normalize_phone};
pub use session::{AuthPhase, SessionEvent, SessionManager, SessionManagerBuilder, SessionState};
pub use settings::{FileSettings, MemorySettings, SettingsStore};
pub use transport::{Request, RequestEncoding, Response, ResponseMetrics, Transport};
pub use types::*;
pub use uploads::{UploadCredentials, UploadType};

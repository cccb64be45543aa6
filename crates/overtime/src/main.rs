//! Overtime: command-line client for the session core.
//!
//! Subcommands:
//! - `login`: run the launch sequence and establish a session
//! - `status`: show the stored session without touching the network
//! - `send-code` / `verify`: phone verification and sign-in
//! - `config`: fetch the app configuration and report the update status
//! - `presence`: ping presence until interrupted
//! - `logout`: wipe the session and the local cache

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use miette::Result;
use overtime_session::settings::keys;
use overtime_session::{
    AppInfo, Environment, FileSettings, ObjectCache, SendVerificationResult, SessionConfig,
    SessionManager, SettingsStore, UpdatePrompt, User,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "overtime")]
#[command(about = "Overtime session client", long_about = None)]
struct Cli {
    #[command(flatten)]
    options: SessionOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SessionOptions {
    /// API environment: production, staging, development or a base URL
    #[arg(
        long,
        global = true,
        env = "OVERTIME_ENVIRONMENT",
        default_value = "production"
    )]
    environment: Environment,

    /// Build number compared against the server's minimum and suggested builds
    #[arg(long, global = true, env = "OVERTIME_BUILD_NUMBER", default_value = "0")]
    build_number: u32,

    /// Application bundle identifier
    #[arg(
        long,
        global = true,
        env = "OVERTIME_BUNDLE_ID",
        default_value = "tv.overtime.cli"
    )]
    bundle_id: String,

    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true, env = "OVERTIME_SETTINGS_PATH")]
    settings_path: Option<PathBuf>,

    /// Entity cache file (defaults to the user cache directory)
    #[arg(long, global = true, env = "OVERTIME_CACHE_PATH")]
    cache_path: Option<PathBuf>,

    /// Accept a stored session while the network is unreachable
    #[arg(
        long,
        global = true,
        env = "OVERTIME_ALLOW_OFFLINE",
        action = clap::ArgAction::Set,
        value_parser = parse_bool_env,
        default_value = "false"
    )]
    allow_offline: bool,

    /// Create an anonymous device user when no token is stored
    #[arg(
        long,
        global = true,
        env = "OVERTIME_ALLOW_ANONYMOUS",
        action = clap::ArgAction::Set,
        value_parser = parse_bool_env,
        default_value = "true"
    )]
    allow_anonymous: bool,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value = "10")]
    timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch configuration, log in and report update prompts
    Login,

    /// Show the stored session without network access
    Status,

    /// Text a verification code to a phone number
    SendCode {
        /// Phone number (ten digits get a +1 prefix)
        phone: String,

        /// Resend a previously requested code
        #[arg(long)]
        resend: bool,
    },

    /// Sign in with a phone number and verification code
    Verify {
        /// Phone number the code was sent to
        phone: String,

        /// Verification code
        code: String,
    },

    /// Fetch the app configuration and show the update status
    Config,

    /// Report presence periodically until interrupted
    Presence {
        /// Seconds between presence pings
        #[arg(long, default_value = "30")]
        interval: u64,
    },

    /// Wipe the session, settings and local cache
    Logout,
}

impl SessionOptions {
    fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.environment.clone())
            .with_offline_mode(self.allow_offline)
            .with_anonymous_login(self.allow_anonymous)
            .with_request_timeout(Duration::from_secs(self.timeout))
            .with_app(AppInfo {
                display_name: "Overtime CLI".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                build_number: self.build_number,
                bundle_id: self.bundle_id.clone(),
            })
    }

    fn cache_path(&self) -> PathBuf {
        self.cache_path.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("overtime")
                .join("objects.json")
        })
    }

    async fn open_session(&self, config: SessionConfig) -> Result<Arc<SessionManager>> {
        let settings = FileSettings::load(self.settings_path.clone())
            .await
            .map_err(|e| miette::miette!("failed to load settings: {}", e))?;
        tracing::debug!(path = %settings.path().display(), "using settings file");

        let cache_path = self.cache_path();
        let cache = ObjectCache::open(&cache_path)
            .await
            .map_err(|e| miette::miette!("failed to open cache {}: {}", cache_path.display(), e))?;

        Ok(SessionManager::builder(config)
            .settings(Arc::new(settings))
            .cache(cache)
            .build()
            .await)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "overtime=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let options = &cli.options;

    match cli.command {
        Commands::Login => run_login(options).await,
        Commands::Status => run_status(options).await,
        Commands::SendCode { phone, resend } => run_send_code(options, &phone, resend).await,
        Commands::Verify { phone, code } => run_verify(options, &phone, &code).await,
        Commands::Config => run_config(options).await,
        Commands::Presence { interval } => run_presence(options, interval).await,
        Commands::Logout => run_logout(options).await,
    }
}

async fn run_login(options: &SessionOptions) -> Result<()> {
    let session = options.open_session(options.session_config()).await?;
    let launch = session.launch().await;

    match launch.update_prompt {
        Some(UpdatePrompt::Required) => println!("A newer build is required."),
        Some(UpdatePrompt::Suggested) => println!("A newer build is available."),
        None => {}
    }

    if !launch.logged_in {
        return Err(miette::miette!("login failed"));
    }

    print_session(&session).await;
    if launch.requires_moderation {
        println!("Moderation notice pending acknowledgement.");
    }
    Ok(())
}

async fn run_status(options: &SessionOptions) -> Result<()> {
    let config = options
        .session_config()
        .with_offline_mode(true)
        .with_anonymous_login(false);
    let session = options.open_session(config).await?;

    let has_token = session.session_token().await.is_some();
    let device_id = session.settings().get(keys::DEVICE_ID).await;

    println!("Environment: {}", session.config().environment);
    println!("Token stored: {}", if has_token { "yes" } else { "no" });
    println!("Device id: {}", device_id.as_deref().unwrap_or("-"));
    println!("Update status: {:?}", session.app_update_status().await);

    match session.current_user().await {
        Some(user) => println!("User: {}", describe_user(&user)),
        None => println!("User: -"),
    }
    Ok(())
}

async fn run_send_code(options: &SessionOptions, phone: &str, resend: bool) -> Result<()> {
    let session = options.open_session(options.session_config()).await?;

    if resend {
        if !session.resend_code(phone).await {
            return Err(miette::miette!("failed to resend verification code"));
        }
        println!("Verification code resent.");
        return Ok(());
    }

    match session.send_verification(phone).await {
        SendVerificationResult::Success => {
            println!("Verification code sent.");
            Ok(())
        }
        SendVerificationResult::BadRequest => Err(miette::miette!("phone number was rejected")),
        SendVerificationResult::Forbidden => {
            Err(miette::miette!("sending codes to this number is not allowed"))
        }
        SendVerificationResult::NetworkFailure => {
            Err(miette::miette!("could not reach the verification service"))
        }
    }
}

async fn run_verify(options: &SessionOptions, phone: &str, code: &str) -> Result<()> {
    let session = options.open_session(options.session_config()).await?;

    let signed_in = session
        .sign_in(phone, code)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    if !signed_in {
        return Err(miette::miette!("token was rejected after verification"));
    }

    print_session(&session).await;
    Ok(())
}

async fn run_config(options: &SessionOptions) -> Result<()> {
    let session = options.open_session(options.session_config()).await?;

    if !session.fetch_configuration().await {
        return Err(miette::miette!("failed to fetch app configuration"));
    }

    println!("Update status: {:?}", session.app_update_status().await);
    if let Some(prompt) = session.update_prompt(Utc::now()).await {
        println!("Prompt: {:?}", prompt);
    }
    if let Some(values) = session.configuration().await {
        let rendered = serde_json::to_string_pretty(&values)
            .map_err(|e| miette::miette!("failed to render configuration: {}", e))?;
        println!("{}", rendered);
    }
    Ok(())
}

async fn run_presence(options: &SessionOptions, interval: u64) -> Result<()> {
    let config = options
        .session_config()
        .with_presence_interval(Duration::from_secs(interval));
    let session = options.open_session(config).await?;

    if !session.is_logged_in().await {
        return Err(miette::miette!("login failed"));
    }

    let handle = session.start_presence();
    tracing::info!(interval, "presence loop started, press ctrl-c to stop");

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("received shutdown signal");
    session.shutdown();

    handle
        .await
        .map_err(|e| miette::miette!("presence task failed: {}", e))?;
    Ok(())
}

async fn run_logout(options: &SessionOptions) -> Result<()> {
    let session = options.open_session(options.session_config()).await?;
    session.logout().await;
    println!("Logged out.");
    Ok(())
}

async fn print_session(session: &SessionManager) {
    let state = session.state().await;
    println!("Phase: {:?}", state.phase);
    if state.is_admin {
        println!("Role: admin");
    } else if state.is_tester {
        println!("Role: tester");
    }
    match session.current_user().await {
        Some(user) => println!("User: {}", describe_user(&user)),
        None => println!("User: {}", state.current_user_id.as_deref().unwrap_or("-")),
    }
}

fn describe_user(user: &User) -> String {
    let mut description = match &user.username {
        Some(username) => format!("{} (@{})", user.id, username),
        None => user.id.clone(),
    };
    if user.is_device_user() {
        description.push_str(" [device]");
    }
    description
}

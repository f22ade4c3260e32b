mod api;
mod auth;
mod config;
mod device;
mod display;
mod onboarding;

use anyhow::Context;
use api::transport::ReqwestTransport;
use api::ApiClient;
use auth::AuthSession;
use clap::{Parser, Subcommand};
use device::poll::StatusPoller;
use device::{DevicePortal, WifiCredentials};
use display::{DisplayConfig, LineSelection};
use onboarding::{LinkOutcome, OnboardingFlow, OnboardingPhase};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "commute-live")]
#[command(about = "Provision, link and configure Commute Live transit displays")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Account email
    #[arg(long, env = "COMMUTE_LIVE_EMAIL", global = true)]
    email: Option<String>,

    /// Account password
    #[arg(long, env = "COMMUTE_LIVE_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and print the account profile
    Profile,
    /// End the account session on the server and locally
    SignOut,
    /// Read the display's local status (phone/laptop on the setup Wi-Fi)
    DeviceStatus,
    /// Keep polling the display's local status until Ctrl+C
    WatchStatus,
    /// Hand home Wi-Fi credentials to the display and link it to the account
    Onboard {
        /// Home network SSID
        #[arg(long)]
        ssid: String,
        /// Home network password
        #[arg(long, env = "COMMUTE_LIVE_WIFI_PASSWORD", hide_env_values = true)]
        wifi_password: String,
        /// Username for enterprise networks
        #[arg(long, default_value = "")]
        wifi_user: String,
    },
    /// Show or change what a display shows
    Display {
        #[command(subcommand)]
        action: DisplayAction,
    },
}

#[derive(Subcommand)]
enum DisplayAction {
    /// Print the stored display configuration
    Show {
        /// Device id (defaults to the account's selected device)
        #[arg(long)]
        device: Option<String>,
    },
    /// Replace the display configuration
    Set {
        #[arg(long)]
        device: Option<String>,
        /// Layout preset, 1-5
        #[arg(long, default_value_t = 1)]
        display_type: u8,
        /// `mta-subway`, or `mta-bus` for bus stops (no direction)
        #[arg(long, default_value = display::SUBWAY_PROVIDER)]
        provider: String,
        /// LINE@STOP, e.g. E@A32S (repeatable)
        #[arg(long = "line", value_parser = parse_line_arg, required = true)]
        lines: Vec<(String, String)>,
    },
}

fn parse_line_arg(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('@') {
        Some((line, stop)) if !line.trim().is_empty() && !stop.trim().is_empty() => {
            Ok((line.to_string(), stop.to_string()))
        }
        _ => Err(format!("expected LINE@STOP, got {:?}", raw)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = config::Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        config::Config::default()
    });
    config.apply_env();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("Commute Live client v{}", env!("CARGO_PKG_VERSION"));

    let backend = ReqwestTransport::with_cookies(Duration::from_secs(config.api.request_timeout_secs))
        .context("failed to build backend HTTP client")?;
    let api = Arc::new(ApiClient::new(&config.api.base_url, Arc::new(backend)));

    let portal_http = ReqwestTransport::plain(Duration::from_secs(config.device.request_timeout_secs))
        .context("failed to build portal HTTP client")?;
    let portal = Arc::new(DevicePortal::new(&config.device.portal_url, Arc::new(portal_http)));

    let session = AuthSession::start(api.clone()).await;
    session.install_invalidation_handler(|code| {
        error!("Session ended by the server ({}); sign in again", code);
    });

    let result = run(cli, &config, api, portal, session.clone()).await;
    session.remove_invalidation_handler();
    result
}

async fn run(
    cli: Cli,
    config: &config::Config,
    api: Arc<ApiClient>,
    portal: Arc<DevicePortal>,
    session: Arc<AuthSession>,
) -> anyhow::Result<()> {
    match cli.command {
        Command::Profile => {
            sign_in(&session, &cli.email, &cli.password).await?;
            let state = session.snapshot();
            if let Some(user) = &state.user {
                println!("{} ({})", user.email, user.id);
            }
            for id in &state.device_ids {
                let marker = if state.device_id.as_deref() == Some(id) { "*" } else { " " };
                println!(" {} {}", marker, id);
            }
        }
        Command::SignOut => {
            if cli.email.is_some() && cli.password.is_some() {
                sign_in(&session, &cli.email, &cli.password).await?;
            }
            session.sign_out().await;
            println!("Signed out");
        }
        Command::DeviceStatus => match portal.status().await {
            Ok(Some(report)) => println!(
                "[{}] device {} wifi {}",
                report.observed_at.format("%H:%M:%S"),
                report.device_id.as_deref().unwrap_or("<unknown>"),
                match report.wifi_connected {
                    Some(true) => "connected",
                    Some(false) => "disconnected",
                    None => "unknown",
                }
            ),
            Ok(None) => println!("display answered without a usable status"),
            Err(e) => anyhow::bail!("display portal unreachable: {}", e),
        },
        Command::WatchStatus => {
            let mut rx = session.subscribe();
            let _poller = StatusPoller::spawn(
                portal,
                session.clone(),
                Duration::from_secs(config.device.status_poll_secs),
            );
            info!("Polling display status. Press Ctrl+C to stop.");
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = rx.borrow_and_update().clone();
                        println!(
                            "device {} status {:?}",
                            state.device_id.as_deref().unwrap_or("<unknown>"),
                            state.device_status
                        );
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Command::Onboard {
            ssid,
            wifi_password,
            wifi_user,
        } => {
            sign_in(&session, &cli.email, &cli.password).await?;
            let credentials = WifiCredentials::new(ssid, wifi_password).with_username(wifi_user);
            onboard(api, portal, session, credentials).await?;
        }
        Command::Display { action } => {
            sign_in(&session, &cli.email, &cli.password).await?;
            match action {
                DisplayAction::Show { device } => {
                    let device_id = resolve_device(&session, device)?;
                    match display::load(&api, &device_id).await {
                        Some(config) => println!("{}", serde_json::to_string_pretty(&config)?),
                        None => println!("no configuration stored for {}", device_id),
                    }
                }
                DisplayAction::Set {
                    device,
                    display_type,
                    provider,
                    lines,
                } => {
                    let device_id = resolve_device(&session, device)?;
                    let config = DisplayConfig {
                        display_type,
                        lines: lines
                            .iter()
                            .map(|(line, stop)| LineSelection::for_provider(&provider, line, stop))
                            .collect(),
                    };
                    display::save(&api, &device_id, &config).await?;
                    let summary: Vec<String> = config
                        .lines
                        .iter()
                        .map(|l| format!("{}@{}", l.line, l.stop))
                        .collect();
                    println!("Updated {}", summary.join(", "));
                }
            }
        }
    }
    Ok(())
}

async fn sign_in(
    session: &AuthSession,
    email: &Option<String>,
    password: &Option<String>,
) -> anyhow::Result<()> {
    if session.snapshot().is_authenticated() {
        debug!("Reusing the existing session");
        return Ok(());
    }
    let (Some(email), Some(password)) = (email, password) else {
        anyhow::bail!("--email and --password (or COMMUTE_LIVE_EMAIL / COMMUTE_LIVE_PASSWORD) are required");
    };
    let signed_in = session.sign_in(email, password).await.context("sign-in failed")?;
    info!(
        "Signed in as {} with {} linked display(s)",
        signed_in.user.email,
        signed_in.device_ids.len()
    );
    Ok(())
}

fn resolve_device(session: &AuthSession, explicit: Option<String>) -> anyhow::Result<String> {
    explicit
        .or_else(|| session.device_id())
        .context("no display linked to this account; pass --device")
}

async fn wait_for_enter(prompt: &str) -> anyhow::Result<bool> {
    println!("{}", prompt);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    Ok(lines.next_line().await?.is_some())
}

/// Interactive onboarding: the account session is established first, then
/// the user joins the display's setup Wi-Fi before credentials are sent.
async fn onboard(
    api: Arc<ApiClient>,
    portal: Arc<DevicePortal>,
    session: Arc<AuthSession>,
    credentials: WifiCredentials,
) -> anyhow::Result<()> {
    if !credentials.can_connect() {
        anyhow::bail!("an SSID and a non-blank Wi-Fi password are required");
    }

    let mut flow = OnboardingFlow::new(api, portal, session.clone());
    if !wait_for_enter("Join the display's setup Wi-Fi, then press Enter.").await? {
        return Ok(());
    }

    match flow.read_portal_status().await {
        Some(id) => info!("Display {} answered on its setup network", id),
        None => warn!("Display status unavailable, will ask for its id after Wi-Fi setup"),
    }

    flow.connect(&credentials).await;

    loop {
        match flow.state().phase() {
            OnboardingPhase::AwaitingHomeNetwork { device_id } => {
                let message = flow.state().message.clone().unwrap_or_default();
                info!("Link for display {} is waiting on the network switch", device_id);
                if !wait_for_enter(&message).await? {
                    warn!("Input closed before the link could be retried");
                    return Ok(());
                }
                match flow.retry_link().await {
                    Some(LinkOutcome::AlreadyLinked(source)) => {
                        info!("Display {} was already on the account ({:?})", device_id, source)
                    }
                    Some(outcome) => debug!("Link retry for {}: {:?}", device_id, outcome),
                    None => return Ok(()),
                }
            }
            OnboardingPhase::Failed(message) => {
                if let Some(raw) = &flow.state().device_response {
                    debug!("Last display answer: {}", raw);
                }
                anyhow::bail!("onboarding failed: {}", message)
            }
            OnboardingPhase::Configured => {
                let state = session.snapshot();
                match state.selected_device() {
                    Some(device) if state.device_source(&device.id).is_some() => println!(
                        "{} ({}) is on your Wi-Fi and linked to your account",
                        device.name,
                        if device.online { "online" } else { "offline" }
                    ),
                    _ => println!("Display Wi-Fi configured"),
                }
                return Ok(());
            }
            OnboardingPhase::Idle | OnboardingPhase::Connecting => return Ok(()),
        }
    }
}

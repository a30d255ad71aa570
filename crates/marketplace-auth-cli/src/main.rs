use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use marketplace_auth_core::auth::{
    AuthManager, Collaborators, HttpOuterSession, OuterSession, Provider, RecordLookup,
    SignoutReport, TokenPair,
};
use marketplace_auth_core::config::{AuthConfig, ConfigLocator};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_WEB_URL: &str = "http://localhost:3000";
const COOKIE_ENV: &str = "MARKETPLACE_AUTH_COOKIE";

#[derive(Parser, Debug)]
#[command(author, version, about = "Marketplace credential lifecycle tool")]
struct Cli {
    /// Base URL of the web tier serving the outer session
    #[arg(long = "web-url", global = true, default_value = DEFAULT_WEB_URL)]
    web_url: Url,
    /// Session cookie to forward (falls back to MARKETPLACE_AUTH_COOKIE)
    #[arg(long, global = true)]
    cookie: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the current credentials and show the stored record
    Status(StatusArgs),
    /// Store a backend token pair and make its provider active
    Login(LoginArgs),
    /// Run one refresh attempt for the active provider
    Refresh,
    /// Inspect or change the active provider
    #[command(subcommand)]
    Provider(ProviderCommand),
    /// Drop credentials for the active provider, or everything with --full
    Logout(LogoutArgs),
}

#[derive(Subcommand, Debug)]
enum ProviderCommand {
    /// Print the active provider
    Get,
    /// Switch the active provider
    Set(ProviderSetArgs),
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Page path to guard; a redirect decision is printed when given
    #[arg(long)]
    path: Option<String>,
}

#[derive(Args, Debug)]
struct LoginArgs {
    /// Provider that issued the tokens (primary or secondary)
    #[arg(long, default_value = "primary")]
    provider: Provider,
    #[arg(long)]
    access: String,
    #[arg(long)]
    refresh: Option<String>,
}

#[derive(Args, Debug)]
struct ProviderSetArgs {
    provider: Provider,
}

#[derive(Args, Debug)]
struct LogoutArgs {
    /// Also end the outer session and clear all local state
    #[arg(long)]
    full: bool,
    /// Where to go after a full sign-out
    #[arg(long = "redirect-to")]
    redirect_to: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let manager = build_manager(&cli)?;

    let output = match cli.command {
        Commands::Status(args) => status(&manager, args).await,
        Commands::Login(args) => login(&manager, args).await?,
        Commands::Refresh => refresh(&manager).await?,
        Commands::Provider(ProviderCommand::Get) => {
            json!({ "provider": manager.active_provider().await })
        }
        Commands::Provider(ProviderCommand::Set(args)) => {
            manager
                .switch_provider(args.provider)
                .await
                .context("failed to store active provider")?;
            json!({ "provider": args.provider })
        }
        Commands::Logout(args) => logout(&manager, args).await,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn build_manager(cli: &Cli) -> Result<AuthManager> {
    let locator = ConfigLocator::new().context("unable to locate config directory")?;
    let config = AuthConfig::load(&locator).context("failed to load configuration")?;

    let session_url = cli.web_url.join("api/auth/session")?;
    let signout_url = cli.web_url.join("api/auth/signout")?;
    let mut outer = HttpOuterSession::new(session_url, signout_url, config.store.timeout())
        .context("failed to build session client")?;
    if let Some(cookie) = cli.cookie.clone().or_else(|| env::var(COOKIE_ENV).ok()) {
        outer = outer.with_cookie(cookie);
    }
    let outer: Arc<dyn OuterSession> = Arc::new(outer);

    let collaborators =
        Collaborators::http(&config, outer).context("failed to build store client")?;
    AuthManager::new(&config, collaborators).context("failed to initialise auth manager")
}

async fn status(manager: &AuthManager, args: StatusArgs) -> Value {
    let provider = manager.active_provider().await;
    let record = match manager.current_record().await {
        RecordLookup::Found(record) => json!({
            "refreshAttempts": record.refresh_attempts,
            "lastRefreshTime": record.last_refresh_time,
            "lastRefreshFailed": record.last_refresh_failed,
            "hasRefreshToken": record.refresh.is_some(),
            "createdAt": record.created_at,
        }),
        RecordLookup::Missing => Value::Null,
        RecordLookup::Unreadable(reason) => json!({ "unreadable": reason }),
    };

    let (validation, redirect) = match args.path {
        Some(path) => {
            let (result, decision) = manager.guard(&path).await;
            (result, decision.map(|decision| format!("{decision:?}")))
        }
        None => (manager.validate().await, None),
    };

    json!({
        "provider": provider,
        "record": record,
        "validation": validation,
        "redirect": redirect,
    })
}

async fn login(manager: &AuthManager, args: LoginArgs) -> Result<Value> {
    if args.access.trim().is_empty() {
        bail!("access token must not be empty");
    }
    let tokens = TokenPair {
        access: args.access,
        refresh: args.refresh,
    };
    manager
        .login(args.provider, tokens)
        .await
        .context("failed to store credentials")?;
    Ok(json!({ "provider": args.provider, "stored": true }))
}

async fn refresh(manager: &AuthManager) -> Result<Value> {
    let provider = manager.active_provider().await;
    let tokens = manager
        .refresh()
        .await
        .with_context(|| format!("refresh failed for provider '{provider}'"))?;
    Ok(json!({
        "provider": provider,
        "refreshed": true,
        "hasRefreshToken": tokens.refresh.is_some(),
    }))
}

async fn logout(manager: &AuthManager, args: LogoutArgs) -> Value {
    let report = if args.full {
        manager.full_signout(args.redirect_to.as_deref()).await
    } else {
        manager.partial_logout().await
    };
    report_json(&report)
}

fn report_json(report: &SignoutReport) -> Value {
    let steps: Vec<Value> = report
        .steps
        .iter()
        .map(|outcome| {
            json!({
                "step": format!("{:?}", outcome.step),
                "succeeded": outcome.succeeded,
                "detail": outcome.detail,
            })
        })
        .collect();
    json!({
        "clean": report.all_succeeded(),
        "steps": steps,
        "redirect": report.redirect,
    })
}

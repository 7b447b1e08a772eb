//! Tradedesk CLI - Command line front end for the Tradedesk backend.
//!
//! Every command prints a JSON `ApiResponse` on stdout; logs go to stderr.

mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tradedesk_core::auth::DEFAULT_SESSION_TIMEOUT;
use tradedesk_core::config::{BACKEND_URL_ENV, SESSION_FILE_ENV};
use tradedesk_core::{
    api, ApiClient, ApiResponse, AuthService, FilePart, LoginCredentials, LoginRedirect,
    Navigator, RequestOptions,
};

use settings::{minutes, parse_header, parse_query, Settings};

#[derive(Parser)]
#[command(name = "tradedesk")]
#[command(about = "Tradedesk CLI - talk to the Tradedesk backend")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend origin
    #[arg(long, global = true, env = BACKEND_URL_ENV)]
    backend_url: Option<String>,

    /// Session store file
    #[arg(long, global = true, env = SESSION_FILE_ENV)]
    session_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether the backend is up
    Health,
    /// Sign in
    Login {
        #[arg(short, long)]
        email: String,
        #[arg(short, long, env = "TRADEDESK_PASSWORD", hide_env_values = true)]
        password: String,
        /// Ask the backend for a long-lived session
        #[arg(long)]
        remember_me: bool,
    },
    /// Sign out and clear local session data
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Renew the session
    Refresh,
    /// Send an API request
    Request {
        /// GET, POST, PUT, PATCH or DELETE
        method: String,
        /// Path under the API base, e.g. /bots
        path: String,
        /// JSON body
        #[arg(short, long)]
        body: Option<String>,
        /// Extra header, NAME:VALUE (repeatable)
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
        /// Query pair, KEY=VALUE (repeatable)
        #[arg(short, long = "query", value_parser = parse_query)]
        query: Vec<(String, String)>,
        /// Request timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Upload a file as multipart form data
    Upload {
        /// Path under the API base, e.g. /trades/import
        path: String,
        /// File to upload
        file: PathBuf,
        /// MIME type of the file
        #[arg(long)]
        mime: Option<String>,
    },
    /// Show local session state
    Session {
        /// Inactivity timeout in minutes
        #[arg(long)]
        timeout_minutes: Option<u64>,
        /// Record activity now
        #[arg(long)]
        touch: bool,
    },
}

/// Reports a forced sign-out on the terminal.
///
/// After the first notice it reports the login route as current, so repeated
/// expiry events print nothing more.
#[derive(Default)]
struct TerminalNavigator {
    route: Mutex<Option<String>>,
}

impl Navigator for TerminalNavigator {
    fn current_route(&self) -> Option<String> {
        self.route.lock().ok().and_then(|route| route.clone())
    }

    fn redirect(&self, route: &str) {
        tracing::warn!("Sign-in required at {}", route);
        eprintln!("Session expired ({route}). Run `tradedesk login` to sign in again.");
        if let Ok(mut current) = self.route.lock() {
            *current = Some(route.to_string());
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(data) => {
            print_response(&ApiResponse::ok(data));
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::debug!("Command failed: {:#}", e);
            print_response(&error_response(&e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<Value> {
    let settings = Settings::load(cli.config.as_deref())?;
    let config = settings.to_config(cli.backend_url, cli.session_file);
    let session_timeout = settings
        .session_timeout()
        .unwrap_or(DEFAULT_SESSION_TIMEOUT);

    let client = api::init(config)?;
    let mut events = client.subscribe();

    let result = execute(cli.command, &client, session_timeout).await;

    let redirect = LoginRedirect::new(TerminalNavigator::default());
    while let Ok(event) = events.try_recv() {
        redirect.handle(&event);
    }
    result
}

async fn execute(
    command: Commands,
    client: &Arc<ApiClient>,
    session_timeout: Duration,
) -> Result<Value> {
    let auth = AuthService::new(client.clone());

    match command {
        Commands::Health => {
            let healthy = client.health_check().await;
            Ok(json!({
                "healthy": healthy,
                "backend": client.config().origin(),
            }))
        }
        Commands::Login {
            email,
            password,
            remember_me,
        } => {
            let mut credentials = LoginCredentials::new(email, password);
            credentials.remember_me = remember_me.then_some(true);
            let user = auth.login(&credentials).await.context("Login failed")?;
            Ok(serde_json::to_value(user)?)
        }
        Commands::Logout => {
            auth.logout().await;
            Ok(json!({ "logged_out": true }))
        }
        Commands::Whoami => {
            let user = auth.current_user().await?;
            Ok(serde_json::to_value(user)?)
        }
        Commands::Refresh => {
            auth.refresh_token().await?;
            Ok(json!({ "refreshed": true }))
        }
        Commands::Request {
            method,
            path,
            body,
            headers,
            query,
            timeout,
        } => {
            let mut options = RequestOptions {
                headers,
                query,
                ..RequestOptions::default()
            };
            if let Some(secs) = timeout {
                options = options.with_timeout(Duration::from_secs(secs));
            }
            let body: Option<Value> = body
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("--body is not valid JSON")?;

            let response: Value = match method.to_ascii_uppercase().as_str() {
                "GET" => client.get(&path, Some(options)).await?,
                "POST" => client.post(&path, body.as_ref(), Some(options)).await?,
                "PUT" => client.put(&path, body.as_ref(), Some(options)).await?,
                "PATCH" => client.patch(&path, body.as_ref(), Some(options)).await?,
                "DELETE" => client.delete(&path, Some(options)).await?,
                other => bail!("Unsupported method: {other}"),
            };
            Ok(response)
        }
        Commands::Upload { path, file, mime } => {
            let mut part = FilePart::from_path(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            if let Some(mime) = mime {
                part = part.with_mime(mime);
            }
            let response: Value = client.upload(&path, part, None).await?;
            Ok(response)
        }
        Commands::Session {
            timeout_minutes,
            touch,
        } => {
            let timeout = timeout_minutes
                .map(minutes)
                .unwrap_or(session_timeout);
            if touch {
                auth.update_activity()?;
            }
            Ok(json!({
                "user": auth.stored_user_data(),
                "expired": auth.is_session_expired(timeout),
                "remaining_secs": auth.session_time_remaining(timeout).as_secs(),
            }))
        }
    }
}

fn error_response(err: &anyhow::Error) -> ApiResponse<()> {
    let response = ApiResponse::err(format!("{err:#}"));
    let error_code = err
        .downcast_ref::<tradedesk_core::Error>()
        .and_then(|e| match e {
            tradedesk_core::Error::Status { error_code, .. } => error_code.clone(),
            _ => None,
        });

    match error_code {
        Some(code) => response.with_error_code(code),
        None => response,
    }
}

fn print_response<T: serde::Serialize>(response: &ApiResponse<T>) {
    match serde_json::to_string_pretty(response) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Failed to encode response: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_request_arguments() {
        let cli = Cli::try_parse_from([
            "tradedesk",
            "--backend-url",
            "http://127.0.0.1:8000",
            "request",
            "post",
            "/bots",
            "--body",
            r#"{"name":"grid"}"#,
            "-H",
            "X-Trace-Id: abc",
            "--query",
            "dry_run=true",
        ])
        .unwrap();

        assert_eq!(cli.backend_url.as_deref(), Some("http://127.0.0.1:8000"));
        match cli.command {
            Commands::Request {
                method,
                path,
                body,
                headers,
                query,
                timeout,
            } => {
                assert_eq!(method, "post");
                assert_eq!(path, "/bots");
                assert_eq!(body.as_deref(), Some(r#"{"name":"grid"}"#));
                assert_eq!(headers, vec![("X-Trace-Id".to_string(), "abc".to_string())]);
                assert_eq!(query, vec![("dry_run".to_string(), "true".to_string())]);
                assert_eq!(timeout, None);
            }
            _ => panic!("expected request command"),
        }
    }

    #[test]
    fn test_bad_header_is_rejected() {
        let result = Cli::try_parse_from(["tradedesk", "request", "GET", "/bots", "-H", "oops"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_expiry_notice_shown_once() {
        let redirect = LoginRedirect::new(TerminalNavigator::default());
        let expired = tradedesk_core::AuthEvent::SessionExpired {
            login_route: "/login".to_string(),
        };

        assert!(redirect.handle(&expired));
        assert!(!redirect.handle(&expired));
        assert_eq!(redirect.navigator().current_route().as_deref(), Some("/login"));
    }

    #[test]
    fn test_error_response_keeps_backend_code() {
        let err = anyhow::Error::new(tradedesk_core::Error::Status {
            status: tradedesk_core::StatusCode::CONFLICT,
            message: Some("Bot is running".to_string()),
            error_code: Some("BOT_BUSY".to_string()),
            body: String::new(),
        });

        let response = error_response(&err);
        assert_eq!(response.success, Some(false));
        assert_eq!(response.error_code.as_deref(), Some("BOT_BUSY"));
        assert_eq!(response.message.as_deref(), Some("Request failed: 409 Conflict Bot is running"));
    }
}

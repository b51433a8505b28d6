use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use webchat_client::{Client, ClientConfig, ClientError, Credentials, ErrorCode, Role, StaticAuthenticator};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing credentials; set WEBCHAT_IDENTITY, WEBCHAT_REGISTRATION_TOKEN and WEBCHAT_ACCESS_TOKEN")]
    MissingCredentials,
    #[error("unknown role '{0}'; expected admin or user")]
    UnknownRole(String),
    #[error("cannot read {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("[{}] {}", .0.error_code(), .0)]
    Client(#[from] ClientError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "webchat", about = "Command line access to the web chat client")]
struct Cli {
    #[arg(long, env = "WEBCHAT_IDENTITY")]
    identity: Option<String>,

    #[arg(long, env = "WEBCHAT_REGISTRATION_TOKEN", hide_env_values = true)]
    registration_token: Option<String>,

    #[arg(long, env = "WEBCHAT_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a conversation.
    Conversation { id: String },
    /// Fetch a user profile.
    User { username: String },
    /// Set a group conversation topic.
    Topic { id: String, topic: String },
    /// Remove a member from a group conversation.
    Kick { id: String, username: String },
    /// Grant or revoke admin rights.
    Role { id: String, username: String, role: String },
    /// Get the join link of a group conversation.
    JoinUrl { id: String },
    /// Upload a JPEG as the profile picture.
    Avatar { path: PathBuf },
    /// Resolve a guest join space to its thread id. Needs no credentials.
    Guest { space: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    match run_cli(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_cli(cli: Cli) -> Result<(), CliError> {
    let credentials = resolve_credentials(&cli)?;
    let authenticator = Arc::new(StaticAuthenticator::new(credentials));
    let client = Client::new(ClientConfig::from_env(), authenticator)?;

    let result = run(&client, cli.command).await;
    client.shutdown().await;
    result
}

/// Token flags as credentials. Only `guest` may run without them.
fn resolve_credentials(cli: &Cli) -> Result<Credentials, CliError> {
    let credentials = Credentials::new(
        cli.identity.clone().unwrap_or_default(),
        cli.registration_token.clone().unwrap_or_default(),
        cli.access_token.clone().unwrap_or_default(),
    );
    let missing = [&credentials.identity, &credentials.registration_token, &credentials.access_token]
        .iter()
        .any(|value| value.is_empty());
    if missing && !matches!(cli.command, Command::Guest { .. }) {
        return Err(CliError::MissingCredentials);
    }
    Ok(credentials)
}

async fn run(client: &Client, command: Command) -> Result<(), CliError> {
    match command {
        Command::Conversation { id } => print_json(&*client.conversation(&id).await?),
        Command::User { username } => print_json(&*client.user(&username).await?),
        Command::Topic { id, topic } => {
            client.set_topic(&id, &topic).await?;
            print_json(&serde_json::json!({ "conversation": id, "topic": topic }))
        }
        Command::Kick { id, username } => {
            client.kick(&id, &username).await?;
            print_json(&serde_json::json!({ "conversation": id, "kicked": username }))
        }
        Command::Role { id, username, role } => {
            let parsed = Role::parse(&role).ok_or(CliError::UnknownRole(role))?;
            client.set_role(&id, &username, parsed).await?;
            print_json(&serde_json::json!({ "conversation": id, "user": username, "role": parsed }))
        }
        Command::JoinUrl { id } => print_json(&serde_json::json!({ "join_url": client.join_url(&id).await? })),
        Command::Avatar { path } => {
            let image = std::fs::read(&path).map_err(|source| CliError::ReadFile { path, source })?;
            print_json(&client.set_profile_picture(image).await?)
        }
        Command::Guest { space } => {
            print_json(&serde_json::json!({ "thread_id": client.guest_thread_id(&space).await? }))
        }
    }
}

fn print_json(value: &impl Serialize) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;

use std::time::Duration;

use booking_runtime::config::{BotChannel, ConfigError};
use booking_runtime::conversation::{ConversationError, Origin};
use booking_runtime::prefs::{PreferenceError, Theme};
use booking_runtime::realtime::ConnectionState;
use booking_runtime::session::{AuthError, Credentials, SessionStatus};
use booking_runtime::storage::keys;
use booking_runtime::{Runtime, RuntimeConfig, RuntimeError};
use clap::{Args, Parser, Subcommand};

const CONNECT_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error(transparent)]
    Preference(#[from] PreferenceError),
    #[error("not signed in; run `booking login` first")]
    NotSignedIn,
    #[error("realtime connection did not open within {0:?}")]
    ConnectTimeout(Duration),
    #[error("no reply from the assistant")]
    NoReply,
    #[error("unknown preference `{0}`")]
    UnknownPreference(String),
    #[error("{0}")]
    InvalidValue(String),
}

#[derive(Parser, Debug)]
#[command(name = "booking", about = "Headless booking client runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore the persisted session and print the signed-in user.
    Whoami,
    Login {
        #[arg(long, env = "BOOKING_EMAIL")]
        email: String,
        #[arg(long, env = "BOOKING_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Logout,
    /// Send one message to the assistant and print the reply.
    Chat { message: String },
    Prefs(PrefsCommand),
}

#[derive(Args, Debug)]
struct PrefsCommand {
    #[command(subcommand)]
    command: PrefsSubcommand,
}

#[derive(Subcommand, Debug)]
enum PrefsSubcommand {
    List,
    Get { key: String },
    Set { key: String, value: String },
    Remove { key: String },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let runtime = Runtime::from_config(RuntimeConfig::from_env()?)?;

    let result = match cli.command {
        Command::Whoami => run_whoami(&runtime).await,
        Command::Login { email, password } => run_login(&runtime, Credentials { email, password }).await,
        Command::Logout => run_logout(&runtime).await,
        Command::Chat { message } => run_chat(&runtime, &message).await,
        Command::Prefs(prefs) => run_prefs(&runtime, prefs.command),
    };
    runtime.shutdown();
    result
}

async fn run_whoami(runtime: &Runtime) -> Result<(), CliError> {
    match runtime.boot().await {
        SessionStatus::Authenticated => {
            if let Some(user) = runtime.session().snapshot().user {
                println!("{} <{}> ({:?})", user.name, user.email.as_deref().unwrap_or("-"), user.role);
            }
            Ok(())
        }
        SessionStatus::Error => {
            println!("session kept but the auth service is unreachable");
            Ok(())
        }
        SessionStatus::Unauthenticated | SessionStatus::Restoring => Err(CliError::NotSignedIn),
    }
}

async fn run_login(runtime: &Runtime, credentials: Credentials) -> Result<(), CliError> {
    let snapshot = runtime.login(&credentials).await?;
    if let Some(user) = snapshot.user {
        println!("signed in as {}", user.name);
    }
    Ok(())
}

async fn run_logout(runtime: &Runtime) -> Result<(), CliError> {
    runtime.session().restore().await;
    runtime.logout().await;
    println!("signed out");
    Ok(())
}

async fn run_chat(runtime: &Runtime, message: &str) -> Result<(), CliError> {
    if runtime.boot().await != SessionStatus::Authenticated {
        return Err(CliError::NotSignedIn);
    }
    if runtime.config().bot_channel == BotChannel::Realtime {
        let mut rx = runtime.connection().watch();
        tokio::time::timeout(CONNECT_WAIT, rx.wait_for(|s| s.state == ConnectionState::Open))
            .await
            .map_err(|_| CliError::ConnectTimeout(CONNECT_WAIT))?
            .map_err(|_| CliError::ConnectTimeout(CONNECT_WAIT))?;
    }

    let conversation = runtime.conversation();
    conversation.open();
    conversation.send_user_message(message)?;

    let mut rx = conversation.watch();
    let snapshot = rx.wait_for(|s| !s.pending).await.map_err(|_| CliError::NoReply)?.clone();
    match snapshot.messages.last() {
        Some(reply) if reply.origin == Origin::Bot => {
            println!("{}", reply.text);
            Ok(())
        }
        _ => {
            for toast in runtime.notifier().toasts() {
                eprintln!("{}", toast.message);
            }
            Err(CliError::NoReply)
        }
    }
}

fn run_prefs(runtime: &Runtime, command: PrefsSubcommand) -> Result<(), CliError> {
    let prefs = runtime.prefs();
    match command {
        PrefsSubcommand::List => {
            println!("theme = {}", prefs.theme());
            println!("language = {}", prefs.language());
            println!("sidebar_collapsed = {}", prefs.sidebar_collapsed());
            println!("sidebar_visible = {}", prefs.sidebar_visible());
            let consent = prefs.cookie_consent().map_or_else(|| "unset".to_owned(), |c| c.to_string());
            println!("cookie_consent = {consent}");
            println!("pwa_prompt_dismissed = {}", prefs.pwa_prompt_dismissed());
        }
        PrefsSubcommand::Get { key } => {
            let key = preference_key(&key)?;
            println!("{}", prefs.get(key, ""));
        }
        PrefsSubcommand::Set { key, value } => match preference_key(&key)? {
            keys::THEME => {
                let theme: Theme = value.parse().map_err(CliError::InvalidValue)?;
                prefs.set_theme(theme).map_err(PreferenceError::from)?;
            }
            keys::LANGUAGE => prefs.set_language(&value)?,
            key => prefs.set(key, &value).map_err(PreferenceError::from)?,
        },
        PrefsSubcommand::Remove { key } => {
            prefs.remove(preference_key(&key)?).map_err(PreferenceError::from)?;
        }
    }
    Ok(())
}

fn preference_key(name: &str) -> Result<&'static str, CliError> {
    keys::PREFERENCES
        .iter()
        .copied()
        .find(|k| *k == name)
        .ok_or_else(|| CliError::UnknownPreference(name.to_owned()))
}

//! # commentary
//!
//! Command-line view over a comment thread: `watch` prints the history and
//! follows new comments, `post` submits one comment.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commentary_channel::{ChannelError, CommentClient, ConnectionOptions, SessionState};
use commentary_core::Comment;
use commentary_core::logging::init_subscriber;
use commentary_settings::{CommentarySettings, load_settings_from_path, settings_path};
use tracing::{debug, info};

/// Realtime comment threads.
#[derive(Parser, Debug)]
#[command(name = "commentary", about = "Follow and post realtime comment threads")]
struct Cli {
    /// Socket endpoint, e.g. `ws://127.0.0.1:4000/socket`.
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Auth token passed when connecting.
    #[arg(long, env = "COMMENTARY_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Log level (`RUST_LOG` still wins).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Settings file (defaults to `~/.commentary/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Print a topic's comments and follow new ones until interrupted.
    Watch {
        /// Topic id, e.g. `42`.
        topic: String,
    },
    /// Submit a comment to a topic.
    Post {
        /// Topic id, e.g. `42`.
        topic: String,
        /// Comment text.
        content: String,
    },
}

impl Cli {
    /// Flags override whatever the settings file and environment produced.
    fn apply(&self, settings: &mut CommentarySettings) {
        if let Some(endpoint) = &self.endpoint {
            settings.connection.endpoint.clone_from(endpoint);
        }
        if let Some(token) = &self.token {
            settings.connection.token = Some(token.clone());
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn render(comment: &Comment) -> String {
    format!("{}: {}", comment.author_label(), comment.content)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);
    init_subscriber(&settings.logging.level, settings.logging.json);

    let options = ConnectionOptions::from(&settings.connection);
    info!(endpoint = %options.endpoint, "connecting");
    let client = CommentClient::connect(options).context("Invalid endpoint")?;

    let outcome = match &args.command {
        Command::Watch { topic } => watch(&client, topic).await,
        Command::Post { topic, content } => post(&client, topic, content).await,
    };
    client.connection().disconnect().await;
    outcome
}

async fn watch(client: &CommentClient, topic: &str) -> Result<()> {
    let thread = client
        .thread(topic)
        .with_context(|| format!("Topic {topic} is already open"))?;
    let _ = thread.on_new_comment(|comment| println!("{}", render(&comment)));
    let _ = thread.on_resync(|snapshot| {
        println!("-- reconnected, {} comments --", snapshot.len());
        for comment in &snapshot.comments {
            println!("{}", render(comment));
        }
    });

    let opened = thread
        .join()
        .await
        .with_context(|| format!("Failed to join topic {topic}"))?;
    for comment in &opened.snapshot().comments {
        println!("{}", render(comment));
    }
    let thread = opened.start();

    let mut state = thread.session().watch_state();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            debug!(topic, "interrupted");
        }
        ended = state.wait_for(|s| s.is_terminal()) => {
            let ended = ended.map_or(SessionState::Left, |s| *s);
            anyhow::bail!("topic {topic} ended: session {ended}");
        }
    }

    match thread.leave() {
        Ok(()) | Err(ChannelError::InvalidState { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn post(client: &CommentClient, topic: &str, content: &str) -> Result<()> {
    let thread = client
        .open_topic(topic)
        .await
        .with_context(|| format!("Failed to join topic {topic}"))?
        .start();
    let ack = thread
        .add_comment(content)
        .await
        .context("Comment was not accepted")?;
    println!("{}", serde_json::to_string(&ack)?);
    thread.leave()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_watch_with_global_flags() {
        let cli = Cli::try_parse_from([
            "commentary",
            "watch",
            "42",
            "--endpoint",
            "ws://example.test/socket",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Command::Watch {
                topic: "42".into()
            }
        );
        assert_eq!(cli.endpoint.as_deref(), Some("ws://example.test/socket"));
    }

    #[test]
    fn parses_post() {
        let cli = Cli::try_parse_from(["commentary", "post", "7", "hello there"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Post {
                topic: "7".into(),
                content: "hello there".into()
            }
        );
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::try_parse_from([
            "commentary",
            "--token",
            "abc",
            "--log-level",
            "debug",
            "watch",
            "1",
        ])
        .unwrap();
        let mut settings = CommentarySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.connection.token.as_deref(), Some("abc"));
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.connection.endpoint, "ws://127.0.0.1:4000/socket");
    }

    #[test]
    fn renders_anonymous_and_attributed_comments() {
        assert_eq!(render(&Comment::anonymous("hi")), "Anonymous: hi");
        assert_eq!(render(&Comment::by("yo", "a@b.com")), "a@b.com: yo");
    }
}

//! WorldChat CLI
//!
//! Lets the characters of a story world talk to each other (or to you) and
//! reads their lines aloud.

use clap::{ArgAction, Args, Parser, Subcommand};
use colored::Colorize;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;
use worldchat_core::{
    AgentId, CommandSink, Config, Conversation, ConversationCallback, ConversationEvent,
    ElevenLabsSynthesizer, HistoryWindow, InMemoryMessageLog, JsonlMessageLog, KokoroSpeaker,
    LocalSpeaker, MessageLog, Narrator, OpenAiResponder, Roster, TurnScheduler, default_config,
    speech::select_voice,
};

#[derive(Parser)]
#[command(
    name = "worldchat",
    version,
    about = "Story characters that talk among themselves, out loud",
    long_about = "Runs round-robin conversations between characters of a story world using an \
                  OpenAI-compatible API, and narrates them with ElevenLabs or a local voice."
)]
struct Cli {
    /// World configuration file (TOML). Uses a built-in sample world if omitted.
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Let the characters talk to each other until Ctrl-C
    Run {
        #[command(flatten)]
        cast: Cast,

        /// Stop after this many messages (turns a character skips do not count)
        #[arg(long, value_name = "N")]
        max_turns: Option<usize>,
    },
    /// Say something and let the selected characters answer in turn
    Say {
        /// What you say
        #[arg(value_name = "TEXT")]
        text: String,

        #[command(flatten)]
        cast: Cast,

        /// Your name, as the characters will see it
        #[arg(long, value_name = "NAME")]
        name: Option<String>,
    },
    /// Speak a line right away
    Speak {
        #[arg(value_name = "TEXT")]
        text: String,
    },
    /// List the installed local voices
    Voices,
}

#[derive(Args)]
struct Cast {
    /// Character id or name (specify once per character, in speaking order)
    #[arg(short = 'c', long = "character", action = ArgAction::Append, value_name = "CHARACTER", required = true)]
    characters: Vec<String>,

    /// Read agent messages aloud
    #[arg(long)]
    narrate: bool,

    /// Append messages to this JSON Lines transcript (and read history from it)
    #[arg(long, value_name = "FILE")]
    transcript: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worldchat=info,worldchat_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(ref path) => Config::load(path)?,
        None => default_config(),
    };

    match cli.command {
        Command::Run { cast, max_turns } => run_conversation(&config, cast, max_turns).await,
        Command::Say { text, cast, name } => say(&config, cast, &text, name).await,
        Command::Speak { text } => speak(&config, &text).await,
        Command::Voices => list_voices(&config).await,
    }
}

async fn run_conversation(
    config: &Config,
    cast: Cast,
    max_turns: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let roster = Arc::new(Roster::new(config.world.characters.clone()));
    let participants = resolve_cast(&roster, &cast.characters)?;
    let conversation = build_conversation(config, &roster, cast.transcript.as_ref())?;
    let narrator = if cast.narrate {
        Some(build_narrator(config)?)
    } else {
        None
    };

    print_header(config, &roster, &participants);

    let limit_reached = Arc::new(Notify::new());
    let appended = Arc::new(AtomicUsize::new(0));
    let callback = create_console_callback(
        narrator.clone(),
        max_turns,
        appended.clone(),
        limit_reached.clone(),
    );
    let scheduler = TurnScheduler::new(conversation)
        .with_pacing(config.scheduler.pacing())
        .with_callback(callback);

    scheduler.start(participants)?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("{}", "Stopping after the current turn...".yellow());
        }
        _ = limit_reached.notified() => {}
        _ = scheduler.wait() => {}
    }
    scheduler.stop();
    scheduler.wait().await;

    if let Some(narrator) = narrator {
        if narrator.is_playing() {
            println!("{}", "Finishing narration (Ctrl-C to skip)...".dimmed());
            tokio::select! {
                _ = tokio::signal::ctrl_c() => narrator.clear_queue(),
                _ = narrator.wait_idle() => {}
            }
        }
    }

    println!();
    println!("{}", "═".repeat(70).bright_blue());
    println!(
        "{}",
        format!(
            "  Conversation ended: {} messages in {} turns.",
            appended.load(Ordering::SeqCst),
            scheduler.cursor()
        )
            .bright_green()
            .bold()
    );
    println!("{}", "═".repeat(70).bright_blue());
    println!();

    Ok(())
}

async fn say(
    config: &Config,
    cast: Cast,
    text: &str,
    name: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let roster = Arc::new(Roster::new(config.world.characters.clone()));
    let selected = resolve_cast(&roster, &cast.characters)?;
    let conversation = build_conversation(config, &roster, cast.transcript.as_ref())?;
    let narrator = if cast.narrate {
        Some(build_narrator(config)?)
    } else {
        None
    };

    let replies = conversation.reply(text, name, &selected).await?;
    if replies.is_empty() {
        println!("{}", "Nobody answered.".dimmed());
    }
    for message in &replies {
        let speaker = message
            .agent_id()
            .and_then(|id| roster.display_name(id))
            .unwrap_or("?");
        println!("{}", speaker.bright_cyan().bold());
        print_wrapped(&message.content);
        if let Some(ref narrator) = narrator {
            narrator.enqueue(message.id.to_string(), message.content.clone());
        }
    }

    if let Some(narrator) = narrator {
        narrator.wait_idle().await;
    }
    Ok(())
}

async fn speak(config: &Config, text: &str) -> Result<(), Box<dyn std::error::Error>> {
    let narrator = build_narrator(config)?;
    let outcome = narrator.play_immediate(text).await;
    tracing::info!(?outcome, "done speaking");
    Ok(())
}

async fn list_voices(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let sink = Arc::new(CommandSink::new(&config.narration.player_command)?);
    let speaker = KokoroSpeaker::new(sink, config.narration.rate, None);
    let mut voices = speaker.voices().await?;
    voices.sort();

    let locale = config.narration_locale();
    let chosen = select_voice(&voices, locale, config.narration.local_voice.as_deref());
    println!("{} {}", "Locale:".bold(), locale);
    for voice in &voices {
        if chosen.as_deref() == Some(voice.as_str()) {
            println!("  - {} {}", voice.bright_green(), "(selected)".dimmed());
        } else {
            println!("  - {}", voice);
        }
    }
    Ok(())
}

/// Map command-line character keys to ids, rejecting unknown ones.
fn resolve_cast(roster: &Roster, keys: &[String]) -> Result<Vec<AgentId>, String> {
    keys.iter()
        .map(|key| {
            roster.resolve(key).map(|c| c.id.clone()).ok_or_else(|| {
                let known: Vec<&str> = roster.characters().iter().map(|c| c.id.as_str()).collect();
                format!("Unknown character '{}'. Available: {}", key, known.join(", "))
            })
        })
        .collect()
}

fn build_conversation(
    config: &Config,
    roster: &Arc<Roster>,
    transcript: Option<&PathBuf>,
) -> Result<Conversation, Box<dyn std::error::Error>> {
    // Get API configuration from environment
    let mut agent_config = config.clone();
    if let Ok(base) = env::var("OPENAI_API_BASE").or_else(|_| env::var("OPENAI_BASE_URL")) {
        agent_config.agent.api_base = base;
    }
    let api_key = env::var("OPENAI_API_KEY").unwrap_or_else(|_| {
        eprintln!(
            "{}",
            "Warning: OPENAI_API_KEY not set. API calls may fail.".yellow()
        );
        String::new()
    });

    let log: Arc<dyn MessageLog> = match transcript {
        Some(path) => Arc::new(JsonlMessageLog::new(path)),
        None => Arc::new(InMemoryMessageLog::new()),
    };
    let responder = Arc::new(OpenAiResponder::new(&api_key, &agent_config)?);

    Ok(Conversation::new(log, responder, Arc::clone(roster))
        .with_window(HistoryWindow::new(config.scheduler.history_window)))
}

fn build_narrator(config: &Config) -> Result<Narrator, Box<dyn std::error::Error>> {
    let sink = Arc::new(CommandSink::new(&config.narration.player_command)?);
    let remote = ElevenLabsSynthesizer::new(
        config.narration.remote.clone(),
        env::var("ELEVENLABS_API_KEY").ok(),
    );
    let local = KokoroSpeaker::new(
        sink.clone(),
        config.narration.rate,
        config.narration.local_voice.clone(),
    );
    Ok(Narrator::new(
        Arc::new(remote),
        Arc::new(local),
        sink,
        config.narration_locale(),
    ))
}

fn print_header(config: &Config, roster: &Roster, participants: &[AgentId]) {
    println!();
    println!("{}", "═".repeat(70).bright_blue());
    println!(
        "{}",
        format!("  {} - {}", "WorldChat".bold(), config.world.name)
            .bright_blue()
            .bold()
    );
    println!("{}", "═".repeat(70).bright_blue());
    println!();
    print_wrapped(&config.world.storyline);
    println!();
    println!("{}", "Characters:".bold());
    for (i, id) in participants.iter().enumerate() {
        let name = roster.display_name(id).unwrap_or(id.as_str());
        println!("  {}. {} ({})", i + 1, name.bright_cyan(), id.as_str().dimmed());
    }
    println!();
    println!("{}", "─".repeat(70).dimmed());
}

/// Create a callback that prints conversation events and feeds the narrator.
fn create_console_callback(
    narrator: Option<Narrator>,
    max_turns: Option<usize>,
    appended: Arc<AtomicUsize>,
    limit_reached: Arc<Notify>,
) -> ConversationCallback {
    Arc::new(move |event: ConversationEvent| match event {
        ConversationEvent::TurnStarted { name, .. } => {
            println!("{} {}", "▶".bright_cyan(), name.bright_cyan().bold());
        }
        ConversationEvent::MessageAppended { message } => {
            print_wrapped(&message.content);
            println!();
            if let Some(ref narrator) = narrator {
                narrator.enqueue(message.id.to_string(), message.content.clone());
            }
            let count = appended.fetch_add(1, Ordering::SeqCst) + 1;
            if max_turns.is_some_and(|max| count >= max) {
                limit_reached.notify_one();
            }
        }
        ConversationEvent::TurnFailed { agent, reason } => {
            println!(
                "  {}",
                format!("({} stays silent: {})", agent, reason).dimmed()
            );
            println!();
        }
        ConversationEvent::RunStarted { .. } | ConversationEvent::RunEnded => {}
    })
}

fn print_wrapped(text: &str) {
    for line in textwrap(text, 66).lines() {
        println!("  {}", line);
    }
}

/// Simple text wrapping function.
fn textwrap(text: &str, width: usize) -> String {
    let mut result = String::new();
    let mut current_line_len = 0;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        if current_line_len + word_len + 1 > width && current_line_len > 0 {
            result.push('\n');
            current_line_len = 0;
        }
        if current_line_len > 0 {
            result.push(' ');
            current_line_len += 1;
        }
        result.push_str(word);
        current_line_len += word_len;
    }

    result
}

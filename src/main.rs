use clap::{CommandFactory, Parser};
use colored::*;
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use huddle::cli::{parse_input, Args, InputLine};
use huddle::model::{is_known_role, Role, ROLE_KEYS};
use huddle::{
    ClientConfig, ConnectionState, DeliveryState, HttpGenerationSource, HuddleError, Identity, Message, NoticeLevel,
    Session, SessionClient, SessionEvent, SessionKind, WsConnector,
};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("huddle=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_config(args: &Args) -> Result<ClientConfig, huddle::ConfigError> {
    let config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    }
    .with_env_overrides();
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), HuddleError> {
    let args = Args::parse();

    if let Some(shell) = args.completions {
        let mut cmd = Args::command();
        clap_complete::generate(shell, &mut cmd, "huddle", &mut io::stdout());
        return Ok(());
    }

    init_tracing();
    let config = load_config(&args)?;

    let session_id = args.session.clone().unwrap_or_default();
    let kind = SessionKind::from(args.kind);
    let title = args.title.clone().unwrap_or_else(|| format!("session {session_id}"));
    let mut session = Session::new(session_id, kind, title);
    if is_known_role(&args.role) {
        session.role_key = args.role.clone();
    } else {
        eprintln!("{} unknown role '{}', using {}", "warning:".yellow(), args.role, session.role_key);
    }
    let identity = Identity::new(args.nickname.clone(), args.avatar_color());

    println!(
        "{} {} ({}) as {}",
        "huddle".bold().cyan(),
        session.display_name.bold(),
        kind,
        identity.nickname.bold()
    );
    println!("{}", "Type a message, /role <key>, /who, /help or /quit.".dimmed());

    let connector = WsConnector::new(std::time::Duration::from_secs(config.generation.connect_timeout_secs));
    let generator = HttpGenerationSource::new(&config)?;
    let (client, mut events) = SessionClient::create(&config, session, identity, connector, generator);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut roster: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                match parse_input(&line) {
                    InputLine::Message(text) => {
                        if let Err(e) = client.submit(text).await {
                            println!("{} {}", "!".red().bold(), e.to_string().red());
                        }
                    }
                    InputLine::Role(key) => client.set_role(key),
                    InputLine::Who => {
                        if roster.is_empty() {
                            println!("{}", "(nobody online)".dimmed());
                        } else {
                            println!("{} {}", "online:".dimmed(), roster.join(", "));
                        }
                    }
                    InputLine::Help => {
                        println!("{}", format!("roles: {}", ROLE_KEYS.join(", ")).dimmed());
                    }
                    InputLine::Quit => break,
                    InputLine::Empty => {}
                    InputLine::Unknown(cmd) => {
                        println!("{} unknown command /{cmd}", "?".yellow());
                    }
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if let SessionEvent::PresenceChanged(participants) = &event {
                    roster = participants.iter().map(|p| p.nickname.clone()).collect();
                }
                let fatal = matches!(event, SessionEvent::FatalDisconnect { .. });
                render(&event);
                if fatal {
                    break;
                }
            }
        }
    }

    client.teardown().await;
    Ok(())
}

fn render(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => {
            let label = state.to_string();
            let label = match state {
                ConnectionState::Open => label.green(),
                ConnectionState::Failed => label.red(),
                ConnectionState::Reconnecting => label.yellow(),
                _ => label.dimmed(),
            };
            println!("{} {}", "~".dimmed(), label);
        }
        SessionEvent::PresenceChanged(participants) => {
            println!("{} {} online", "~".dimmed(), participants.len());
        }
        SessionEvent::TypingChanged(peers) => {
            if !peers.is_empty() {
                let names: Vec<&str> = peers.iter().map(|p| p.nickname.as_str()).collect();
                println!("{}", format!("{} typing...", names.join(", ")).dimmed().italic());
            }
        }
        SessionEvent::TranscriptAppend(msg) => render_message(msg, false),
        SessionEvent::TranscriptUpdate(msg) => render_message(msg, true),
        SessionEvent::Notice { level, text } => {
            let tag = match level {
                NoticeLevel::Info => "info".blue(),
                NoticeLevel::Warning => "warn".yellow(),
                NoticeLevel::Error => "error".red(),
            };
            println!("[{tag}] {text}");
        }
        SessionEvent::FatalDisconnect { reason } => {
            println!("{} {}", "disconnected:".red().bold(), reason);
        }
    }
    let _ = io::stdout().flush();
}

/// Terminal output cannot rewrite a bubble in place: user messages print when
/// appended, agent answers once they settle.
fn render_message(msg: &Message, is_update: bool) {
    match (msg.role, msg.delivery_state) {
        (Role::User, DeliveryState::Failed) if is_update => {
            println!("{}", "  (not delivered)".red());
        }
        (Role::User, _) if is_update => {}
        (Role::User, _) => {
            let name = msg.sender_nickname.as_deref().unwrap_or("someone");
            println!("{} {}", format!("{name}:").bold(), msg.content);
        }
        (Role::Agent, state) if !state.is_terminal() => {}
        (Role::Agent, DeliveryState::Failed) => {
            let marker = msg.error.as_deref().unwrap_or("failed");
            println!("{} {} {}", "assistant:".magenta().bold(), msg.content, format!("[{marker}]").red());
        }
        (Role::Agent, _) => {
            println!("{} {}", "assistant:".magenta().bold(), msg.content);
            for citation in &msg.citations {
                println!("  {} {}", "source:".dimmed(), citation.source.dimmed());
            }
        }
        (Role::System, _) => println!("{}", format!("-- {} --", msg.content).dimmed()),
    }
}

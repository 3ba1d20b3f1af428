use clap::{Parser, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::model::{random_avatar_color, SessionKind, DEFAULT_ROLE_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Private,
    Collaborative,
}

impl From<KindArg> for SessionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Private => SessionKind::Private,
            KindArg::Collaborative => SessionKind::Collaborative,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(version)]
#[command(about = "Join a chat-assistant session from the terminal, alone or with collaborators")]
pub struct Args {
    /// Session id to join
    #[arg(required_unless_present = "completions")]
    pub session: Option<String>,

    /// Session kind
    #[arg(long, value_enum, default_value = "collaborative")]
    pub kind: KindArg,

    /// Nickname shown to other participants
    #[arg(long, short, default_value = "guest")]
    pub nickname: String,

    /// Avatar color (hex); random from the palette when omitted
    #[arg(long)]
    pub color: Option<String>,

    /// Assistant role key
    #[arg(long, default_value = DEFAULT_ROLE_KEY)]
    pub role: String,

    /// Display name for the session header
    #[arg(long)]
    pub title: Option<String>,

    /// Path to a TOML config file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Print shell completions and exit
    #[arg(long, value_enum)]
    pub completions: Option<Shell>,
}

impl Args {
    pub fn avatar_color(&self) -> String {
        self.color.clone().unwrap_or_else(random_avatar_color)
    }
}

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputLine {
    Message(String),
    Role(String),
    Who,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

pub fn parse_input(line: &str) -> InputLine {
    let line = line.trim();
    if line.is_empty() {
        return InputLine::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return InputLine::Message(line.to_string());
    };
    let mut parts = command.splitn(2, char::is_whitespace);
    match (parts.next().unwrap_or(""), parts.next().map(str::trim)) {
        ("quit" | "exit" | "leave", _) => InputLine::Quit,
        ("role", Some(key)) if !key.is_empty() => InputLine::Role(key.to_string()),
        ("who", _) => InputLine::Who,
        ("help", _) => InputLine::Help,
        (other, _) => InputLine::Unknown(other.to_string()),
    }
}

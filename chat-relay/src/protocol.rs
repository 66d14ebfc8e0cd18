//! Line-oriented wire vocabulary.
//!
//! Clients send plain text lines; a few start with a slash and are commands.
//! Everything the relay sends back is built by the helpers at the bottom of
//! this module so the exact prefixes live in one place.

use std::fmt::Display;

use thiserror::Error;

/// A framed line from an active session, classified.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    /// Blank line, ignored.
    Empty,
    Leave,
    Who,
    Msg { target: &'a str, text: &'a str },
    /// Anything else is room chat.
    Chat(&'a str),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("usage: /msg <user> <text>")]
    MsgUsage,
}

impl<'a> Command<'a> {
    pub fn parse(line: &'a str) -> Result<Self, CommandError> {
        match line {
            "" => Ok(Command::Empty),
            "/leave" => Ok(Command::Leave),
            "/who" => Ok(Command::Who),
            _ => match msg_arguments(line) {
                Some(arguments) => parse_msg(arguments),
                None => Ok(Command::Chat(line)),
            },
        }
    }
}

/// Returns what follows `/msg` if the line is a `/msg` command at all.
fn msg_arguments(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("/msg")?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest)
    } else {
        None
    }
}

fn parse_msg(arguments: &str) -> Result<Command<'_>, CommandError> {
    let arguments = arguments.trim_start();
    // Only the single separating character is consumed; the text keeps any
    // further leading whitespace.
    let (target, text) = arguments
        .split_once(char::is_whitespace)
        .unwrap_or((arguments, ""));

    if target.is_empty() || text.is_empty() {
        return Err(CommandError::MsgUsage);
    }
    Ok(Command::Msg { target, text })
}

pub fn welcome(name: &str) -> String {
    format!("Welcome {name}!")
}

pub fn error(reason: impl Display) -> String {
    format!("ERR {reason}")
}

pub fn roster<S: AsRef<str>>(names: &[S]) -> String {
    let names: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
    format!("USERS {}", names.join(","))
}

pub fn chat(name: &str, text: &str) -> String {
    format!("{name}: {text}")
}

pub fn joined(name: &str) -> String {
    format!("{name} has joined!")
}

pub fn left(name: &str) -> String {
    format!("{name} has left!")
}

pub fn direct_message(from: &str, text: &str) -> String {
    format!("(DM) {from}: {text}")
}

pub fn direct_echo(to: &str, text: &str) -> String {
    format!("(DM to {to}) {text}")
}

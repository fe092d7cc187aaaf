// ABOUTME: Command parsing and the verb -> handler registry for chat commands
// ABOUTME: Platform-agnostic: `!verb arg arg` in, a handler that produces reply text out

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::traits::ChatUser;

/// A parsed command plus who sent it and where the reply goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Lowercase verb including the marker (e.g. "!claim")
    pub verb: String,
    /// Whitespace-split arguments; no quoting
    pub args: Vec<String>,
    /// Argument text as typed, after the verb
    pub raw_args: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub sender_phone: Option<String>,
    pub chat_id: String,
}

impl Command {
    pub fn new(verb: impl Into<String>, args: Vec<String>, raw_args: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            args,
            raw_args: raw_args.into(),
            sender_id: String::new(),
            sender_name: None,
            sender_phone: None,
            chat_id: String::new(),
        }
    }

    /// Attach sender context from an inbound message
    pub fn from_sender(mut self, sender: &ChatUser, chat_id: impl Into<String>) -> Self {
        self.sender_id = sender.id.clone();
        self.sender_name = sender.display_name.clone();
        self.sender_phone = sender.phone.clone();
        self.chat_id = chat_id.into();
        self
    }

    /// Verb without the marker, used for registry lookup
    pub fn name(&self) -> &str {
        let mut chars = self.verb.chars();
        chars.next();
        chars.as_str()
    }

    pub fn first_arg(&self) -> Option<&str> {
        self.args.first().map(|s| s.as_str())
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(|s| s.as_str())
    }

    /// Argument text following the first `n` arguments, spacing preserved
    pub fn rest_after(&self, n: usize) -> Option<&str> {
        let mut rest = self.raw_args.as_str();
        for _ in 0..n {
            rest = rest.trim_start();
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            rest = &rest[end..];
        }
        let rest = rest.trim();
        (!rest.is_empty()).then_some(rest)
    }
}

/// Result of parsing a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    Command(Command),
    /// Regular conversation; never answered
    Message(String),
    /// Empty message
    Ignore,
}

/// Parse chat text with the given command marker.
///
/// - anything starting with the marker is a command; the verb is the first
///   whitespace token, whatever it contains (`!123` and `!!x` are verbs too)
/// - empty text is ignored
pub fn parse_message(body: &str, marker: char) -> ParseResult {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return ParseResult::Ignore;
    }

    let Some(after_marker) = trimmed.strip_prefix(marker) else {
        return ParseResult::Message(trimmed.to_string());
    };

    let (name, raw_args) = match after_marker.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (after_marker, ""),
    };
    let args = raw_args.split_whitespace().map(str::to_string).collect();
    let verb = format!("{}{}", marker, name.to_lowercase());

    ParseResult::Command(Command::new(verb, args, raw_args))
}

/// Produces the reply text for a command.
///
/// `Ok` carries user-facing text, including business-rule refusals.
/// `Err` is reserved for infrastructure failures; the router answers
/// those with a generic message and logs the detail.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> Result<String>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Command) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    async fn handle(&self, command: Command) -> Result<String> {
        (self)(command).await
    }
}

/// Bind a method-style handler to a shared service
pub fn route<S, F, Fut>(service: &Arc<S>, f: F) -> impl CommandHandler + 'static
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    let service = Arc::clone(service);
    move |command: Command| f(Arc::clone(&service), command)
}

/// Verb -> handler table. Names are stored without the marker.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    aliases: HashMap<String, String>,
    /// Registration order, for help output
    usage: Vec<(String, String)>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, name: &str, usage: &str, handler: H)
    where
        H: CommandHandler + 'static,
    {
        let name = name.to_lowercase();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(command = %name, "Command handler replaced");
            self.usage.retain(|(n, _)| n != &name);
        }
        self.usage.push((name, usage.to_string()));
    }

    /// Make `alias` resolve to an already registered name
    pub fn alias(&mut self, alias: &str, target: &str) {
        self.aliases
            .insert(alias.to_lowercase(), target.to_lowercase());
    }

    /// Resolve aliases to the canonical name
    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(|s| s.as_str()).unwrap_or(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(self.canonical(name)).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(self.canonical(name))
    }

    /// Usage lines in registration order
    pub fn usage_lines(&self) -> impl Iterator<Item = &str> {
        self.usage.iter().map(|(_, usage)| usage.as_str())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

//! Plain-text command lines.
//!
//! Peers take `"<prefix>.<command> <csv-args>"`; the supervisor's own endpoint
//! takes `"<command> <space-separated args>"`. One command per request.

use std::fmt;

/// Reserved reply meaning the peer carried out the command.
pub const REPLY_SUCCESS: &str = "success";
/// Reserved reply meaning the peer refused or failed the command.
pub const REPLY_FAIL: &str = "fail";

/// A command routed to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCommand {
    pub prefix: String,
    pub name: String,
    pub args: Vec<String>,
}

impl PeerCommand {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Build the wire string. The space and argument list are omitted when there are no args.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn parse(line: &str) -> Result<Self, CommandParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandParseError::Empty);
        }
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((h, r)) => (h, r.trim()),
            None => (line, ""),
        };
        let (prefix, name) = head
            .split_once('.')
            .ok_or_else(|| CommandParseError::MissingPrefix(head.to_string()))?;
        if prefix.is_empty() || name.is_empty() {
            return Err(CommandParseError::MissingPrefix(head.to_string()));
        }
        let args = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(',').map(|a| a.trim().to_string()).collect()
        };
        Ok(Self {
            prefix: prefix.to_string(),
            name: name.to_string(),
            args,
        })
    }
}

impl fmt::Display for PeerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.prefix, self.name)?;
        if !self.args.is_empty() {
            write!(f, " {}", self.args.join(","))?;
        }
        Ok(())
    }
}

/// A command received on the supervisor's own endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorRequest {
    pub command: String,
    pub args: Vec<String>,
}

impl SupervisorRequest {
    pub fn parse(line: &str) -> Result<Self, CommandParseError> {
        let mut parts = line.split_whitespace();
        let command = parts.next().ok_or(CommandParseError::Empty)?.to_string();
        Ok(Self {
            command,
            args: parts.map(str::to_string).collect(),
        })
    }

    pub fn encode(&self) -> String {
        let mut out = self.command.clone();
        for a in &self.args {
            out.push(' ');
            out.push_str(a);
        }
        out
    }
}

/// A text reply after the reserved literals have been mapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Bool(bool),
    Text(String),
}

impl Reply {
    /// `"success"` / `"fail"` become booleans; anything else passes through unchanged.
    pub fn from_text(text: String) -> Self {
        match text.as_str() {
            REPLY_SUCCESS => Reply::Bool(true),
            REPLY_FAIL => Reply::Bool(false),
            _ => Reply::Text(text),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Bool(true) => f.write_str(REPLY_SUCCESS),
            Reply::Bool(false) => f.write_str(REPLY_FAIL),
            Reply::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("command {0:?} has no <prefix>.<name> head")]
    MissingPrefix(String),
}

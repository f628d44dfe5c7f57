//! Command line tokenizing and verb routing rules shared by both peers.

use std::fmt;

use crate::protocol::{LINE_MAX, USAGE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Quit,
    Put,
    Get,
    List,
    Sys,
    Run,
    Unknown(String),
}

impl Verb {
    fn parse(token: &str) -> Self {
        match token {
            "quit" | "-q" => Verb::Quit,
            "put" => Verb::Put,
            "get" => Verb::Get,
            "list" => Verb::List,
            "sys" => Verb::Sys,
            "run" => Verb::Run,
            other => Verb::Unknown(other.to_string()),
        }
    }

    /// Verbs whose exchange spans several messages and therefore run on the
    /// connection task itself instead of a spawned command task.
    pub fn is_sequential_on_server(&self) -> bool {
        matches!(self, Verb::Put)
    }

    /// Verbs the interactive client runs without spawning.
    pub fn is_sequential_on_client(&self) -> bool {
        matches!(self, Verb::Quit | Verb::Put | Verb::Get)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::Quit => f.write_str("quit"),
            Verb::Put => f.write_str("put"),
            Verb::Get => f.write_str("get"),
            Verb::List => f.write_str("list"),
            Verb::Sys => f.write_str("sys"),
            Verb::Run => f.write_str("run"),
            Verb::Unknown(s) => f.write_str(s),
        }
    }
}

/// One tokenized request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    pub args: Vec<String>,
    /// The untokenized line (trailing newline removed), forwarded as-is.
    pub line: String,
}

impl Command {
    /// Tokenize a line on whitespace. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let mut tokens = line.split_whitespace();
        let verb = Verb::parse(tokens.next()?);
        Some(Self {
            verb,
            args: tokens.map(str::to_string).collect(),
            line: line.to_string(),
        })
    }

    /// Number of tokens including the verb.
    pub fn token_count(&self) -> usize {
        self.args.len() + 1
    }

    /// Check argument counts. On failure returns the text to show the operator
    /// (client) or to send back as the reply (server).
    pub fn validate(&self) -> Result<(), String> {
        if self.line.len() > LINE_MAX {
            return Err(format!("Command longer than {} bytes\n", LINE_MAX));
        }
        match &self.verb {
            Verb::Quit | Verb::Sys => Ok(()),
            Verb::Put if self.args.is_empty() => {
                Err("put usage: \"put progname sourcefile[s] [-f]\"\n".to_string())
            }
            Verb::Put => Ok(()),
            Verb::Get if self.token_count() != 3 => Err("get takes 3 arguments\n".to_string()),
            Verb::Get => Ok(()),
            Verb::List if self.token_count() > 3 => {
                Err("list usage: \"list [-l] directory\"\n".to_string())
            }
            Verb::List => Ok(()),
            Verb::Run if self.args.is_empty() => {
                Err("run usage: \"run progname [args] [-f localfile]\"\n".to_string())
            }
            Verb::Run => Ok(()),
            Verb::Unknown(_) => Err(USAGE.to_string()),
        }
    }
}

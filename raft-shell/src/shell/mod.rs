//! Command registry and dispatcher for the interactive shell.
//!
//! The registry is a fixed, immutable map from command name to
//! [`ShellCommand`]. The dispatcher resolves the first token of a line against
//! it and hands the remaining tokens to the command, together with the
//! injected [`ConnectionManager`].

pub mod commands;

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;

use tracing::debug;

pub use commands::{
    Arity, CommandDescriptor, CommandStatus, Consistency, OperationRequest, Reply, ShellCommand,
};

use crate::connection::ConnectionManager;

/// Everything a command may reach while it runs.
pub struct ShellContext<'a> {
    pub manager: &'a dyn ConnectionManager,
    pub registry: &'a Registry,
}

/// Immutable name to command map, built once.
#[derive(Debug)]
pub struct Registry {
    commands: BTreeMap<&'static str, ShellCommand>,
}

impl Registry {
    pub fn builtin() -> Self {
        let commands = ShellCommand::ALL
            .into_iter()
            .map(|command| (command.name(), command))
            .collect();
        Self { commands }
    }

    /// Exact, case-sensitive lookup.
    pub fn resolve(&self, name: &str) -> Option<ShellCommand> {
        self.commands.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.commands.keys().copied()
    }

    pub fn unknown_command_message(&self, name: &str) -> String {
        let known: Vec<&str> = self.names().collect();
        format!(
            "unknown command '{name}'; known commands: {} (type 'help' for details)",
            known.join(", ")
        )
    }

    /// Help for `topic`, or for every command when `topic` is `None`.
    ///
    /// Returns `false` when `topic` names no command.
    pub fn print_help(&self, topic: Option<&str>, out: &mut dyn Write) -> io::Result<bool> {
        match topic {
            Some(name) => match self.resolve(name) {
                Some(command) => writeln!(out, "{}", command.help()).map(|()| true),
                None => writeln!(out, "{}", self.unknown_command_message(name)).map(|()| false),
            },
            None => {
                for command in self.commands.values() {
                    writeln!(out, "{}:", command.name())?;
                    writeln!(out, "{}", command.help())?;
                }
                Ok(true)
            }
        }
    }
}

/// Result of dispatching one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The line had no tokens.
    Empty,
    Ran {
        command: ShellCommand,
        status: CommandStatus,
    },
    /// No command has this name; the unknown-command message was printed.
    Unknown(String),
}

/// Routes operator input to commands.
pub struct Dispatcher {
    registry: Registry,
    manager: Arc<dyn ConnectionManager>,
}

impl Dispatcher {
    pub fn new(manager: Arc<dyn ConnectionManager>) -> Self {
        Self {
            registry: Registry::builtin(),
            manager,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Dispatches already tokenized input: `tokens[0]` is the command name.
    pub fn dispatch(&self, tokens: &[&str], out: &mut dyn Write) -> io::Result<Dispatch> {
        let Some((name, args)) = tokens.split_first() else {
            return Ok(Dispatch::Empty);
        };
        let Some(command) = self.registry.resolve(name) else {
            debug!(name, "unknown command");
            writeln!(out, "{}", self.registry.unknown_command_message(name))?;
            return Ok(Dispatch::Unknown(name.to_string()));
        };

        let ctx = ShellContext {
            manager: self.manager.as_ref(),
            registry: &self.registry,
        };
        let status = command.command(args, &ctx, out)?;
        Ok(Dispatch::Ran { command, status })
    }

    /// Splits `line` on whitespace and dispatches the tokens.
    pub fn dispatch_line(&self, line: &str, out: &mut dyn Write) -> io::Result<Dispatch> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        self.dispatch(&tokens, out)
    }
}

//! The operator commands: `delete`, `get`, `put`, `list` and `help`.

use std::io::{self, Write};

use tracing::{debug, warn};

use super::ShellContext;
use crate::connection::ScopedConnection;
use crate::error::CommandError;

/// Accepted number of arguments after the command name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    Range { min: usize, max: usize },
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == n,
            Arity::Range { min, max } => (min..=max).contains(&count),
        }
    }
}

/// What a command needs from the store before it may report success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// The write went through the Raft log and was applied on the leader.
    Linearizable,
    /// Served from the applied state of the node that answered as leader.
    LeaderRead,
    /// Never touches the cluster.
    Local,
}

#[derive(Debug)]
pub struct CommandDescriptor {
    pub name: &'static str,
    pub arity: Arity,
    pub consistency: Consistency,
    /// Whether the first argument is a key that must not be empty.
    pub takes_key: bool,
    pub help: &'static str,
    pub usage: &'static str,
}

const DELETE: CommandDescriptor = CommandDescriptor {
    name: "delete",
    arity: Arity::Exact(1),
    consistency: Consistency::Linearizable,
    takes_key: true,
    help: "  Delete the key value pair specified by the key, example:\n  raft> delete k1",
    usage: "  usage: delete <key>",
};

const GET: CommandDescriptor = CommandDescriptor {
    name: "get",
    arity: Arity::Exact(1),
    consistency: Consistency::LeaderRead,
    takes_key: true,
    help: "  Print the value stored under the key, or (nil) when absent, example:\n  raft> get k1",
    usage: "  usage: get <key>",
};

const PUT: CommandDescriptor = CommandDescriptor {
    name: "put",
    arity: Arity::Exact(2),
    consistency: Consistency::Linearizable,
    takes_key: true,
    help: "  Store the value under the key, replacing any previous value, example:\n  raft> put k1 v1",
    usage: "  usage: put <key> <value>",
};

const LIST: CommandDescriptor = CommandDescriptor {
    name: "list",
    arity: Arity::Exact(0),
    consistency: Consistency::LeaderRead,
    takes_key: false,
    help: "  List every key value pair in key order, example:\n  raft> list",
    usage: "  usage: list",
};

const HELP: CommandDescriptor = CommandDescriptor {
    name: "help",
    arity: Arity::Range { min: 0, max: 1 },
    consistency: Consistency::Local,
    takes_key: false,
    help: "  Describe every command, or only the named one, example:\n  raft> help delete",
    usage: "  usage: help [command]",
};

/// One store operation built from validated arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    Delete { key: String },
    Get { key: String },
    Put { key: String, value: String },
    List,
}

/// What a committed operation prints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Done,
    Value(Option<String>),
    Rows(Vec<(String, String)>),
}

impl Reply {
    fn print(&self, out: &mut dyn Write) -> io::Result<()> {
        match self {
            Reply::Done => writeln!(out, "done"),
            Reply::Value(Some(value)) => writeln!(out, "{value}"),
            Reply::Value(None) => writeln!(out, "(nil)"),
            Reply::Rows(rows) if rows.is_empty() => writeln!(out, "(empty)"),
            Reply::Rows(rows) => rows
                .iter()
                .try_for_each(|(key, value)| writeln!(out, "{key} = {value}")),
        }
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    /// The operation committed (or the local command ran) and its output was printed.
    Completed,
    /// Arguments did not match; usage was printed and no connection was opened.
    UsageShown,
    /// `help` was asked about a name no command has.
    UnknownTopic(String),
    /// `failed` was printed.
    Failed(CommandError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShellCommand {
    Delete,
    Get,
    Put,
    List,
    Help,
}

impl ShellCommand {
    pub const ALL: [ShellCommand; 5] = [
        ShellCommand::Delete,
        ShellCommand::Get,
        ShellCommand::Put,
        ShellCommand::List,
        ShellCommand::Help,
    ];

    pub fn descriptor(self) -> &'static CommandDescriptor {
        match self {
            ShellCommand::Delete => &DELETE,
            ShellCommand::Get => &GET,
            ShellCommand::Put => &PUT,
            ShellCommand::List => &LIST,
            ShellCommand::Help => &HELP,
        }
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    pub fn help(self) -> &'static str {
        self.descriptor().help
    }

    pub fn usage(self) -> &'static str {
        self.descriptor().usage
    }

    /// Validates `args`, runs the command and prints its result to `out`.
    ///
    /// A connection is only requested once the arguments are valid, and is
    /// closed before this returns.
    pub fn command(
        self,
        args: &[&str],
        ctx: &ShellContext<'_>,
        out: &mut dyn Write,
    ) -> io::Result<CommandStatus> {
        let Some(request) = self.validate(args) else {
            writeln!(out, "{}", self.usage())?;
            return Ok(CommandStatus::UsageShown);
        };

        let Some(request) = request else {
            let topic = args.first().copied();
            if ctx.registry.print_help(topic, out)? {
                return Ok(CommandStatus::Completed);
            }
            return Ok(CommandStatus::UnknownTopic(topic.unwrap_or_default().to_string()));
        };

        debug!(
            command = self.name(),
            consistency = ?self.descriptor().consistency,
            "running"
        );

        match execute(&request, ctx) {
            Ok(reply) => {
                reply.print(out)?;
                Ok(CommandStatus::Completed)
            }
            Err(err) => {
                warn!(command = self.name(), error = %err, "command failed");
                writeln!(out, "failed")?;
                Ok(CommandStatus::Failed(err))
            }
        }
    }

    /// `None` on a usage error, `Some(None)` for commands that stay local.
    fn validate(self, args: &[&str]) -> Option<Option<OperationRequest>> {
        let descriptor = self.descriptor();
        if !descriptor.arity.accepts(args.len()) {
            return None;
        }
        if descriptor.takes_key && args[0].is_empty() {
            return None;
        }

        let request = match self {
            ShellCommand::Delete => Some(OperationRequest::Delete {
                key: args[0].to_string(),
            }),
            ShellCommand::Get => Some(OperationRequest::Get {
                key: args[0].to_string(),
            }),
            ShellCommand::Put => Some(OperationRequest::Put {
                key: args[0].to_string(),
                value: args[1].to_string(),
            }),
            ShellCommand::List => Some(OperationRequest::List),
            ShellCommand::Help => None,
        };
        Some(request)
    }
}

/// Opens a session, runs one store operation, and closes the session.
fn execute(request: &OperationRequest, ctx: &ShellContext<'_>) -> Result<Reply, CommandError> {
    let session = ScopedConnection::acquire(ctx.manager)?;
    let store = session.store()?;
    debug!(session = session.session_id(), ?request, "executing");

    let reply = match request {
        OperationRequest::Delete { key } => store.delete(key).into_result().map(|()| Reply::Done),
        OperationRequest::Put { key, value } => {
            store.put(key, value).into_result().map(|()| Reply::Done)
        }
        OperationRequest::Get { key } => store.get(key).into_result().map(Reply::Value),
        OperationRequest::List => store.list().into_result().map(Reply::Rows),
    }?;
    Ok(reply)
}

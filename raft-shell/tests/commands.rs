//! Command dispatch and session lifecycle against a scripted connection manager.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use raft_shell::connection::{Connection, ConnectionManager, StoreClient};
use raft_shell::error::{CommandError, ConnectionError, Outcome, StoreError};
use raft_shell::shell::{CommandStatus, Dispatch, Dispatcher, ShellCommand};

#[derive(Clone, Copy)]
enum Behavior {
    Commit,
    Reject,
    StaleLeader,
    Fault,
    Panic,
}

#[derive(Default)]
struct Counters {
    connections: AtomicUsize,
    closes: AtomicUsize,
    store_calls: AtomicUsize,
}

struct FakeStore {
    behavior: Behavior,
    data: Arc<Mutex<BTreeMap<String, String>>>,
    counters: Arc<Counters>,
}

impl FakeStore {
    fn run<T>(&self, apply: impl FnOnce(&mut BTreeMap<String, String>) -> T) -> Outcome<T> {
        self.counters.store_calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Commit => Outcome::Committed(apply(&mut self.data.lock().unwrap())),
            Behavior::Reject => Outcome::RejectedTerminal(StoreError::Rejected("quorum lost".into())),
            Behavior::StaleLeader => Outcome::RejectedRetryable(StoreError::NotLeader {
                node_id: 1,
                leader_hint: 0,
            }),
            Behavior::Fault => Outcome::RejectedTerminal(StoreError::Timeout(Duration::from_secs(3))),
            Behavior::Panic => panic!("store exploded"),
        }
    }
}

impl StoreClient for FakeStore {
    fn delete(&self, key: &str) -> Outcome<()> {
        self.run(|data| {
            data.remove(key);
        })
    }

    fn put(&self, key: &str, value: &str) -> Outcome<()> {
        self.run(|data| {
            data.insert(key.to_string(), value.to_string());
        })
    }

    fn get(&self, key: &str) -> Outcome<Option<String>> {
        self.run(|data| data.get(key).cloned())
    }

    fn list(&self) -> Outcome<Vec<(String, String)>> {
        self.run(|data| data.clone().into_iter().collect())
    }
}

struct FakeConnection {
    store: FakeStore,
    counters: Arc<Counters>,
}

impl Connection for FakeConnection {
    fn session_id(&self) -> u64 {
        7
    }

    fn key_value_store(&self) -> Result<&dyn StoreClient, ConnectionError> {
        Ok(&self.store)
    }

    fn close(&self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.counters.closes.load(Ordering::SeqCst) > 0
    }
}

struct FakeManager {
    outage: bool,
    behavior: Mutex<Behavior>,
    data: Arc<Mutex<BTreeMap<String, String>>>,
    counters: Arc<Counters>,
}

impl ConnectionManager for FakeManager {
    fn get_connection(&self) -> Result<Box<dyn Connection>, ConnectionError> {
        self.counters.connections.fetch_add(1, Ordering::SeqCst);
        if self.outage {
            return Err(ConnectionError::Unreachable { attempts: 3 });
        }
        Ok(Box::new(FakeConnection {
            store: FakeStore {
                behavior: *self.behavior.lock().unwrap(),
                data: Arc::clone(&self.data),
                counters: Arc::clone(&self.counters),
            },
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct Harness {
    dispatcher: Dispatcher,
    manager: Arc<FakeManager>,
}

impl Harness {
    fn new(behavior: Behavior) -> Self {
        Self::build(behavior, false)
    }

    fn outage() -> Self {
        Self::build(Behavior::Commit, true)
    }

    fn build(behavior: Behavior, outage: bool) -> Self {
        let manager = Arc::new(FakeManager {
            outage,
            behavior: Mutex::new(behavior),
            data: Arc::default(),
            counters: Arc::default(),
        });
        let dispatcher = Dispatcher::new(manager.clone());
        Self {
            dispatcher,
            manager,
        }
    }

    fn set_behavior(&self, behavior: Behavior) {
        *self.manager.behavior.lock().unwrap() = behavior;
    }

    fn run(&self, line: &str) -> (Dispatch, String) {
        let mut out = Vec::new();
        let dispatch = self
            .dispatcher
            .dispatch_line(line, &mut out)
            .expect("writing to a Vec cannot fail");
        (dispatch, String::from_utf8(out).expect("utf-8 output"))
    }

    fn output(&self, line: &str) -> String {
        self.run(line).1
    }

    fn connections(&self) -> usize {
        self.manager.counters.connections.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.manager.counters.closes.load(Ordering::SeqCst)
    }

    fn store_calls(&self) -> usize {
        self.manager.counters.store_calls.load(Ordering::SeqCst)
    }
}

#[test]
fn committed_delete_prints_done_and_closes_once() {
    let shell = Harness::new(Behavior::Commit);

    let (dispatch, out) = shell.run("delete k1");

    assert_eq!(out, "done\n");
    assert_eq!(
        dispatch,
        Dispatch::Ran {
            command: ShellCommand::Delete,
            status: CommandStatus::Completed
        }
    );
    assert_eq!(shell.connections(), 1);
    assert_eq!(shell.closes(), 1);
}

#[test]
fn rejected_delete_prints_failed_and_closes_once() {
    let shell = Harness::new(Behavior::Reject);

    let (dispatch, out) = shell.run("delete k1");

    assert_eq!(out, "failed\n");
    assert!(matches!(
        dispatch,
        Dispatch::Ran {
            status: CommandStatus::Failed(CommandError::Store(StoreError::Rejected(_))),
            ..
        }
    ));
    assert_eq!(shell.closes(), 1);
}

#[test]
fn delete_without_key_prints_usage_and_never_connects() {
    let shell = Harness::new(Behavior::Commit);

    let (dispatch, out) = shell.run("delete");

    assert_eq!(out, format!("{}\n", ShellCommand::Delete.usage()));
    assert_eq!(
        dispatch,
        Dispatch::Ran {
            command: ShellCommand::Delete,
            status: CommandStatus::UsageShown
        }
    );
    assert_eq!(shell.connections(), 0);
}

#[test]
fn delete_with_two_keys_prints_usage_and_never_connects() {
    let shell = Harness::new(Behavior::Commit);

    assert_eq!(shell.output("delete k1 k2"), format!("{}\n", ShellCommand::Delete.usage()));
    assert_eq!(shell.connections(), 0);
    assert_eq!(shell.closes(), 0);
}

#[test]
fn cluster_outage_prints_failed_without_store_calls() {
    let shell = Harness::outage();

    let (dispatch, out) = shell.run("delete k1");

    assert_eq!(out, "failed\n");
    assert!(matches!(
        dispatch,
        Dispatch::Ran {
            status: CommandStatus::Failed(CommandError::Connection(ConnectionError::Unreachable { .. })),
            ..
        }
    ));
    assert_eq!(shell.connections(), 1);
    assert_eq!(shell.store_calls(), 0);
    assert_eq!(shell.closes(), 0);
}

#[test]
fn wrong_arity_never_opens_a_connection_for_any_command() {
    let shell = Harness::new(Behavior::Commit);

    for line in [
        "delete",
        "delete a b",
        "get",
        "get a b",
        "put",
        "put a",
        "put a b c",
        "list a",
        "help a b",
    ] {
        let (dispatch, _) = shell.run(line);
        assert!(
            matches!(
                dispatch,
                Dispatch::Ran {
                    status: CommandStatus::UsageShown,
                    ..
                }
            ),
            "'{line}' should be a usage error"
        );
    }
    assert_eq!(shell.connections(), 0);
}

#[test]
fn close_happens_exactly_once_on_every_exit_path() {
    for behavior in [
        Behavior::Commit,
        Behavior::Reject,
        Behavior::StaleLeader,
        Behavior::Fault,
    ] {
        let shell = Harness::new(behavior);
        shell.run("put k1 v1");
        shell.run("delete k1");
        shell.run("get k1");
        shell.run("list");
        assert_eq!(shell.connections(), 4);
        assert_eq!(shell.closes(), 4);
    }
}

#[test]
fn panicking_store_still_closes_the_connection() {
    let shell = Harness::new(Behavior::Panic);

    let result = panic::catch_unwind(AssertUnwindSafe(|| shell.run("delete k1")));

    assert!(result.is_err());
    assert_eq!(shell.connections(), 1);
    assert_eq!(shell.closes(), 1);
}

#[test]
fn faults_and_stale_leaders_print_failed() {
    for behavior in [Behavior::Fault, Behavior::StaleLeader] {
        let shell = Harness::new(behavior);
        assert_eq!(shell.output("delete k1"), "failed\n");
        assert_eq!(shell.output("put k1 v1"), "failed\n");
        assert_eq!(shell.output("get k1"), "failed\n");
    }
}

#[test]
fn deleting_keys_never_written_is_done() {
    let shell = Harness::new(Behavior::Commit);
    for key in ["k1", "missing", "a-b-c", "0"] {
        assert_eq!(shell.output(&format!("delete {key}")), "done\n");
    }
}

#[test]
fn delete_after_put_is_observed_by_get() {
    let shell = Harness::new(Behavior::Commit);

    assert_eq!(shell.output("put k1 v1"), "done\n");
    assert_eq!(shell.output("get k1"), "v1\n");
    assert_eq!(shell.output("delete k1"), "done\n");
    assert_eq!(shell.output("get k1"), "(nil)\n");
}

#[test]
fn list_prints_rows_in_key_order() {
    let shell = Harness::new(Behavior::Commit);
    assert_eq!(shell.output("list"), "(empty)\n");

    shell.run("put b 2");
    shell.run("put a 1");
    assert_eq!(shell.output("list"), "a = 1\nb = 2\n");
}

#[test]
fn unknown_command_is_not_a_usage_error() {
    let shell = Harness::new(Behavior::Commit);

    let (dispatch, out) = shell.run("drop k1");

    assert_eq!(dispatch, Dispatch::Unknown("drop".into()));
    assert!(out.starts_with("unknown command 'drop'"), "got {out:?}");
    assert!(out.contains("help"));
    assert!(!out.contains("usage:"));
    assert_eq!(shell.connections(), 0);
}

#[test]
fn command_names_are_case_sensitive() {
    let shell = Harness::new(Behavior::Commit);
    assert_eq!(shell.run("DELETE k1").0, Dispatch::Unknown("DELETE".into()));
    assert_eq!(shell.connections(), 0);
}

#[test]
fn blank_line_dispatches_nothing() {
    let shell = Harness::new(Behavior::Commit);
    assert_eq!(shell.run("   ").0, Dispatch::Empty);
    assert_eq!(shell.connections(), 0);
}

#[test]
fn help_is_local() {
    let shell = Harness::new(Behavior::Commit);

    let full = shell.output("help");
    assert!(full.contains("delete:"));
    assert_eq!(shell.output("help delete"), format!("{}\n", ShellCommand::Delete.help()));

    assert_eq!(shell.connections(), 0);
}

#[test]
fn help_on_unknown_topic_is_not_completed() {
    let shell = Harness::new(Behavior::Commit);

    let (dispatch, out) = shell.run("help drop");

    assert_eq!(
        dispatch,
        Dispatch::Ran {
            command: ShellCommand::Help,
            status: CommandStatus::UnknownTopic("drop".into())
        }
    );
    assert!(out.starts_with("unknown command 'drop'"), "got {out:?}");
    assert_eq!(shell.connections(), 0);
}

#[test]
fn behavior_change_applies_to_the_next_connection() {
    let shell = Harness::new(Behavior::Commit);
    assert_eq!(shell.output("delete k1"), "done\n");

    shell.set_behavior(Behavior::Reject);
    assert_eq!(shell.output("delete k1"), "failed\n");
    assert_eq!(shell.closes(), 2);
}

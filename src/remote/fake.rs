//! In-memory executor for tests and rehearsals.
//!
//! Responds to commands from a rule table, keeps a tiny per-host file store
//! so marker reads and writes behave like the real thing, and tracks a
//! per-host process table for the liveness probe and `pkill`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use super::{ExecMode, RemoteCommandResult, RemoteError, RemoteExecutor};
use crate::clock::Clock;
use crate::host::Host;

/// Canned reply for a matching command.
#[derive(Debug, Clone)]
pub struct Response {
    outcome: Outcome,
    delay: Option<Duration>,
    spawns: Option<String>,
}

#[derive(Debug, Clone)]
enum Outcome {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    Unreachable,
}

impl Response {
    pub fn exit(code: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            outcome: Outcome::Exit {
                code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
            delay: None,
            spawns: None,
        }
    }

    pub fn ok(stdout: &str) -> Self {
        Self::exit(0, stdout, "")
    }

    pub fn unreachable() -> Self {
        Self {
            outcome: Outcome::Unreachable,
            delay: None,
            spawns: None,
        }
    }

    /// Hold the reply back for `delay` (tokio time).
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Mark `process` as running on the host when this command is executed.
    pub fn spawns(mut self, process: &str) -> Self {
        self.spawns = Some(process.to_string());
        self
    }
}

/// How a fake process reacts to signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalBehavior {
    /// Exits on SIGTERM.
    Polite,
    /// Ignores SIGTERM, dies on SIGKILL.
    IgnoresTerm,
    /// Survives both (hung in the kernel).
    Unkillable,
}

/// A recorded invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub host: String,
    pub command: String,
    pub mode: ExecMode,
}

struct Rule {
    host: String,
    contains: String,
    response: Response,
}

type FileKey = (String, String);

#[derive(Default)]
struct Inner {
    rules: Vec<Rule>,
    unreachable: HashSet<String>,
    connection_failures: HashMap<String, u32>,
    calls: Vec<Call>,
    files: HashMap<FileKey, String>,
    timelines: HashMap<FileKey, Vec<(Duration, String)>>,
    processes: HashMap<FileKey, SignalBehavior>,
}

/// Rule-driven executor. Later rules take precedence over earlier ones;
/// a host of `"*"` matches every host.
pub struct ScriptedExecutor {
    inner: Mutex<Inner>,
    clock: Option<Box<dyn Clock>>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock: None,
        }
    }

    /// Use `clock` to decide which timeline entries are visible.
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock: Some(Box::new(clock)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn respond(&self, host: &str, contains: &str, response: Response) {
        self.lock().rules.push(Rule {
            host: host.to_string(),
            contains: contains.to_string(),
            response,
        });
    }

    pub fn unreachable(&self, host: &str) {
        self.lock().unreachable.insert(host.to_string());
    }

    /// Fail the next `count` calls to `host` with a connection error.
    pub fn fail_connections(&self, host: &str, count: u32) {
        self.lock()
            .connection_failures
            .insert(host.to_string(), count);
    }

    pub fn set_file(&self, host: &str, path: &str, content: &str) {
        self.lock()
            .files
            .insert((host.to_string(), path.to_string()), content.to_string());
    }

    pub fn file(&self, host: &str, path: &str) -> Option<String> {
        self.lock()
            .files
            .get(&(host.to_string(), path.to_string()))
            .cloned()
    }

    /// Make `path` on `host` take each content from its offset onwards.
    /// Reads before the first offset find no file.
    pub fn file_timeline(&self, host: &str, path: &str, entries: Vec<(Duration, &str)>) {
        let entries = entries
            .into_iter()
            .map(|(at, content)| (at, content.to_string()))
            .collect();
        self.lock()
            .timelines
            .insert((host.to_string(), path.to_string()), entries);
    }

    pub fn set_running(&self, host: &str, process: &str, behavior: SignalBehavior) {
        self.lock()
            .processes
            .insert((host.to_string(), process.to_string()), behavior);
    }

    pub fn is_running(&self, host: &str, process: &str) -> bool {
        self.lock()
            .processes
            .contains_key(&(host.to_string(), process.to_string()))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, host: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.host == host)
            .map(|c| c.command.clone())
            .collect()
    }

    fn now(&self) -> Duration {
        self.clock.as_ref().map(|c| c.now()).unwrap_or_default()
    }

    fn builtin(&self, inner: &mut Inner, host: &str, command: &str) -> Option<(i32, String, String)> {
        if let Some(rest) = command.strip_prefix("cat ") {
            let key = (host.to_string(), unquote(rest.trim()));
            let content = match inner.timelines.get(&key) {
                Some(timeline) => {
                    let now = self.now();
                    timeline
                        .iter()
                        .filter(|(at, _)| *at <= now)
                        .last()
                        .map(|(_, c)| c.clone())
                }
                None => inner.files.get(&key).cloned(),
            };
            return Some(match content {
                Some(c) => (0, c, String::new()),
                None => (
                    1,
                    String::new(),
                    format!("cat: {}: No such file or directory", key.1),
                ),
            });
        }

        if let Some(rest) = command.strip_prefix("printf '%s\\n' ") {
            let (token, path) = rest.split_once(" > ")?;
            inner.files.insert(
                (host.to_string(), unquote(path.trim())),
                format!("{}\n", unquote(token.trim())),
            );
            return Some((0, String::new(), String::new()));
        }

        let mut words = command.split_whitespace();
        match words.next()? {
            "rm" => {
                for path in words.filter(|w| !w.starts_with('-')) {
                    let key = (host.to_string(), unquote(path));
                    // timelines model a peer that keeps writing; leave them
                    inner.files.remove(&key);
                }
                Some((0, String::new(), String::new()))
            }
            "ps" => {
                let name = words.find_map(|w| w.strip_prefix("p=")).map(unquote)?;
                let running = inner
                    .processes
                    .contains_key(&(host.to_string(), name.to_string()));
                Some((if running { 0 } else { 1 }, String::new(), String::new()))
            }
            "pkill" => {
                let args: Vec<&str> = words.collect();
                let name = *args.last()?;
                let kill = args.iter().any(|a| *a == "-KILL" || *a == "-9");
                let key = (host.to_string(), name.to_string());
                let Some(behavior) = inner.processes.get(&key).copied() else {
                    return Some((1, String::new(), String::new()));
                };
                let dies = match behavior {
                    SignalBehavior::Polite => true,
                    SignalBehavior::IgnoresTerm => kill,
                    SignalBehavior::Unkillable => false,
                };
                if dies {
                    inner.processes.remove(&key);
                }
                Some((0, String::new(), String::new()))
            }
            _ => None,
        }
    }
}

#[async_trait::async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        host: &Host,
        command: &str,
        mode: ExecMode,
    ) -> Result<RemoteCommandResult, RemoteError> {
        let started_at = Utc::now();
        let (reply, delay) = {
            let mut inner = self.lock();
            inner.calls.push(Call {
                host: host.name.clone(),
                command: command.to_string(),
                mode,
            });

            if inner.unreachable.contains(&host.name) {
                return Err(connection_error(host));
            }
            if let Some(left) = inner.connection_failures.get_mut(&host.name) {
                if *left > 0 {
                    *left -= 1;
                    return Err(connection_error(host));
                }
            }

            let matched = inner
                .rules
                .iter()
                .rev()
                .find(|r| (r.host == "*" || r.host == host.name) && command.contains(&r.contains))
                .map(|r| r.response.clone());

            match matched {
                Some(response) => {
                    if let Some(process) = &response.spawns {
                        inner
                            .processes
                            .entry((host.name.clone(), process.clone()))
                            .or_insert(SignalBehavior::Polite);
                    }
                    match response.outcome {
                        Outcome::Unreachable => return Err(connection_error(host)),
                        Outcome::Exit {
                            code,
                            stdout,
                            stderr,
                        } => (Some((code, stdout, stderr)), response.delay),
                    }
                }
                None => (self.builtin(&mut inner, &host.name, command), None),
            }
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if mode == ExecMode::Detached {
            return Ok(RemoteCommandResult::detached(host, command, started_at));
        }

        let (code, stdout, stderr) = reply.unwrap_or((0, String::new(), String::new()));
        Ok(RemoteCommandResult {
            host: host.name.clone(),
            command: command.to_string(),
            exit_code: Some(code),
            stdout,
            stderr,
            started_at,
            finished_at: Some(Utc::now()),
        })
    }
}

fn connection_error(host: &Host) -> RemoteError {
    RemoteError::Connection {
        host: host.name.clone(),
        reason: "ssh: connect to host: Connection timed out".to_string(),
    }
}

/// Reverse of [`super::shell_quote`] for the simple forms it produces.
fn unquote(s: &str) -> String {
    match s.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        Some(inner) => inner.replace(r"'\''", "'"),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Role;

    fn host(name: &str) -> Host {
        Host::new(name, "10.0.0.1", Role::Client)
    }

    #[tokio::test]
    async fn test_later_rules_win() {
        let exec = ScriptedExecutor::new();
        exec.respond("*", "uname", Response::ok("generic\n"));
        exec.respond("a", "uname", Response::ok("specific\n"));

        let a = exec.execute(&host("a"), "uname -r", ExecMode::Blocking).await.unwrap();
        let b = exec.execute(&host("b"), "uname -r", ExecMode::Blocking).await.unwrap();
        assert_eq!(a.stdout, "specific\n");
        assert_eq!(b.stdout, "generic\n");
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let exec = ScriptedExecutor::new();
        let h = host("a");
        let missing = exec.execute(&h, "cat state.txt", ExecMode::Blocking).await.unwrap();
        assert_eq!(missing.exit_code, Some(1));

        exec.execute(&h, "printf '%s\\n' TestRunning > state.txt", ExecMode::Blocking)
            .await
            .unwrap();
        let read = exec.execute(&h, "cat state.txt", ExecMode::Blocking).await.unwrap();
        assert_eq!(read.stdout, "TestRunning\n");
    }

    #[tokio::test]
    async fn test_pkill_respects_signal_behavior() {
        let exec = ScriptedExecutor::new();
        let h = host("a");
        exec.set_running("a", "testpmd", SignalBehavior::IgnoresTerm);

        exec.execute(&h, "pkill -TERM -x testpmd", ExecMode::Blocking).await.unwrap();
        assert!(exec.is_running("a", "testpmd"));
        exec.execute(&h, "pkill -KILL -x testpmd", ExecMode::Blocking).await.unwrap();
        assert!(!exec.is_running("a", "testpmd"));
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("'a b'"), "a b");
        assert_eq!(unquote(r"'it'\''s'"), "it's");
        assert_eq!(unquote("plain"), "plain");
    }
}

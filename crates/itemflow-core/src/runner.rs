use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// Reads of local git metadata (rev-parse, branch listing, status).
pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Local mutations: worktree add/remove, branch create/delete, commit.
pub const MUTATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Anything that talks to a remote (pull, push, fetch).
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("`{program}` was not found; install it or fix PATH")]
    NotFound { program: String },
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    pub mutates: bool,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            timeout: LOCAL_TIMEOUT,
            mutates: false,
        }
    }

    pub fn in_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn mutating(mut self) -> Self {
        self.mutates = true;
        self
    }

    /// Shell-quoted rendering used for dry-run previews and error messages.
    pub fn display(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Set when the command was not executed because of dry-run mode.
    pub simulated: bool,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            simulated: false,
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
            simulated: false,
        }
    }

    fn simulated() -> Self {
        Self {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            simulated: true,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Best human-readable explanation of a failure: stderr, then stdout, then the exit code.
    pub fn detail(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Executes external commands on behalf of every other component.
///
/// Implementations own the dry-run decision: a spec marked `mutates` must not
/// be executed while `is_dry_run()` is true.
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError>;
    fn is_dry_run(&self) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    dry_run: bool,
    extra_env: BTreeMap<String, String>,
}

impl ProcessRunner {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            extra_env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.extra_env
            .extend(env.iter().map(|(key, value)| (key.clone(), value.clone())));
        self
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        if self.dry_run && spec.mutates {
            eprintln!("[dry-run] {}", spec.display());
            return Ok(CommandOutput::simulated());
        }
        debug!(command = %spec.display(), cwd = ?spec.cwd, "run");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&self.extra_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound && which::which(&spec.program).is_err()
            {
                RunnerError::NotFound {
                    program: spec.program.clone(),
                }
            } else {
                RunnerError::Spawn {
                    command: spec.display(),
                    source,
                }
            }
        })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if started.elapsed() >= spec.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(RunnerError::Timeout {
                            command: spec.display(),
                            secs: spec.timeout.as_secs(),
                        });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    return Err(RunnerError::Spawn {
                        command: spec.display(),
                        source,
                    })
                }
            }
        };

        Ok(CommandOutput {
            code: status.code(),
            stdout: stdout.map(join_reader).unwrap_or_default(),
            stderr: stderr.map(join_reader).unwrap_or_default(),
            simulated: false,
        })
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// Deterministic runner for tests: records every invocation and replays
/// scripted outputs. The first rule whose pattern is contained in the joined
/// argument list wins; unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    dry_run: bool,
    rules: Mutex<Vec<(String, CommandOutput)>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn respond(self, pattern: &str, output: CommandOutput) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push((pattern.to_string(), output));
        }
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Joined argument lists of every command that actually "ran" (not simulated).
    pub fn executed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|spec| !(self.dry_run && spec.mutates))
            .map(|spec| spec.args.join(" "))
            .collect()
    }

    pub fn invoked(&self, pattern: &str) -> bool {
        self.calls()
            .iter()
            .any(|spec| spec.args.join(" ").contains(pattern))
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(spec.clone());
        }
        if self.dry_run && spec.mutates {
            return Ok(CommandOutput::simulated());
        }
        let joined = spec.args.join(" ");
        let rules = self.rules.lock().map(|rules| rules.clone()).unwrap_or_default();
        Ok(rules
            .into_iter()
            .find(|(pattern, _)| joined.contains(pattern.as_str()))
            .map(|(_, output)| output)
            .unwrap_or_else(|| CommandOutput::ok("")))
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

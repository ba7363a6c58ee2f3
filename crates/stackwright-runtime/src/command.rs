use crate::RuntimeError;
use std::io::{Read, Seek, SeekFrom, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// A single blocking external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn argv(&self) -> &[String] {
        &self.args
    }

    pub fn timeout_duration(&self) -> Duration {
        self.timeout
    }

    /// Wrap this command so it runs through `wrapper` (e.g. `sudo -n`).
    #[must_use]
    pub fn wrapped(self, wrapper: &str, wrapper_args: &[&str]) -> Self {
        let mut args: Vec<String> = wrapper_args.iter().map(|a| (*a).to_owned()).collect();
        args.push(self.program);
        args.extend(self.args);
        Self {
            program: wrapper.to_owned(),
            args,
            stdin: self.stdin,
            timeout: self.timeout,
        }
    }

    /// Shell-like rendering used in logs and error messages.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for a in &self.args {
            out.push(' ');
            if a.is_empty() || a.contains(char::is_whitespace) {
                out.push('\'');
                out.push_str(a);
                out.push('\'');
            } else {
                out.push_str(a);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or -1 when the process was killed by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[inline]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Run `spec` to completion or until its timeout expires.
///
/// Output is captured into anonymous temp files rather than pipes so a chatty
/// child cannot block on a full pipe while we poll for its exit. A timeout
/// kills the child and is reported as [`RuntimeError::Timeout`].
pub fn run(spec: &CommandSpec) -> Result<CommandOutput, RuntimeError> {
    let shown = spec.display();
    let mut stdout_file = tempfile::tempfile()?;
    let mut stderr_file = tempfile::tempfile()?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdout(Stdio::from(stdout_file.try_clone()?))
        .stderr(Stdio::from(stderr_file.try_clone()?))
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    debug!("exec: {shown}");
    let mut child = cmd.spawn().map_err(|e| RuntimeError::Spawn {
        command: shown.clone(),
        source: e,
    })?;

    if let Some(ref input) = spec.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input)?;
        }
    }

    let deadline = Instant::now() + spec.timeout;
    let mut poll = Duration::from_millis(10);
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RuntimeError::Timeout {
                command: shown,
                secs: spec.timeout.as_secs(),
            });
        }
        std::thread::sleep(poll);
        poll = (poll * 2).min(Duration::from_millis(200));
    };

    let mut stdout = String::new();
    stdout_file.seek(SeekFrom::Start(0))?;
    stdout_file.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    stderr_file.seek(SeekFrom::Start(0))?;
    stderr_file.read_to_string(&mut stderr)?;

    Ok(CommandOutput {
        status: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

/// Fixed attempt budget with linear backoff, applied to transient failures only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!("{what}: attempt {attempt}/{attempts} failed transiently: {e}; retrying");
                    std::thread::sleep(self.backoff * attempt);
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!("{what}: giving up after {attempts} attempts");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn runs_and_captures_output() {
        let out = run(&CommandSpec::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]))
            .unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[test]
    fn feeds_stdin() {
        let out = run(&CommandSpec::new("cat").stdin("line one\nline two\n")).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "line one\nline two\n");
    }

    #[test]
    fn timeout_kills_the_child() {
        let started = Instant::now();
        let err = run(&CommandSpec::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(200)))
        .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { .. }));
        assert!(err.is_transient());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = run(&CommandSpec::new("definitely-not-a-real-binary-xyz")).unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }

    #[test]
    fn spawn_error_names_the_rendered_command() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-xyz").arg("two words");
        match run(&spec) {
            Err(RuntimeError::Spawn { command, .. }) => {
                assert_eq!(command, "definitely-not-a-real-binary-xyz 'two words'");
            }
            other => panic!("expected a spawn error, got {other:?}"),
        }
    }

    #[test]
    fn wrapped_prefixes_the_wrapper() {
        let spec = CommandSpec::new("chown")
            .args(["svc:svc", "/opt/x"])
            .wrapped("sudo", &["-n"]);
        assert_eq!(spec.program(), "sudo");
        assert_eq!(spec.argv(), ["-n", "chown", "svc:svc", "/opt/x"]);
        assert_eq!(spec.display(), "sudo -n chown svc:svc /opt/x");
    }

    #[test]
    fn display_quotes_whitespace() {
        let spec = CommandSpec::new("echo").arg("two words");
        assert_eq!(spec.display(), "echo 'two words'");
    }

    #[test]
    fn retry_recovers_from_transient_failures() {
        let calls = Cell::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
        };
        let result = policy.run("pull", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(RuntimeError::Timeout {
                    command: "pull".to_owned(),
                    secs: 1,
                })
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_budget_is_bounded() {
        let calls = Cell::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
        };
        let result: Result<(), _> = policy.run("pull", || {
            calls.set(calls.get() + 1);
            Err(RuntimeError::Transient {
                command: "pull".to_owned(),
                detail: "busy".to_owned(),
            })
        });
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::default().run("chmod", || {
            calls.set(calls.get() + 1);
            Err(RuntimeError::CommandFailed {
                command: "chmod".to_owned(),
                status: 1,
                stderr: "Operation not permitted".to_owned(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use crate::error::TransferError;

pub const SSHPASS_HINT: &str = "Install it for password authentication \
(apt install sshpass / dnf install sshpass / brew install hudochenkov/sshpass/sshpass), \
or set up key-based login with ssh-copy-id.";

pub type LineCallback<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// A subprocess invocation. Environment values are never included in
/// [`CommandSpec::display`], so secrets passed through `env` stay out of logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Short description of a failure for error messages.
    pub fn failure_reason(&self) -> String {
        let stderr = self.stderr.trim();
        match (self.status, stderr.is_empty()) {
            (Some(code), true) => format!("exit code {}", code),
            (Some(code), false) => format!("exit code {}: {}", code, stderr),
            (None, true) => "terminated by signal".to_string(),
            (None, false) => format!("terminated by signal: {}", stderr),
        }
    }
}

/// Everything that shells out (`ssh`, `scp`, `rsync`, `sshpass`) goes
/// through this trait.
#[async_trait]
pub trait RemoteCommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, TransferError>;

    /// Run `spec`, calling `on_line` for every line of stdout. Carriage
    /// returns count as line breaks so rsync-style progress is delivered.
    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        on_line: LineCallback<'_>,
    ) -> Result<CommandOutput, TransferError>;

    fn is_installed(&self, program: &str) -> bool;
}

/// Runs commands on the local machine with tokio's process support.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(spec: &CommandSpec, err: std::io::Error) -> TransferError {
        if err.kind() == std::io::ErrorKind::NotFound {
            let hint = if spec.program == "sshpass" {
                SSHPASS_HINT
            } else {
                "Install the OpenSSH client tools and rsync."
            };
            TransferError::capability(&spec.program, hint)
        } else {
            TransferError::Io(err)
        }
    }

    fn timed_out(spec: &CommandSpec, timeout: Duration) -> TransferError {
        TransferError::Timeout {
            command: spec.display(),
            seconds: timeout.as_secs(),
        }
    }
}

async fn read_lines<R: AsyncRead + Unpin>(
    mut reader: R,
    on_line: LineCallback<'_>,
) -> std::io::Result<String> {
    let mut captured = Vec::new();
    let mut pending = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        captured.extend_from_slice(&buf[..n]);
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    on_line(&String::from_utf8_lossy(&pending));
                    pending.clear();
                }
            } else {
                pending.push(byte);
            }
        }
    }
    if !pending.is_empty() {
        on_line(&String::from_utf8_lossy(&pending));
    }

    Ok(String::from_utf8_lossy(&captured).into_owned())
}

#[async_trait]
impl RemoteCommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, TransferError> {
        debug!("Running: {}", spec);
        let child = Self::command(spec)
            .spawn()
            .map_err(|e| Self::spawn_error(spec, e))?;

        let output = match spec.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| Self::timed_out(spec, timeout))??,
            None => child.wait_with_output().await?,
        };

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        on_line: LineCallback<'_>,
    ) -> Result<CommandOutput, TransferError> {
        debug!("Running (streaming): {}", spec);
        let mut child = Self::command(spec)
            .spawn()
            .map_err(|e| Self::spawn_error(spec, e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let work = async {
            let stdout_task = async {
                match stdout {
                    Some(stdout) => read_lines(stdout, on_line).await,
                    None => Ok(String::new()),
                }
            };
            let stderr_task = async {
                let mut text = String::new();
                if let Some(mut stderr) = stderr {
                    stderr.read_to_string(&mut text).await?;
                }
                Ok::<_, std::io::Error>(text)
            };
            let (stdout, stderr) = tokio::try_join!(stdout_task, stderr_task)?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>(CommandOutput {
                status: status.code(),
                stdout,
                stderr,
            })
        };

        match spec.timeout {
            Some(timeout) => Ok(tokio::time::timeout(timeout, work)
                .await
                .map_err(|_| Self::timed_out(spec, timeout))??),
            None => Ok(work.await?),
        }
    }

    fn is_installed(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Quote `value` for a POSIX shell on the remote side.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@%+=,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote a remote path, leaving a leading `~` or `~/` bare so the remote
/// shell still expands it to the login user's home.
pub fn remote_path_quote(path: &str) -> String {
    if path == "~" {
        return path.to_string();
    }
    match path.strip_prefix("~/") {
        Some("") => "~/".to_string(),
        Some(rest) => format!("~/{}", shell_quote(rest)),
        None => shell_quote(path),
    }
}

/// `ssh` options shared by every non-interactive invocation.
pub const SSH_OPTIONS: [&str; 4] = [
    "-o",
    "ConnectTimeout=5",
    "-o",
    "StrictHostKeyChecking=accept-new",
];

/// Build an `ssh` command for `destination`. With a password the call is
/// wrapped in `sshpass -e` and the secret travels in `SSHPASS`.
pub fn ssh_command(destination: &str, password: Option<&str>, remote_command: &str) -> CommandSpec {
    let spec = match password {
        Some(password) => CommandSpec::new("sshpass")
            .args(["-e", "ssh"])
            .env("SSHPASS", password),
        None => CommandSpec::new("ssh").args(["-o", "BatchMode=yes"]),
    };
    spec.args(SSH_OPTIONS)
        .arg(destination)
        .arg(remote_command)
}

/// Key-only connection check: `ssh -o BatchMode=yes -o ConnectTimeout=5`.
pub fn key_check_command(destination: &str) -> CommandSpec {
    CommandSpec::new("ssh")
        .args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=5"])
        .arg(destination)
        .arg("echo \"SSH OK\"")
        .timeout(Duration::from_secs(10))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

    /// Records every command and answers from a closure.
    pub(crate) struct ScriptedRunner {
        responder: Responder,
        installed: HashSet<String>,
        pub(crate) calls: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        pub(crate) fn new(
            installed: &[&str],
            responder: impl Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static,
        ) -> Self {
            Self {
                responder: Box::new(responder),
                installed: installed.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn command_lines(&self) -> Vec<String> {
            self.calls().iter().map(CommandSpec::display).collect()
        }
    }

    #[async_trait]
    impl RemoteCommandRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, TransferError> {
            self.calls.lock().unwrap().push(spec.clone());
            if !self.installed.contains(&spec.program) {
                return Err(TransferError::capability(&spec.program, "not installed"));
            }
            Ok((self.responder)(spec))
        }

        async fn run_streaming(
            &self,
            spec: &CommandSpec,
            on_line: LineCallback<'_>,
        ) -> Result<CommandOutput, TransferError> {
            let output = self.run(spec).await?;
            for line in output.stdout.split(['\n', '\r']).filter(|l| !l.is_empty()) {
                on_line(line);
            }
            Ok(output)
        }

        fn is_installed(&self, program: &str) -> bool {
            self.installed.contains(program)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_password_stays_out_of_argv() {
        let spec = ssh_command("root@pve", Some("hunter2"), "pvesm status");
        assert_eq!(spec.program, "sshpass");
        assert!(spec.args.iter().all(|a| !a.contains("hunter2")));
        assert!(!spec.display().contains("hunter2"));
        assert_eq!(spec.env, vec![("SSHPASS".to_string(), "hunter2".to_string())]);
        assert_eq!(spec.args.last().map(String::as_str), Some("pvesm status"));

        let spec = ssh_command("root@pve", None, "true");
        assert_eq!(spec.program, "ssh");
        assert!(spec.args.contains(&"BatchMode=yes".to_string()));
        assert!(spec.env.is_empty());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/var/lib/vz/template/iso"), "/var/lib/vz/template/iso");
        assert_eq!(shell_quote("/srv/my isos"), "'/srv/my isos'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_remote_path_quote_keeps_home_expansion() {
        assert_eq!(remote_path_quote("~"), "~");
        assert_eq!(remote_path_quote("~/"), "~/");
        assert_eq!(remote_path_quote("~/isos"), "~/isos");
        assert_eq!(remote_path_quote("~/my isos"), "~/'my isos'");
        assert_eq!(remote_path_quote("/srv/my isos"), "'/srv/my isos'");
        // Only a leading tilde is special.
        assert_eq!(remote_path_quote("/srv/~/x y"), "'/srv/~/x y'");
        assert_eq!(remote_path_quote("~bob/isos"), "'~bob/isos'");
    }

    #[test]
    fn test_failure_reason() {
        assert_eq!(CommandOutput::failed(255, "").failure_reason(), "exit code 255");
        assert_eq!(
            CommandOutput::failed(1, "Permission denied\n").failure_reason(),
            "exit code 1: Permission denied"
        );
    }

    #[tokio::test]
    async fn test_read_lines_splits_carriage_returns() -> anyhow::Result<()> {
        let seen = Mutex::new(Vec::new());
        let input: &[u8] = b"file.iso\r   1,024  10%\r  10,240 100%\nsent 10 bytes\n";
        let captured = read_lines(input, &|line: &str| seen.lock().unwrap().push(line.to_string())).await?;

        assert_eq!(captured.len(), input.len());
        let seen = seen.into_inner().unwrap();
        assert_eq!(
            seen,
            vec!["file.iso", "   1,024  10%", "  10,240 100%", "sent 10 bytes"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_program_is_capability_error() {
        let runner = SystemCommandRunner::new();
        let err = runner
            .run(&CommandSpec::new("distroget-no-such-program"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::CapabilityMissing { .. }));
        assert!(!runner.is_installed("distroget-no-such-program"));
    }
}

//! Helpers for running external commands.

use std::io::{Read, Seek};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use rustix::fd::{FromRawFd, IntoRawFd, OwnedFd};

/// Extension helpers for [`Command`].
pub trait CommandRunExt {
    /// Run the command, verifying a successful exit and folding captured
    /// stderr into the error otherwise.
    fn run(&mut self) -> Result<()>;

    /// Run the command and parse its stdout as JSON.
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T>;
}

impl CommandRunExt for Command {
    fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stdin(Stdio::null());
        self.stderr(Stdio::from(stderr.try_clone()?));
        tracing::trace!("exec: {self:?}");
        let st = self.status()?;
        if !st.success() {
            let mut stderr = stderr;
            stderr.seek(std::io::SeekFrom::Start(0))?;
            let mut buf = String::new();
            stderr.read_to_string(&mut buf)?;
            anyhow::bail!("Subprocess failed: {st:?}\n{}", buf.trim());
        }
        Ok(())
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        self.stdin(Stdio::null());
        self.stdout(Stdio::piped());
        tracing::trace!("exec: {self:?}");
        let child = self.spawn().context("Spawning subprocess")?;
        let o = child.wait_with_output()?;
        if !o.status.success() {
            anyhow::bail!("Subprocess failed: {:?}", o.status);
        }
        serde_json::from_slice(&o.stdout).context("Parsing subprocess output as JSON")
    }
}

/// Fd redirection into spawned children.
pub trait CommandRedirectionExt {
    /// Pass a file descriptor into the target process at a fixed number.
    fn take_fd_n(&mut self, fd: Arc<OwnedFd>, target: i32) -> &mut Self;
}

#[allow(unsafe_code)]
impl CommandRedirectionExt for Command {
    fn take_fd_n(&mut self, fd: Arc<OwnedFd>, target: i32) -> &mut Self {
        use std::os::unix::process::CommandExt;
        unsafe {
            self.pre_exec(move || {
                let mut target = OwnedFd::from_raw_fd(target);
                rustix::io::dup2(&*fd, &mut target)?;
                // Intentionally leak into the child.
                let _ = target.into_raw_fd();
                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run() {
        Command::new("true").run().unwrap();
        let err = Command::new("false").run().unwrap_err();
        assert!(format!("{err}").contains("Subprocess failed"));
    }

    #[test]
    fn test_run_captures_stderr() {
        let err = Command::new("ls")
            .args(["/definitely/not/here"])
            .run()
            .unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("No such file"), "{msg}");
    }

    #[test]
    fn test_run_and_parse_json() {
        #[derive(serde::Deserialize)]
        struct V {
            a: u32,
        }
        let v: V = Command::new("echo")
            .arg(r#"{"a": 4}"#)
            .run_and_parse_json()
            .unwrap();
        assert_eq!(v.a, 4);
    }

    #[test]
    fn test_take_fd_n() {
        // Write into a tempfile handed to the child at fd 9.
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let f = tmp.reopen().unwrap();
        let owned: OwnedFd = f.into();
        Command::new("sh")
            .args(["-c", "echo hello >&9"])
            .take_fd_n(Arc::new(owned), 9)
            .run()
            .unwrap();
        let content = std::fs::read_to_string(tmp.path()).unwrap();
        assert_eq!(content.trim(), "hello");
    }
}

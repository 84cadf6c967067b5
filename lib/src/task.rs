//! Wrapper for driving external executables (`ostree`, the desktop cache
//! compilers, `flatpak`).

use std::ffi::OsStr;
use std::io::{Read, Seek};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use camino::Utf8Path;

pub(crate) struct Task {
    description: String,
    cmd: Command,
    /// Capture stdout/stderr; on failure the captured text is folded into
    /// the returned error so callers can surface the executor's message.
    capture: bool,
}

impl Task {
    pub(crate) fn new(description: impl Into<String>, exe: impl AsRef<str>) -> Self {
        let mut cmd = Command::new(exe.as_ref());
        // Noninteractive
        cmd.stdin(Stdio::null());
        Self {
            description: description.into(),
            cmd,
            capture: false,
        }
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    /// Capture output, surfacing it only if the command fails.
    pub(crate) fn capture_failure(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Redirect stdout and stderr into `path`, truncating it first. Used for
    /// pulls, whose progress lines are polled out of the file by status
    /// queries.
    pub(crate) fn output_to(mut self, path: &Utf8Path) -> Result<Self> {
        let f =
            std::fs::File::create(path).with_context(|| format!("Creating output file {path}"))?;
        self.cmd.stdout(Stdio::from(f.try_clone()?));
        self.cmd.stderr(Stdio::from(f));
        self.capture = false;
        Ok(self)
    }

    /// Run the command, failing if it does not exit successfully.
    pub(crate) fn run(self) -> Result<()> {
        let description = self.description;
        let mut cmd = self.cmd;
        tracing::debug!("exec: {cmd:?}");
        let mut output = None;
        if self.capture {
            let tmpf = tempfile::tempfile()?;
            cmd.stdout(Stdio::from(tmpf.try_clone()?));
            cmd.stderr(Stdio::from(tmpf.try_clone()?));
            output = Some(tmpf);
        }
        let st = cmd
            .status()
            .with_context(|| format!("Spawning {description} failed"))?;
        if !st.success() {
            let mut detail = String::new();
            if let Some(mut output) = output {
                output.seek(std::io::SeekFrom::Start(0))?;
                output.read_to_string(&mut detail)?;
            }
            let detail = detail.trim();
            if detail.is_empty() {
                anyhow::bail!("Task {description} failed: {st:?}");
            }
            anyhow::bail!("Task {description} failed: {st:?}: {detail}");
        }
        Ok(())
    }

    /// Like [`run()`], but return stdout.
    pub(crate) fn read(self) -> Result<String> {
        let description = self.description;
        let mut cmd = self.cmd;
        tracing::debug!("exec: {cmd:?}");
        cmd.stdout(Stdio::piped());
        let child = cmd
            .spawn()
            .with_context(|| format!("Spawning {description} failed"))?;
        let o = child
            .wait_with_output()
            .with_context(|| format!("Executing {description} failed"))?;
        if !o.status.success() {
            anyhow::bail!("Task {description} failed: {:?}", o.status);
        }
        Ok(String::from_utf8(o.stdout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_and_read() {
        Task::new("true", "true").run().unwrap();
        let out = Task::new("echo", "echo").args(["hello"]).read().unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_failure_surfaces_description() {
        let err = Task::new("listing missing dir", "ls")
            .args(["/definitely/not/here"])
            .capture_failure()
            .run()
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("listing missing dir"), "{msg}");
    }

    #[test]
    fn test_output_redirect() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("out.txt")).unwrap();
        Task::new("echo", "echo")
            .args(["progress line"])
            .output_to(&path)
            .unwrap()
            .run()
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("progress line"));
    }
}

//! Scoped external-process handles
//!
//! Decoder and encoder children (ffmpeg) must not outlive the operation that
//! spawned them: the guard kills and reaps the child on every exit path that
//! did not already wait for it.

use std::io;
use std::process::{Child, ExitStatus};

/// Child process that is terminated and reaped when dropped
pub struct ScopedChild {
    child: Option<Child>,
    name: &'static str,
}

impl ScopedChild {
    pub fn new(child: Child, name: &'static str) -> Self {
        Self {
            child: Some(child),
            name,
        }
    }

    /// Access the running child (stdin/stdout handles live here)
    pub fn inner_mut(&mut self) -> &mut Child {
        self.child.as_mut().expect("child already waited")
    }

    /// Wait for orderly exit, consuming the guard
    pub fn wait(mut self) -> io::Result<ExitStatus> {
        let mut child = self.child.take().expect("child already waited");
        child.wait()
    }
}

impl Drop for ScopedChild {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            // Best effort: the child may already have exited
            if let Err(e) = child.kill() {
                tracing::debug!("{} kill on drop: {e}", self.name);
            }
            if let Err(e) = child.wait() {
                tracing::warn!("{} reap on drop failed: {e}", self.name);
            } else {
                tracing::debug!("{} terminated on drop", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn wait_consumes_the_child() {
        let child = Command::new("true")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn true");
        let guard = ScopedChild::new(child, "true");
        assert!(guard.wait().expect("wait").success());
    }

    #[test]
    fn drop_kills_a_long_running_child() {
        let start = std::time::Instant::now();
        let child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        drop(ScopedChild::new(child, "sleep"));
        // Kill + reap must not have waited out the sleep
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }
}

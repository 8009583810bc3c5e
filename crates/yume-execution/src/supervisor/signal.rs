//! Process-tree termination.
//!
//! Children are started as leaders of their own process group, so signalling
//! the negated pid reaches every descendant the CLI spawned.

#[cfg(unix)]
mod imp {
    /// Negative `dest` addresses a process group.
    fn send(dest: i32, signal: libc::c_int) {
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(dest, signal) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(dest, signal, error = %err, "kill failed");
            }
        }
    }

    pub(crate) async fn terminate_group(pid: u32) {
        let Ok(pid) = i32::try_from(pid) else { return };
        if pid > 0 {
            send(-pid, libc::SIGTERM);
        }
    }

    pub(crate) async fn kill_tree(pid: u32) {
        let Ok(pid) = i32::try_from(pid) else { return };
        if pid > 0 {
            send(-pid, libc::SIGKILL);
            send(pid, libc::SIGKILL);
        }
    }
}

#[cfg(windows)]
mod imp {
    async fn taskkill(pid: u32, force: bool) {
        let mut cmd = tokio::process::Command::new("taskkill");
        cmd.arg("/T").arg("/PID").arg(pid.to_string());
        if force {
            cmd.arg("/F");
        }
        match cmd.output().await {
            Ok(output) if !output.status.success() => {
                tracing::debug!(pid, force, "taskkill reported failure");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(pid, error = %e, "Failed to run taskkill"),
        }
    }

    pub(crate) async fn terminate_group(pid: u32) {
        taskkill(pid, false).await;
    }

    pub(crate) async fn kill_tree(pid: u32) {
        taskkill(pid, true).await;
    }
}

#[cfg(not(any(unix, windows)))]
mod imp {
    pub(crate) async fn terminate_group(_pid: u32) {}
    pub(crate) async fn kill_tree(_pid: u32) {}
}

pub(crate) use imp::{kill_tree, terminate_group};

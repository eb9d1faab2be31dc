//! Spawning and plumbing for one supervised dev server.
//!
//! The command line is run through `sh -c` with the project directory as
//! cwd and the resolved port exported as `PORT`. The child gets its own
//! session so the whole process tree can be signaled as a group, and (on
//! Linux) a parent-death signal so daemon crashes do not orphan servers.

use std::path::Path;
use std::process::ExitStatus;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::log_buffer::{LineAssembler, LogSink};

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // NOTE: `unsafe fn` bodies are not implicitly unsafe in Rust 2024.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Signal an entire process group.
pub fn signal_group(pgid: i32, signal: libc::c_int) {
    unsafe {
        libc::kill(-pgid, signal);
    }
}

pub struct ServerChild {
    pub pid: Option<u32>,
    pub pgid: Option<i32>,
    child: tokio::process::Child,
    pumps: Vec<JoinHandle<()>>,
}

impl ServerChild {
    /// Wait for the process to exit, then for both output pumps to drain,
    /// so every line the child wrote is in the buffer before the caller
    /// records the terminal state.
    pub async fn wait(mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await;
        for pump in self.pumps {
            let _ = pump.await;
        }
        status
    }
}

pub fn spawn(command: &str, cwd: &Path, port: u16, sink: &LogSink) -> std::io::Result<ServerChild> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .env("PORT", port.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    unsafe {
        cmd.pre_exec(|| {
            // Start a new session so we can signal the whole process tree.
            set_parent_death_signal()?;
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();
    let pgid = pid.map(|p| p as i32);

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump(stdout, "stdout", sink.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump(stderr, "stderr", sink.clone()));
    }

    Ok(ServerChild {
        pid,
        pgid,
        child,
        pumps,
    })
}

fn pump<R>(reader: R, tag: &'static str, sink: LogSink) -> JoinHandle<()>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut assembler = LineAssembler::default();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for line in assembler.push_chunk(&buf[..n]) {
                        sink.emit(format!("[{tag}] {line}")).await;
                    }
                }
            }
        }
        if let Some(rest) = assembler.finish() {
            sink.emit(format!("[{tag}] {rest}")).await;
        }
    })
}

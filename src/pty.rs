use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

use crate::channel::{Channel, ChannelBackend, ChannelCommand, ChannelKind};
use crate::local::ShellSpec;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),
}

fn size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Returns true if this host can allocate a native pseudo-terminal.
///
/// Opens and immediately drops a 1x1 PTY pair.
pub fn native_pty_available() -> bool {
    match native_pty_system().openpty(size(1, 1)) {
        Ok(_pair) => true,
        Err(e) => {
            tracing::info!(?e, "native pty unavailable");
            false
        }
    }
}

/// A shell running on a native pseudo-terminal.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl Pty {
    pub fn spawn(shell: &ShellSpec, rows: u16, cols: u16) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(size(rows, cols)).map_err(PtyError::OpenPty)?;

        let mut cmd = CommandBuilder::new(&shell.path);
        cmd.args(&shell.pty_args);
        cmd.env_clear();
        for (key, value) in &shell.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = shell.cwd {
            cmd.cwd(dir);
        }

        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
        // Drop our copy of the slave so the reader sees EOF once the shell
        // (the last slave holder) exits.
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    /// Hand the PTY over to background I/O tasks and return the channel
    /// that drives them.
    ///
    /// Three blocking tasks are started: an output reader, an input writer
    /// (which also applies resizes, keeping them ordered with input) and a
    /// child exit monitor. All three end once the child exits or the channel
    /// is closed.
    pub fn into_channel(self) -> Result<Channel, PtyError> {
        let Pty { master, mut child } = self;
        let reader = master.try_clone_reader().map_err(PtyError::CloneReader)?;
        let writer = master.take_writer().map_err(PtyError::TakeWriter)?;
        let pid = child.process_id();
        let killer = child.clone_killer();
        let child_exited = Arc::new(AtomicBool::new(false));

        let (channel, backend) = Channel::new(ChannelKind::NativePty);
        let cancelled = backend.cancelled();
        {
            let child_exited = child_exited.clone();
            backend.on_close(move || hang_up(pid, killer, &child_exited));
        }
        let ChannelBackend {
            commands,
            output: output_tx,
            ..
        } = backend;

        let exited = child_exited.clone();
        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                match child.wait() {
                    Ok(status) => tracing::debug!(?status, ?pid, "pty child exited"),
                    Err(e) => tracing::error!(?e, ?pid, "error waiting for pty child"),
                }
            }));
            exited.store(true, Ordering::Release);
            if let Err(e) = result {
                tracing::error!("pty child monitor panicked: {:?}", e);
            }
        });

        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut reader = reader;
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            // Blocks when the client is slow, pushing back on
                            // the child through the kernel PTY buffer.
                            if output_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                                break;
                            }
                        }
                        // EIO once the slave side is gone.
                        Err(_) => break,
                    }
                }
            }));
            if let Err(e) = result {
                tracing::error!("pty reader panicked: {:?}", e);
            }
        });

        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut writer = writer;
                let mut commands = commands;
                while let Some(command) = commands.blocking_recv() {
                    if cancelled.is_cancelled() {
                        break;
                    }
                    match command {
                        ChannelCommand::Input(data) => {
                            if writer.write_all(&data).is_err() {
                                break;
                            }
                            let _ = writer.flush();
                        }
                        ChannelCommand::Resize { cols, rows } => {
                            if let Err(e) = master.resize(size(rows, cols)) {
                                tracing::warn!(?e, cols, rows, "pty resize failed");
                            }
                        }
                    }
                }
            }));
            if let Err(e) = result {
                tracing::error!("pty writer panicked: {:?}", e);
            }
        });

        Ok(channel)
    }
}

/// Hang up the child: SIGHUP to its process group (portable_pty makes the
/// child a session leader), then a hard kill.
fn hang_up(
    pid: Option<u32>,
    mut killer: Box<dyn ChildKiller + Send + Sync>,
    child_exited: &AtomicBool,
) -> std::io::Result<()> {
    if child_exited.load(Ordering::Acquire) {
        tracing::debug!(?pid, "pty child already exited, nothing to kill");
        return Ok(());
    }
    #[cfg(unix)]
    if let Some(pid) = pid {
        if pid != 0 && pid <= i32::MAX as u32 {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGHUP);
            }
        }
    }
    match killer.kill() {
        Ok(()) => Ok(()),
        // Raced with a natural exit.
        Err(e) if child_exited.load(Ordering::Acquire) => {
            tracing::debug!(?e, "kill after exit");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

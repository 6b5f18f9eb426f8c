//! Degraded terminal for hosts without a native pseudo-terminal.
//!
//! The shell runs as a plain child process with piped stdio. Dedicated
//! threads move bytes between the pipes and the channel queues:
//!
//! - `pipe-stdout` / `pipe-stderr` read the child's output and hand it to the
//!   channel's bounded output queue;
//! - `pipe-stdin` pulls input from the command queue, waiting with a bounded
//!   timeout so it notices cancellation or child exit without spinning;
//! - `pipe-reaper` polls the child for exit, reaps it and tells `pipe-stdin`
//!   to stop, so the last output sender goes away and the channel ends.
//!
//! There is no line discipline, so a minimal one is emulated here: local
//! echo, CR to LF on input and LF to CRLF on output. Resize requests and
//! terminal signals (Ctrl-C, Ctrl-Z) have no effect.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelBackend, ChannelCommand, ChannelKind, OutputSender};
use crate::local::ShellSpec;

/// How long the writer and reaper threads block before re-checking
/// cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Polls the reaper makes after close before abandoning the child (~5s).
const REAP_GRACE_POLLS: u32 = 50;

pub fn spawn(shell: &ShellSpec) -> std::io::Result<Channel> {
    let mut cmd = Command::new(&shell.path);
    cmd.args(&shell.pipe_args)
        .env_clear()
        .envs(shell.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(ref dir) = shell.cwd {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group so close can signal the whole job.
        cmd.process_group(0);
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();
    let missing = || std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child stdio not captured");
    let stdin = child.stdin.take().ok_or_else(missing)?;
    let stdout = child.stdout.take().ok_or_else(missing)?;
    let stderr = child.stderr.take().ok_or_else(missing)?;
    tracing::debug!(pid, shell = %shell.path.display(), "spawned pipe-emulated shell");

    let child = Arc::new(Mutex::new(child));
    let (channel, backend) = Channel::new(ChannelKind::PipeEmulated);
    let cancelled = backend.cancelled();
    {
        let child = child.clone();
        backend.on_close(move || terminate(pid, &child));
    }
    let ChannelBackend {
        commands, output, ..
    } = backend;
    let runtime = tokio::runtime::Handle::current();
    let exited = CancellationToken::new();

    spawn_reader("pipe-stdout", stdout, output.clone())?;
    spawn_reader("pipe-stderr", stderr, output.clone())?;

    {
        let cancelled = cancelled.clone();
        let exited = exited.clone();
        std::thread::Builder::new()
            .name("pipe-stdin".into())
            .spawn(move || write_loop(runtime, commands, stdin, output, cancelled, exited))?;
    }

    std::thread::Builder::new()
        .name("pipe-reaper".into())
        .spawn(move || {
            let mut polls_after_close = 0u32;
            loop {
                let status = child.lock().try_wait();
                match status {
                    Ok(Some(status)) => {
                        tracing::debug!(pid, ?status, "pipe child exited");
                        break;
                    }
                    Ok(None) => {
                        if cancelled.is_cancelled() {
                            polls_after_close += 1;
                            if polls_after_close > REAP_GRACE_POLLS {
                                tracing::warn!(pid, "pipe child survived close, giving up on reaping");
                                break;
                            }
                        }
                        std::thread::sleep(POLL_INTERVAL);
                    }
                    Err(e) => {
                        tracing::warn!(pid, ?e, "failed to poll pipe child");
                        break;
                    }
                }
            }
            exited.cancel();
        })?;

    Ok(channel)
}

fn spawn_reader<R>(name: &str, source: R, output: OutputSender) -> std::io::Result<()>
where
    R: Read + Send + 'static,
{
    std::thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut source = source;
        let mut translator = OutputTranslator::default();
        let mut buf = [0u8; 4096];
        loop {
            match source.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = translator.translate(&buf[..n]);
                    if output.blocking_send(Bytes::from(chunk)).is_err() {
                        break;
                    }
                }
            }
        }
    })?;
    Ok(())
}

fn write_loop(
    runtime: tokio::runtime::Handle,
    mut commands: mpsc::Receiver<ChannelCommand>,
    mut stdin: std::process::ChildStdin,
    echo: OutputSender,
    cancelled: CancellationToken,
    exited: CancellationToken,
) {
    loop {
        if cancelled.is_cancelled() || exited.is_cancelled() {
            break;
        }
        // The timer must be created inside the runtime context.
        let next = runtime.block_on(async {
            tokio::time::timeout(POLL_INTERVAL, commands.recv()).await
        });
        let command = match next {
            Err(_elapsed) => continue,
            Ok(None) => break,
            Ok(Some(command)) => command,
        };
        match command {
            ChannelCommand::Input(data) => {
                let echoed = echo_input(&data);
                if !echoed.is_empty() && echo.blocking_send(Bytes::from(echoed)).is_err() {
                    break;
                }
                let translated = translate_input(&data);
                if stdin.write_all(&translated).and_then(|_| stdin.flush()).is_err() {
                    break;
                }
            }
            ChannelCommand::Resize { cols, rows } => {
                tracing::debug!(cols, rows, "resize ignored on pipe-emulated terminal");
            }
        }
    }
}

fn terminate(pid: u32, child: &Mutex<Child>) -> std::io::Result<()> {
    #[cfg(unix)]
    if pid != 0 && pid <= i32::MAX as u32 {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let mut child = child.lock();
    match child.try_wait()? {
        Some(_) => Ok(()),
        None => match child.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        },
    }
}

/// Map terminal-style Enter (CR, or CRLF) to the LF a line-reading shell
/// expects.
pub fn translate_input(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' {
            if iter.peek() == Some(&&b'\n') {
                iter.next();
            }
            out.push(b'\n');
        } else {
            out.push(b);
        }
    }
    out
}

/// What a cooked-mode terminal would echo for the given keystrokes.
pub fn echo_input(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        match b {
            b'\r' | b'\n' => out.extend_from_slice(b"\r\n"),
            0x7f | 0x08 => out.extend_from_slice(b"\x08 \x08"),
            b if b < 0x20 && b != b'\t' => {}
            b => out.push(b),
        }
    }
    out
}

/// LF to CRLF conversion that remembers a trailing CR across chunks.
#[derive(Debug, Default)]
pub struct OutputTranslator {
    last_was_cr: bool,
}

impl OutputTranslator {
    pub fn translate(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + data.len() / 8);
        for &b in data {
            if b == b'\n' && !self.last_was_cr {
                out.push(b'\r');
            }
            out.push(b);
            self.last_was_cr = b == b'\r';
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_cr_becomes_lf() {
        assert_eq!(translate_input(b"ls\r"), b"ls\n");
        assert_eq!(translate_input(b"ls\r\n"), b"ls\n");
        assert_eq!(translate_input(b"a\nb"), b"a\nb");
    }

    #[test]
    fn echo_handles_enter_and_backspace() {
        assert_eq!(echo_input(b"ls\r"), b"ls\r\n");
        assert_eq!(echo_input(b"\x7f"), b"\x08 \x08");
        assert_eq!(echo_input(b"\x03"), b"");
    }

    #[test]
    fn output_lf_becomes_crlf() {
        let mut t = OutputTranslator::default();
        assert_eq!(t.translate(b"a\nb\r\nc"), b"a\r\nb\r\nc");
    }

    #[test]
    fn output_translator_remembers_cr_across_chunks() {
        let mut t = OutputTranslator::default();
        assert_eq!(t.translate(b"line\r"), b"line\r");
        assert_eq!(t.translate(b"\nnext\n"), b"\nnext\r\n");
    }

    #[cfg(unix)]
    fn sh() -> ShellSpec {
        ShellSpec {
            path: "/bin/sh".into(),
            pty_args: vec![],
            pipe_args: vec![],
            env: vec![("PATH".into(), "/usr/bin:/bin".into())],
            cwd: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn pipe_shell_runs_commands() {
        let mut channel = spawn(&sh()).expect("spawn pipe shell");
        assert_eq!(channel.kind(), ChannelKind::PipeEmulated);
        channel.write(Bytes::from("echo PIPE_$((40+2))\r")).await.unwrap();

        let mut collected = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !collected.contains("PIPE_42\r\n") {
            match tokio::time::timeout_at(deadline, channel.next_chunk()).await {
                Ok(Some(chunk)) => collected.push_str(&String::from_utf8_lossy(&chunk)),
                _ => break,
            }
        }
        // Echo of the typed line followed by the shell's translated output.
        assert!(collected.contains("echo PIPE_$((40+2))\r\n"), "got {collected:?}");
        assert!(collected.contains("PIPE_42\r\n"), "got {collected:?}");
        channel.close().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn pipe_output_ends_when_shell_exits() {
        let mut channel = spawn(&sh()).unwrap();
        let closer = channel.closer();
        channel.write(Bytes::from("exit\n")).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match tokio::time::timeout_at(deadline, channel.next_chunk()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => panic!("pipe output did not end after exit"),
            }
        }
        tokio::time::timeout(Duration::from_secs(1), closer.ended())
            .await
            .expect("pipe channel should report it ended");
        assert!(!closer.is_closed());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn pipe_ends_without_reading_after_shell_exits() {
        // Nobody drains output; the end must still be observable.
        let channel = spawn(&sh()).unwrap();
        let closer = channel.closer();
        channel.write(Bytes::from("exit\r")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), closer.ended())
            .await
            .expect("pipe channel should end once the shell exits");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn pipe_close_terminates_child() {
        let channel = spawn(&sh()).unwrap();
        let closer = channel.closer();
        closer.close().unwrap();
        closer.close().unwrap();
        assert!(channel.is_closed());
    }
}

//! Local shell spawner.
//!
//! Picks the host's interactive shell and starts it on the best terminal
//! backend available: a native PTY where one exists, otherwise the
//! degraded pipe emulation in [`crate::pipe`]. Which backend to use is
//! decided once per process.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Serialize;
use thiserror::Error;

use crate::channel::Channel;
use crate::config::{LocalSettings, PtyMode};

/// Initial PTY size; the client sends its real size right after attaching.
const INITIAL_ROWS: u16 = 24;
const INITIAL_COLS: u16 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
    OtherUnix,
}

impl OsFamily {
    pub fn detect() -> Self {
        Self::from_os_str(std::env::consts::OS)
    }

    pub fn from_os_str(os: &str) -> Self {
        match os {
            "linux" | "android" => OsFamily::Linux,
            "macos" | "ios" => OsFamily::MacOs,
            "windows" => OsFamily::Windows,
            _ => OsFamily::OtherUnix,
        }
    }

    /// Shells to try, most preferred first.
    pub fn shell_candidates(&self) -> &'static [ShellCandidate] {
        match self {
            OsFamily::Linux | OsFamily::OtherUnix => UNIX_SHELLS,
            OsFamily::MacOs => MACOS_SHELLS,
            OsFamily::Windows => WINDOWS_SHELLS,
        }
    }

    /// Variables copied from the server's own environment into the shell's.
    pub fn passthrough_vars(&self) -> &'static [&'static str] {
        match self {
            OsFamily::Windows => &["PATH", "USERPROFILE", "USERNAME", "SystemRoot", "ComSpec"],
            _ => &["PATH", "HOME", "USER"],
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OsFamily::Linux => "linux",
            OsFamily::MacOs => "macos",
            OsFamily::Windows => "windows",
            OsFamily::OtherUnix => "unix",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ShellCandidate {
    pub path: &'static str,
    /// Arguments when running on a native PTY.
    pub pty_args: &'static [&'static str],
    /// Arguments when running over pipes; forces interactive mode since the
    /// shell cannot detect a terminal.
    pub pipe_args: &'static [&'static str],
}

const fn candidate(
    path: &'static str,
    pty_args: &'static [&'static str],
    pipe_args: &'static [&'static str],
) -> ShellCandidate {
    ShellCandidate {
        path,
        pty_args,
        pipe_args,
    }
}

const UNIX_SHELLS: &[ShellCandidate] = &[
    candidate("/bin/bash", &[], &["-i"]),
    candidate("/usr/bin/bash", &[], &["-i"]),
    candidate("/bin/zsh", &[], &["-i"]),
    candidate("/usr/bin/zsh", &[], &["-i"]),
    candidate("/bin/sh", &[], &["-i"]),
];

const MACOS_SHELLS: &[ShellCandidate] = &[
    candidate("/bin/zsh", &[], &["-i"]),
    candidate("/bin/bash", &[], &["-i"]),
    candidate("/bin/sh", &[], &["-i"]),
];

const WINDOWS_SHELLS: &[ShellCandidate] = &[
    candidate(
        r"C:\Program Files\PowerShell\7\pwsh.exe",
        &["-NoLogo"],
        &["-NoLogo", "-NoExit", "-Command", "-"],
    ),
    candidate(
        r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe",
        &["-NoLogo"],
        &["-NoLogo", "-NoExit", "-Command", "-"],
    ),
    candidate(r"C:\Windows\System32\cmd.exe", &[], &["/Q"]),
];

/// Terminal backend capability of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PtyCapability {
    NativePty,
    PipeEmulated,
}

static NATIVE_PTY_AVAILABLE: OnceLock<bool> = OnceLock::new();

impl PtyCapability {
    /// Resolve the configured mode to a concrete capability. `Auto` checks
    /// for a native PTY the first time it is asked and reuses the answer.
    pub fn resolve(mode: PtyMode) -> Self {
        match mode {
            PtyMode::Native => PtyCapability::NativePty,
            PtyMode::Pipe => PtyCapability::PipeEmulated,
            PtyMode::Auto => {
                if *NATIVE_PTY_AVAILABLE.get_or_init(crate::pty::native_pty_available) {
                    PtyCapability::NativePty
                } else {
                    tracing::warn!(
                        "no native pty available; local shells use pipe emulation \
                         (no resize, no job-control signals)"
                    );
                    PtyCapability::PipeEmulated
                }
            }
        }
    }
}

/// Everything needed to launch the chosen shell.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub path: PathBuf,
    pub pty_args: Vec<String>,
    pub pipe_args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

/// Describes a spawned local session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalTarget {
    pub os: OsFamily,
    pub shell: PathBuf,
    pub capability: PtyCapability,
    /// This machine's hostname, for display.
    pub hostname: String,
    /// The account the shell runs as.
    pub username: String,
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("no usable shell found for {0}")]
    NoShellFound(OsFamily),

    #[error("platform unsupported: {0}")]
    PlatformUnsupported(String),

    #[error("could not allocate terminal resources: {0}")]
    ResourceExhausted(String),

    #[error("spawn failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Pick the first candidate that exists. A configured override is tried
/// before the built-in list.
pub fn select_shell<F>(
    candidates: &[ShellCandidate],
    preferred: Option<&Path>,
    exists: F,
) -> Option<(PathBuf, Vec<String>, Vec<String>)>
where
    F: Fn(&Path) -> bool,
{
    if let Some(path) = preferred {
        if exists(path) {
            let known = candidates.iter().find(|c| Path::new(c.path) == path);
            let to_vec = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
            return Some(match known {
                Some(c) => (path.to_path_buf(), to_vec(c.pty_args), to_vec(c.pipe_args)),
                None => (path.to_path_buf(), Vec::new(), Vec::new()),
            });
        }
        tracing::warn!(shell = %path.display(), "configured shell not found, trying defaults");
    }
    candidates.iter().find(|c| exists(Path::new(c.path))).map(|c| {
        (
            PathBuf::from(c.path),
            c.pty_args.iter().map(|s| s.to_string()).collect(),
            c.pipe_args.iter().map(|s| s.to_string()).collect(),
        )
    })
}

/// Build the shell's environment from scratch rather than inheriting the
/// server's: terminal type, locale, and a short passthrough list.
pub fn build_env<F>(os: OsFamily, locale: &str, lookup: F) -> Vec<(String, String)>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = vec![("TERM".to_string(), "xterm-256color".to_string())];
    if os != OsFamily::Windows {
        env.push(("LANG".to_string(), locale.to_string()));
        env.push(("LC_ALL".to_string(), locale.to_string()));
    }
    for var in os.passthrough_vars() {
        if let Some(value) = lookup(var) {
            env.push((var.to_string(), value));
        }
    }
    env
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn local_username(os: OsFamily) -> String {
    let var = if os == OsFamily::Windows { "USERNAME" } else { "USER" };
    std::env::var(var).unwrap_or_else(|_| "unknown".to_string())
}

/// Spawns the host's default interactive shell.
#[derive(Debug, Clone)]
pub struct LocalSpawner {
    settings: LocalSettings,
    os: OsFamily,
}

impl LocalSpawner {
    pub fn new(settings: LocalSettings) -> Self {
        Self {
            settings,
            os: OsFamily::detect(),
        }
    }

    pub fn os(&self) -> OsFamily {
        self.os
    }

    pub fn capability(&self) -> PtyCapability {
        PtyCapability::resolve(self.settings.pty_mode)
    }

    pub fn shell_spec(&self) -> Result<ShellSpec, SpawnError> {
        let (path, pty_args, pipe_args) = select_shell(
            self.os.shell_candidates(),
            self.settings.shell.as_deref(),
            |p| p.is_file(),
        )
        .ok_or(SpawnError::NoShellFound(self.os))?;
        let env = build_env(self.os, &self.settings.locale, |k| std::env::var(k).ok());
        let cwd = dirs::home_dir().filter(|d| d.is_dir());
        Ok(ShellSpec {
            path,
            pty_args,
            pipe_args,
            env,
            cwd,
        })
    }

    /// Start the shell. Blocking: forks a process and, on the native path,
    /// opens a PTY. Call from a blocking context inside a tokio runtime.
    pub fn spawn(&self) -> Result<(Channel, LocalTarget), SpawnError> {
        let shell = self.shell_spec()?;
        let capability = self.capability();
        tracing::info!(
            os = %self.os,
            shell = %shell.path.display(),
            ?capability,
            "spawning local shell"
        );

        let channel = match capability {
            PtyCapability::NativePty => crate::pty::Pty::spawn(&shell, INITIAL_ROWS, INITIAL_COLS)
                .and_then(|pty| pty.into_channel())
                .map_err(|e| SpawnError::ResourceExhausted(e.to_string()))?,
            PtyCapability::PipeEmulated => crate::pipe::spawn(&shell).map_err(|e| match e.kind() {
                std::io::ErrorKind::Unsupported => SpawnError::PlatformUnsupported(e.to_string()),
                std::io::ErrorKind::OutOfMemory | std::io::ErrorKind::WouldBlock => {
                    SpawnError::ResourceExhausted(e.to_string())
                }
                _ => SpawnError::Io(e),
            })?,
        };

        Ok((
            channel,
            LocalTarget {
                os: self.os,
                shell: shell.path,
                capability,
                hostname: local_hostname(),
                username: local_username(self.os),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_family_mapping() {
        assert_eq!(OsFamily::from_os_str("linux"), OsFamily::Linux);
        assert_eq!(OsFamily::from_os_str("macos"), OsFamily::MacOs);
        assert_eq!(OsFamily::from_os_str("windows"), OsFamily::Windows);
        assert_eq!(OsFamily::from_os_str("freebsd"), OsFamily::OtherUnix);
    }

    #[test]
    fn select_first_existing_candidate() {
        let picked = select_shell(UNIX_SHELLS, None, |p| p == Path::new("/bin/zsh")).unwrap();
        assert_eq!(picked.0, PathBuf::from("/bin/zsh"));
        assert_eq!(picked.2, vec!["-i".to_string()]);
    }

    #[test]
    fn select_respects_candidate_order() {
        let picked = select_shell(UNIX_SHELLS, None, |_| true).unwrap();
        assert_eq!(picked.0, PathBuf::from("/bin/bash"));
    }

    #[test]
    fn select_none_when_nothing_exists() {
        assert!(select_shell(UNIX_SHELLS, None, |_| false).is_none());
    }

    #[test]
    fn configured_shell_wins_when_present() {
        let preferred = Path::new("/opt/fish/bin/fish");
        let picked = select_shell(UNIX_SHELLS, Some(preferred), |_| true).unwrap();
        assert_eq!(picked.0, preferred);
        assert!(picked.1.is_empty());
    }

    #[test]
    fn configured_shell_missing_falls_back() {
        let picked = select_shell(UNIX_SHELLS, Some(Path::new("/nope")), |p| {
            p == Path::new("/bin/sh")
        })
        .unwrap();
        assert_eq!(picked.0, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn configured_known_shell_keeps_its_args() {
        let preferred = Path::new("/bin/sh");
        let picked = select_shell(UNIX_SHELLS, Some(preferred), |_| true).unwrap();
        assert_eq!(picked.2, vec!["-i".to_string()]);
    }

    #[test]
    fn env_is_built_not_inherited() {
        let env = build_env(OsFamily::Linux, "C.UTF-8", |k| match k {
            "PATH" => Some("/usr/bin".into()),
            "HOME" => Some("/home/u".into()),
            "AWS_SECRET_ACCESS_KEY" => Some("leak".into()),
            _ => None,
        });
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["TERM", "LANG", "LC_ALL", "PATH", "HOME"]);
        assert!(env.contains(&("TERM".into(), "xterm-256color".into())));
        assert!(!env.iter().any(|(_, v)| v == "leak"));
    }

    #[test]
    fn windows_env_passthrough() {
        let env = build_env(OsFamily::Windows, "C.UTF-8", |k| {
            (k == "SystemRoot").then(|| r"C:\Windows".to_string())
        });
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["TERM", "SystemRoot"]);
    }

    #[test]
    fn forced_modes_skip_detection() {
        assert_eq!(PtyCapability::resolve(PtyMode::Pipe), PtyCapability::PipeEmulated);
        assert_eq!(PtyCapability::resolve(PtyMode::Native), PtyCapability::NativePty);
    }

    #[test]
    fn auto_mode_is_stable() {
        let first = PtyCapability::resolve(PtyMode::Auto);
        let second = PtyCapability::resolve(PtyMode::Auto);
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn shell_spec_finds_a_shell_on_unix() {
        let spawner = LocalSpawner::new(LocalSettings::default());
        let spec = spawner.shell_spec().unwrap();
        assert!(spec.path.is_file());
        assert!(spec.env.iter().any(|(k, _)| k == "TERM"));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn spawn_pipe_mode_reports_capability() {
        let spawner = LocalSpawner::new(LocalSettings {
            pty_mode: PtyMode::Pipe,
            shell: Some("/bin/sh".into()),
            ..LocalSettings::default()
        });
        let (channel, target) = tokio::task::spawn_blocking(move || spawner.spawn())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target.capability, PtyCapability::PipeEmulated);
        assert_eq!(target.shell, PathBuf::from("/bin/sh"));
        assert!(!target.hostname.is_empty());
        assert_eq!(channel.kind(), crate::channel::ChannelKind::PipeEmulated);
        channel.close().unwrap();
    }
}

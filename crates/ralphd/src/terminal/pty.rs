//! portable-pty backend: attach read-only to a tmux pane, optionally inside
//! a container.

use std::io::Write;
use std::sync::Mutex;

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use ralph_core::Config;
use tracing::debug;

use super::{PtyControl, PtyDimensions, PtySpawner, Result, SessionKey, SpawnedPty, TerminalError};

fn pty_err(e: impl std::fmt::Display) -> TerminalError {
    TerminalError::Pty(e.to_string())
}

fn lock_err<T>(_: std::sync::PoisonError<T>) -> TerminalError {
    TerminalError::Pty("pty lock poisoned".to_string())
}

impl From<PtyDimensions> for PtySize {
    fn from(dims: PtyDimensions) -> Self {
        PtySize {
            rows: dims.rows,
            cols: dims.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Spawns `tmux attach-session -r -t <session>:<pane>` in a fresh PTY.
#[derive(Debug, Clone)]
pub struct TmuxAttachSpawner {
    tmux_bin: String,
    /// `(docker_bin, container)` in remote mode.
    remote: Option<(String, String)>,
}

impl TmuxAttachSpawner {
    pub fn local(tmux_bin: impl Into<String>) -> Self {
        Self {
            tmux_bin: tmux_bin.into(),
            remote: None,
        }
    }

    pub fn remote(
        tmux_bin: impl Into<String>,
        docker_bin: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            tmux_bin: tmux_bin.into(),
            remote: Some((docker_bin.into(), container.into())),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        match &config.container {
            Some(container) => Self::remote(&config.tmux_bin, &config.docker_bin, container),
            None => Self::local(&config.tmux_bin),
        }
    }

    /// Full command line for attaching to `key`.
    pub fn argv(&self, key: &SessionKey) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some((docker_bin, container)) = &self.remote {
            argv.extend([
                docker_bin.clone(),
                "exec".to_string(),
                "-it".to_string(),
                container.clone(),
            ]);
        }
        argv.extend([
            self.tmux_bin.clone(),
            "attach-session".to_string(),
            "-r".to_string(),
            "-t".to_string(),
            key.target(),
        ]);
        argv
    }
}

impl PtySpawner for TmuxAttachSpawner {
    fn spawn(&self, key: &SessionKey, dims: PtyDimensions) -> Result<SpawnedPty> {
        let argv = self.argv(key);
        let Some((program, args)) = argv.split_first() else {
            return Err(TerminalError::Pty("empty attach command".to_string()));
        };

        let pair = native_pty_system().openpty(dims.into()).map_err(pty_err)?;
        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");

        let mut child = pair.slave.spawn_command(cmd).map_err(pty_err)?;
        drop(pair.slave);
        let killer = child.clone_killer();
        let reader = pair.master.try_clone_reader().map_err(pty_err)?;
        let writer = pair.master.take_writer().map_err(pty_err)?;
        debug!(key = %key, command = %argv.join(" "), "spawned attach command");

        // Reap the child; the reader sees EOF once it is gone.
        std::thread::Builder::new()
            .name(format!("ralph-pty-wait-{key}"))
            .spawn(move || {
                let _ = child.wait();
            })?;

        Ok(SpawnedPty {
            reader,
            control: Box::new(PortablePtyControl {
                master: Mutex::new(pair.master),
                writer: Mutex::new(writer),
                killer: Mutex::new(killer),
            }),
        })
    }
}

struct PortablePtyControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyControl for PortablePtyControl {
    fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().map_err(lock_err)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn resize(&self, dims: PtyDimensions) -> Result<()> {
        self.master
            .lock()
            .map_err(lock_err)?
            .resize(dims.into())
            .map_err(pty_err)
    }

    fn kill(&self) -> Result<()> {
        self.killer.lock().map_err(lock_err)?.kill()?;
        Ok(())
    }
}

//! A harness for running a real codewire daemon against a scratch
//! data dir. The daemon process is killed when the handle drops.

use std::{
    fs,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    process,
    process::{Command, Stdio},
    time,
};

use anyhow::{anyhow, Context};
use tempfile::TempDir;

use super::{client::Client, codewire_bin};

/// Proc is a helper handle for a `codewire daemon` subprocess.
/// It kills the subprocess when it goes out of scope.
pub struct Proc {
    pub proc: process::Child,
    _tmp_dir: Option<TempDir>,
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    pub log_file: PathBuf,
}

impl Proc {
    pub fn new() -> anyhow::Result<Proc> {
        let tmp_dir = tempfile::Builder::new()
            .prefix("codewire-test")
            .rand_bytes(12)
            .tempdir()
            .context("creating tmp dir")?;
        let data_dir = tmp_dir.path().join("data");
        let mut proc = Proc::launch(&data_dir)?;
        proc._tmp_dir = Some(tmp_dir);
        Ok(proc)
    }

    /// Start a daemon over an existing data dir; used to exercise
    /// restart and restore behavior.
    pub fn launch(data_dir: &Path) -> anyhow::Result<Proc> {
        fs::create_dir_all(data_dir).context("creating data dir")?;
        let socket_path = data_dir.join("codewire.sock");
        let log_file = data_dir.join("daemon.log");
        eprintln!("spawning daemon proc with log {:?}", &log_file);

        let proc = Command::new(codewire_bin())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("--data-dir")
            .arg(data_dir)
            // a scratch HOME keeps the daemon away from any real
            // ~/.config/codewire/config.toml
            .env("HOME", data_dir)
            .arg("daemon")
            .spawn()
            .context("spawning daemon process")?;

        // spin until we can dial the socket successfully
        let mut sleep_dur = time::Duration::from_millis(5);
        for _ in 0..12 {
            if UnixStream::connect(&socket_path).is_ok() {
                break;
            }
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }

        Ok(Proc {
            proc,
            _tmp_dir: None,
            data_dir: data_dir.to_path_buf(),
            socket_path,
            log_file,
        })
    }

    pub fn connect(&self) -> anyhow::Result<Client> {
        Client::connect(&self.socket_path)
    }

    /// Ask the daemon to shut down the way an operator would, with a
    /// SIGTERM, and wait for it to finish its teardown.
    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        // Safety: basic ffi, the pid stays valid until we wait on it.
        unsafe {
            libc::kill(self.proc.id() as i32, libc::SIGTERM);
        }
        let deadline = time::Instant::now() + time::Duration::from_secs(10);
        loop {
            if self.proc.try_wait().context("polling daemon")?.is_some() {
                return Ok(());
            }
            if time::Instant::now() > deadline {
                return Err(anyhow!("daemon did not exit after SIGTERM"));
            }
            std::thread::sleep(time::Duration::from_millis(25));
        }
    }

    /// Kill the daemon without any chance to clean up, simulating a
    /// crash. The data dir is left exactly as the last flush wrote it.
    pub fn kill_hard(&mut self) -> anyhow::Result<()> {
        self.proc.kill().context("killing daemon")?;
        self.proc.wait().context("reaping daemon")?;
        Ok(())
    }

    pub fn dump_log(&self) {
        if let Ok(log) = fs::read_to_string(&self.log_file) {
            eprintln!("=== daemon log ===\n{log}");
        }
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if let Ok(None) = self.proc.try_wait() {
            let _ = self.proc.kill();
        }
        let _ = self.proc.wait();
    }
}

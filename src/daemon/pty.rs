// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Small helpers around the pty master/slave pair. The master fd is
//! owned by exactly one session actor; everything here hands out
//! duplicated fds so ownership stays clear.

use std::{
    io,
    os::fd::{AsRawFd, FromRawFd as _, OwnedFd},
    process::Stdio,
};

use anyhow::Context;
use nix::pty::Winsize;

// see `man ioctl_tty` for info on this ioctl command
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize { ws_row: rows, ws_col: cols, ws_xpixel: 0, ws_ypixel: 0 }
}

/// Allocate a fresh pty pair with the given dimensions.
pub fn open(cols: u16, rows: u16) -> anyhow::Result<(OwnedFd, OwnedFd)> {
    let pair = nix::pty::openpty(Some(&winsize(cols, rows)), None).context("opening pty pair")?;
    Ok((pair.master, pair.slave))
}

/// Change the window size of the pty behind `master`. The kernel
/// raises SIGWINCH in the child's process group for us.
pub fn resize(master: &OwnedFd, cols: u16, rows: u16) -> anyhow::Result<()> {
    let size = winsize(cols, rows);
    // Safety: size is stack allocated and live for the whole call.
    unsafe {
        tiocswinsz(master.as_raw_fd(), &size).context("setting pty size")?;
    }
    Ok(())
}

/// Duplicate `fd` into an async file handle. Reads and writes on the
/// result run on the blocking pool, which is what we want for a pty
/// fd that stays in blocking mode.
pub fn dup_async_file(fd: &OwnedFd) -> anyhow::Result<tokio::fs::File> {
    let raw = unsafe { libc::dup(fd.as_raw_fd()) };
    if raw < 0 {
        return Err(io::Error::last_os_error()).context("duplicating pty fd");
    }
    // Safety: raw is a freshly dup'd descriptor that we own.
    let file = unsafe { std::fs::File::from_raw_fd(raw) };
    Ok(tokio::fs::File::from_std(file))
}

/// Build the three stdio handles for a child from the slave end.
pub fn child_stdio(slave: &OwnedFd) -> anyhow::Result<(Stdio, Stdio, Stdio)> {
    let stdin = Stdio::from(slave.try_clone().context("cloning slave for stdin")?);
    let stdout = Stdio::from(slave.try_clone().context("cloning slave for stdout")?);
    let stderr = Stdio::from(slave.try_clone().context("cloning slave for stderr")?);
    Ok((stdin, stdout, stderr))
}

/// Make the child a session leader with the pty as its controlling
/// terminal. Must run between fork and exec.
///
/// Safety: only async-signal-safe calls, per pre_exec's contract.
pub fn set_controlling_tty() -> io::Result<()> {
    // Safety: setsid and ioctl are async-signal-safe; fd 0 is the
    // pty slave because the child's stdio was wired to it.
    unsafe {
        if libc::setsid() < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::ioctl(0, libc::TIOCSCTTY as libc::c_ulong, 0) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

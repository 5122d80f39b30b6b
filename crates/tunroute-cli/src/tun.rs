//! Adopts the tun descriptor handed to us by whoever created and configured the interface.

use std::fs::File;

use anyhow::{bail, Context};

#[cfg(unix)]
#[allow(unsafe_code)]
pub fn adopt_fd(fd: i32) -> anyhow::Result<File> {
    use std::io;
    use std::os::fd::FromRawFd;

    if fd < 0 {
        bail!("invalid tun descriptor {fd}");
    }

    // SAFETY: fcntl only inspects and updates the flags of `fd`; an invalid descriptor fails
    // with EBADF, which we report before taking ownership.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error()).context(format!("tun descriptor {fd}"));
    }
    // The device threads poll for shutdown between reads, so reads must not park in the kernel.
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error()).context("set tun descriptor non-blocking");
    }

    // SAFETY: the descriptor is open (F_GETFL succeeded) and was handed to this process for its
    // exclusive use; nothing else closes it.
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[cfg(not(unix))]
pub fn adopt_fd(fd: i32) -> anyhow::Result<File> {
    bail!("tun descriptor {fd}: file descriptors are only supported on unix")
}

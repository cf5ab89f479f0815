//! Stdio descriptor sanitization.
//!
//! If the process starts with fd 0, 1 or 2 closed, the next `open()` hands
//! out a stdio number and every later print scribbles over that file. For a
//! filesystem daemon that file could be the backing store. Call
//! [`ensure_std_fds`] in `main` before any other I/O.

use std::io;

use tracing::debug;

/// Point any closed fd in {0, 1, 2} at `/dev/null`.
pub fn ensure_std_fds() -> io::Result<()> {
    for fd in 0..=2 {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags != -1 {
            continue;
        }
        let errno = io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::EBADF) {
            return Err(errno);
        }
        let null = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) };
        if null == -1 {
            return Err(io::Error::last_os_error());
        }
        if null != fd {
            // A lower fd was already filled in a previous iteration; move
            // the descriptor where it belongs.
            let rc = unsafe { libc::dup2(null, fd) };
            let dup_err = io::Error::last_os_error();
            unsafe { libc::close(null) };
            if rc == -1 {
                return Err(dup_err);
            }
        }
        debug!(fd, "redirected closed stdio descriptor to /dev/null");
    }
    Ok(())
}

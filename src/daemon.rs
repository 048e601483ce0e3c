//! Detaching from the controlling terminal.

use std::io;

/// Which side of the fork we ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent { child: libc::pid_t },
    Child,
}

/// Fork, start a new session in the child and move it to `/`.
///
/// Must run before any thread is spawned: only the calling thread survives
/// in the child.
pub fn detach() -> io::Result<Fork> {
    // SAFETY: no other threads exist yet, so the child's copy of the address
    // space holds no locks owned by threads that vanished in the fork.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            // SAFETY: plain syscall without pointer arguments.
            if unsafe { libc::setsid() } == -1 {
                return Err(io::Error::last_os_error());
            }
            std::env::set_current_dir("/")?;
            Ok(Fork::Child)
        }
        child => Ok(Fork::Parent { child }),
    }
}

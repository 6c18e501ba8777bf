//! System call boundary.
//!
//! Every privileged or process-wide call made by the lifecycle goes through
//! [`SystemCalls`] so bootstrap and the event loop can run against a fake in
//! tests.

use std::io;
use std::net::ToSocketAddrs;
use std::path::Path;

use nix::errno::Errno;
use nix::poll::{PollFd, PollTimeout};
use nix::sys::signal::{SigHandler, Signal, signal};

/// Wrapper over the system calls used during bootstrap and in the event loop.
pub trait SystemCalls: Send + Sync {
    fn chroot(&self, path: &Path) -> nix::Result<()>;

    fn chdir(&self, path: &Path) -> nix::Result<()>;

    /// Returns true when the effective user is root.
    fn is_superuser(&self) -> bool;

    /// Clears the effective, permitted and inheritable capability sets.
    fn drop_capabilities(&self) -> nix::Result<()>;

    /// Sets no-new-privileges so dropped capabilities cannot be regained
    /// through exec.
    fn lock_capabilities(&self) -> nix::Result<()>;

    fn ignore_sigpipe(&self) -> nix::Result<()>;

    /// Resolves a host name, discarding the result.
    fn resolve_host(&self, host: &str) -> io::Result<()>;

    fn poll(&self, fds: &mut [PollFd<'_>], timeout: PollTimeout) -> nix::Result<i32>;
}

/// The real system calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct NixSystemCalls;

impl SystemCalls for NixSystemCalls {
    fn chroot(&self, path: &Path) -> nix::Result<()> {
        nix::unistd::chroot(path)
    }

    fn chdir(&self, path: &Path) -> nix::Result<()> {
        nix::unistd::chdir(path)
    }

    fn is_superuser(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn drop_capabilities(&self) -> nix::Result<()> {
        capabilities::clear()
    }

    fn lock_capabilities(&self) -> nix::Result<()> {
        capabilities::set_no_new_privs()
    }

    fn ignore_sigpipe(&self) -> nix::Result<()> {
        #[allow(unsafe_code)]
        // SAFETY: SigIgn installs no handler code.
        let previous = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) };
        previous.map(drop)
    }

    fn resolve_host(&self, host: &str) -> io::Result<()> {
        (host, 0).to_socket_addrs().map(drop)
    }

    fn poll(&self, fds: &mut [PollFd<'_>], timeout: PollTimeout) -> nix::Result<i32> {
        nix::poll::poll(fds, timeout)
    }
}

#[cfg(target_os = "linux")]
mod capabilities {
    use super::Errno;

    const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

    #[repr(C)]
    struct CapUserHeader {
        version: u32,
        pid: libc::c_int,
    }

    #[repr(C)]
    #[derive(Default, Clone, Copy)]
    struct CapUserData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }

    pub(super) fn clear() -> nix::Result<()> {
        let mut header = CapUserHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        // version 3 takes two 32-bit words per set
        let data = [CapUserData::default(); 2];

        #[allow(unsafe_code)]
        // SAFETY: header and data live across the call and match the layout
        // capset(2) expects for _LINUX_CAPABILITY_VERSION_3.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_capset,
                &mut header as *mut CapUserHeader,
                data.as_ptr(),
            )
        };
        Errno::result(ret).map(drop)
    }

    pub(super) fn set_no_new_privs() -> nix::Result<()> {
        nix::sys::prctl::set_no_new_privs()
    }
}

#[cfg(not(target_os = "linux"))]
mod capabilities {
    use super::Errno;

    pub(super) fn clear() -> nix::Result<()> {
        Err(Errno::ENOSYS)
    }

    pub(super) fn set_no_new_privs() -> nix::Result<()> {
        Err(Errno::ENOSYS)
    }
}

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::{
    mem::ManuallyDrop,
    os::unix::prelude::{AsRawFd, RawFd},
};

/// Represents owned file descriptor
pub struct Fd(RawFd);

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.as_raw()
    }
}

impl Fd {
    pub fn new(inner: RawFd) -> Self {
        Fd(inner)
    }

    pub fn as_raw(&self) -> RawFd {
        self.0
    }

    pub fn into_raw(self) -> RawFd {
        let this = ManuallyDrop::new(self);
        this.0
    }

    pub fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        nix::unistd::read(self.0, buf).map_err(cvt_error)
    }

    pub fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        nix::unistd::write(self.0, buf).map_err(cvt_error)
    }

    pub fn set_nonblocking(&self) -> nix::Result<()> {
        let flags = fcntl(self.0, FcntlArg::F_GETFL)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(self.0, FcntlArg::F_SETFL(flags)).map(drop)
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        nix::unistd::close(self.0).ok();
    }
}

pub(crate) fn cvt_error(n: nix::Error) -> std::io::Error {
    match n {
        nix::Error::Sys(sys) => std::io::Error::from_raw_os_error(sys as i32),
        other => std::io::Error::new(std::io::ErrorKind::Other, other),
    }
}

//! The controller side of the daemon: exact reads and all-or-nothing writes
//! on the connected socket, plus frame send/receive helpers.
//!
//! The socket is nonblocking so it can sit in the demultiplexer, but frame
//! boundaries are authoritative: once a header announces payload bytes the
//! daemon keeps reading until it has them, treating EOF mid-frame as fatal.

use crate::{
    error::Error,
    fd::Fd,
    proto::{encode_credit, Command, Header, Role, CREDIT_WIRE_LEN},
};
use std::{io::ErrorKind, os::unix::io::RawFd};

pub struct Conn {
    sock: Fd,
}

impl Conn {
    pub fn new(sock: Fd) -> Conn {
        Conn { sock }
    }

    pub fn as_raw(&self) -> RawFd {
        self.sock.as_raw()
    }

    /// Read exactly `buf.len()` bytes, spinning through would-block.
    pub fn read_exact(&self, buf: &mut [u8]) -> Result<(), Error> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.sock.read(&mut buf[filled..]) {
                Ok(0) => return Err(Error::ControllerGone),
                Ok(n) => filled += n,
                Err(err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) =>
                {
                    continue
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub fn write_all(&self, buf: &[u8]) -> Result<(), Error> {
        let mut sent = 0;
        while sent < buf.len() {
            match self.sock.write(&buf[sent..]) {
                Ok(0) => return Err(Error::ControllerGone),
                Ok(n) => sent += n,
                Err(err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) =>
                {
                    continue
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub fn recv_header(&self) -> Result<Header, Error> {
        let mut raw = [0u8; 4];
        self.read_exact(&mut raw)?;
        Ok(Header::from_bytes(raw))
    }

    pub fn send_header(&self, cmd: Command, id: u8, arg: u8, len: u8) -> Result<(), Error> {
        tracing::trace!(?cmd, id, arg, len, "emitting frame");
        self.write_all(
            &Header {
                cmd: cmd.encode(),
                id,
                arg,
                len,
            }
            .to_bytes(),
        )
    }

    /// ACK frame widening the peer's window on one stream.
    pub fn send_credit(&self, role: Role, id: u8, amount: u32) -> Result<(), Error> {
        self.send_header(Command::Ack(role), id, 0, CREDIT_WIRE_LEN)?;
        self.write_all(&encode_credit(amount))
    }
}

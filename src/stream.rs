//! Credit-controlled conduits between the controller socket and one child
//! pipe end.
//!
//! A stream is half duplex. Outbound streams (control, stdin) buffer
//! controller payloads in their ring and drain them into the child's pipe on
//! writable readiness; the window the controller sees is restored only after
//! bytes leave the ring. Inbound streams (stdout, stderr) buffer child
//! output and forward it to the controller, never exceeding the credit the
//! controller has granted.

use crate::{
    conn::Conn,
    error::Error,
    fd::Fd,
    poll::{Interest, Poller, Token},
    proto::{Command, Direction, Role, MAX_FRAME_DATA},
    ring::{RingBuffer, RING_CAPACITY},
};
use nix::fcntl::OFlag;
use std::{io::ErrorKind, os::unix::io::RawFd};

pub struct Stream {
    id: u8,
    role: Role,
    /// Daemon-side pipe end; None once closed.
    fd: Option<Fd>,
    /// Bytes the peer is currently willing to accept. For outbound streams
    /// the peer is the controller writing into our ring; for inbound streams
    /// it is the controller receiving forwarded output.
    credit: u32,
    /// Half-close requested, locally (pipe EOF) or by the controller.
    eof: bool,
    /// Whether our pipe end currently sits in the demultiplexer.
    registered: bool,
    ring: RingBuffer,
}

fn make_pipe() -> Result<(Fd, Fd), Error> {
    let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    Ok((Fd::new(read_end), Fd::new(write_end)))
}

impl Stream {
    /// Daemon-to-child conduit. Keeps the writable end, returns the readable
    /// end for the child, and immediately grants the controller the full
    /// ring as its window.
    pub fn outbound(id: u8, role: Role, conn: &Conn) -> Result<(Stream, Fd), Error> {
        debug_assert_eq!(role.direction(), Direction::Outbound);
        let (read_end, write_end) = make_pipe()?;
        write_end.set_nonblocking()?;
        let stream = Stream {
            id,
            role,
            fd: Some(write_end),
            credit: RING_CAPACITY as u32,
            eof: false,
            registered: false,
            ring: RingBuffer::new(),
        };
        conn.send_credit(role, id, RING_CAPACITY as u32)?;
        Ok((stream, read_end))
    }

    /// Child-to-controller conduit. Keeps the readable end, returns the
    /// writable end for the child. No credit until the controller grants
    /// some, but the pipe is watched right away so early output lands in
    /// the ring.
    pub fn inbound(id: u8, role: Role, poller: &Poller) -> Result<(Stream, Fd), Error> {
        debug_assert_eq!(role.direction(), Direction::Inbound);
        let (read_end, write_end) = make_pipe()?;
        read_end.set_nonblocking()?;
        let mut stream = Stream {
            id,
            role,
            fd: Some(read_end),
            credit: 0,
            eof: false,
            registered: false,
            ring: RingBuffer::new(),
        };
        stream.set_interest(true, poller)?;
        Ok((stream, write_end))
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(Fd::as_raw)
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    fn interest(&self) -> Interest {
        match self.role.direction() {
            Direction::Outbound => Interest::Writable,
            Direction::Inbound => Interest::Readable,
        }
    }

    /// Idempotent (de)registration of our pipe end.
    fn set_interest(&mut self, on: bool, poller: &Poller) -> Result<(), Error> {
        if on == self.registered {
            return Ok(());
        }
        let fd = match self.fd.as_ref() {
            Some(fd) => fd.as_raw(),
            None => return Ok(()),
        };
        if on {
            poller.register(
                fd,
                self.interest(),
                Token::Stream {
                    id: self.id,
                    role: self.role,
                },
            )?;
        } else {
            poller.deregister(fd)?;
        }
        self.registered = on;
        Ok(())
    }

    fn trace_state(&self, what: &str) {
        tracing::trace!(
            id = self.id,
            role = ?self.role,
            credit = self.credit,
            buffered = self.ring.count(),
            eof = self.eof,
            "{}",
            what
        );
    }

    /// Deregister, drop the descriptor, and forget any buffered bytes.
    fn close_now(&mut self, poller: &Poller) -> Result<(), Error> {
        self.set_interest(false, poller)?;
        self.fd = None;
        let leftover = self.ring.count();
        self.ring.pop(leftover);
        Ok(())
    }

    /// Close and tell the controller this inbound stream is finished.
    fn close_notify(&mut self, conn: &Conn, poller: &Poller) -> Result<(), Error> {
        if self.fd.is_none() {
            return Ok(());
        }
        self.close_now(poller)?;
        conn.send_header(Command::CloseStream(self.role), self.id, 0, 0)
    }

    /// Half-close. With `flush` the descriptor survives until buffered bytes
    /// have moved; without it they are dropped on the spot.
    pub fn close(&mut self, flush: bool, conn: &Conn, poller: &Poller) -> Result<(), Error> {
        self.eof = true;
        self.trace_state("close requested");
        if self.ring.is_empty() || !flush {
            match self.role.direction() {
                Direction::Outbound => self.close_now(poller)?,
                Direction::Inbound => self.close_notify(conn, poller)?,
            }
        }
        Ok(())
    }

    /// Teardown without controller notification; CLOSE_ACK covers the whole
    /// process.
    pub fn discard(&mut self, poller: &Poller) -> Result<(), Error> {
        self.eof = true;
        self.close_now(poller)
    }

    // ---- outbound: controller -> ring -> child pipe ----

    /// WRITE_* payload: pull exactly `len` bytes off the controller socket
    /// into the ring.
    pub fn accept_payload(&mut self, len: usize, conn: &Conn, poller: &Poller) -> Result<(), Error> {
        if self.eof || self.fd.is_none() {
            return Err(Error::WriteAfterClose {
                id: self.id,
                role: self.role,
            });
        }
        if len as u32 > self.credit {
            return Err(Error::CreditOverrun {
                id: self.id,
                role: self.role,
                len,
                credit: self.credit,
            });
        }
        let mut left = len;
        while left > 0 {
            let span = self.ring.writable_contiguous();
            let take = left.min(span.len());
            conn.read_exact(&mut span[..take])?;
            self.ring.push(take);
            left -= take;
        }
        self.credit -= len as u32;
        self.trace_state("queued controller payload");
        if !self.ring.is_empty() {
            self.set_interest(true, poller)?;
        }
        Ok(())
    }

    /// Writable readiness: drain the ring into the child pipe and hand the
    /// freed window back to the controller.
    pub fn on_writable(&mut self, conn: &Conn, poller: &Poller) -> Result<(), Error> {
        let mut drained = 0usize;
        let broken = loop {
            let span = self.ring.readable_contiguous();
            if span.is_empty() {
                break false;
            }
            let fd = match self.fd.as_ref() {
                Some(fd) => fd,
                None => break false,
            };
            match fd.write(span) {
                Ok(0) => break false,
                Ok(n) => {
                    self.ring.pop(n);
                    drained += n;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break false,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::BrokenPipe => break true,
                Err(err) => return Err(err.into()),
            }
        };
        if broken {
            // Child end is gone. The window for the unsent bytes is never
            // restored; the death itself reaches the controller as
            // EXIT_STATUS.
            tracing::debug!(
                id = self.id,
                role = ?self.role,
                discarded = self.ring.count(),
                "child pipe broke, discarding stream"
            );
            return self.discard(poller);
        }
        if drained > 0 {
            self.credit += drained as u32;
            conn.send_credit(self.role, self.id, drained as u32)?;
        }
        self.trace_state("drained into child pipe");
        if self.ring.is_empty() {
            self.set_interest(false, poller)?;
            if self.eof {
                self.close_now(poller)?;
            }
        }
        Ok(())
    }

    // ---- inbound: child pipe -> ring -> controller ----

    /// Readable readiness: pull child output into the ring, then forward
    /// whatever the controller's window allows.
    pub fn on_readable(&mut self, conn: &Conn, poller: &Poller) -> Result<(), Error> {
        loop {
            if self.ring.is_full() {
                break;
            }
            let fd = match self.fd.as_ref() {
                Some(fd) => fd,
                None => return Ok(()),
            };
            let span = self.ring.writable_contiguous();
            match fd.read(span) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => self.ring.push(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        self.trace_state("buffered child output");
        if self.credit > 0 && !self.ring.is_empty() {
            self.forward(conn, poller)?;
        }
        if self.eof && self.ring.is_empty() {
            return self.close_notify(conn, poller);
        }
        if self.eof || self.ring.is_full() {
            // Nothing another read could do right now; a full ring regains
            // interest once forwarding makes room.
            self.set_interest(false, poller)?;
        }
        Ok(())
    }

    /// ACK_*: the controller widened its receive window.
    pub fn grant_credit(&mut self, amount: u32, conn: &Conn, poller: &Poller) -> Result<(), Error> {
        debug_assert_eq!(self.role.direction(), Direction::Inbound);
        self.credit = self.credit.saturating_add(amount);
        self.trace_state("credit granted");
        if self.credit > 0 && !self.ring.is_empty() {
            self.forward(conn, poller)?;
        }
        if self.eof && self.ring.is_empty() {
            return self.close_notify(conn, poller);
        }
        if self.fd.is_some() && !self.eof && self.credit > 0 && !self.ring.is_full() {
            self.set_interest(true, poller)?;
        }
        Ok(())
    }

    /// Move up to min(buffered, credit) bytes to the controller, framed in
    /// chunks of at most 255 data bytes, each header followed by its whole
    /// payload.
    fn forward(&mut self, conn: &Conn, poller: &Poller) -> Result<(), Error> {
        let total = self.ring.count().min(self.credit as usize);
        let mut left = total;
        while left > 0 {
            let frame = left.min(MAX_FRAME_DATA);
            conn.send_header(Command::Write(self.role), self.id, 0, frame as u8)?;
            let mut body = frame;
            while body > 0 {
                let span = self.ring.readable_contiguous();
                let take = body.min(span.len());
                conn.write_all(&span[..take])?;
                self.ring.pop(take);
                body -= take;
            }
            left -= frame;
        }
        self.credit -= total as u32;
        self.trace_state("forwarded to controller");
        if self.credit == 0 {
            // Do not drain the pipe past what we can forward.
            self.set_interest(false, poller)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::decode_credit;
    use std::io::{Read, Write};
    use std::os::unix::{io::IntoRawFd, net::UnixStream};

    fn conn_pair() -> (Conn, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (Conn::new(Fd::new(ours.into_raw_fd())), theirs)
    }

    fn read_frame(peer: &mut UnixStream) -> (crate::proto::Header, Vec<u8>) {
        let mut raw = [0u8; 4];
        peer.read_exact(&mut raw).unwrap();
        let header = crate::proto::Header::from_bytes(raw);
        let mut payload = vec![0u8; header.len as usize];
        peer.read_exact(&mut payload).unwrap();
        (header, payload)
    }

    fn assert_quiet(peer: &mut UnixStream) {
        peer.set_nonblocking(true).unwrap();
        let mut probe = [0u8; 1];
        match peer.read(&mut probe) {
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            other => panic!("expected silence, got {:?}", other),
        }
        peer.set_nonblocking(false).unwrap();
    }

    #[test]
    fn outbound_grants_the_ring_then_restores_drained_bytes() {
        let (conn, mut peer) = conn_pair();
        let poller = Poller::new().unwrap();
        let (mut stream, child_end) = Stream::outbound(9, Role::Stdin, &conn).unwrap();

        let (header, payload) = read_frame(&mut peer);
        assert_eq!(header.cmd, Command::Ack(Role::Stdin).encode());
        assert_eq!(header.id, 9);
        assert_eq!(decode_credit(&payload), RING_CAPACITY as u32);

        peer.write_all(b"hello").unwrap();
        stream.accept_payload(5, &conn, &poller).unwrap();
        stream.on_writable(&conn, &poller).unwrap();

        let mut buf = [0u8; 5];
        let n = child_end.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        let (header, payload) = read_frame(&mut peer);
        assert_eq!(header.cmd, Command::Ack(Role::Stdin).encode());
        assert_eq!(decode_credit(&payload), 5);
        assert_quiet(&mut peer);
    }

    #[test]
    fn outbound_rejects_payload_beyond_the_window() {
        let (conn, mut peer) = conn_pair();
        let poller = Poller::new().unwrap();
        let (mut stream, _child_end) = Stream::outbound(1, Role::Ctrl, &conn).unwrap();
        read_frame(&mut peer);

        let chunk = [0u8; 255];
        for _ in 0..16 {
            peer.write_all(&chunk).unwrap();
            stream.accept_payload(255, &conn, &poller).unwrap();
        }
        // 4080 of 4096 consumed without a drain; one more full frame busts it
        match stream.accept_payload(255, &conn, &poller) {
            Err(Error::CreditOverrun { credit, .. }) => assert_eq!(credit, 16),
            other => panic!("expected credit overrun, got {:?}", other),
        }
    }

    #[test]
    fn outbound_write_after_close_is_fatal() {
        let (conn, mut peer) = conn_pair();
        let poller = Poller::new().unwrap();
        let (mut stream, _child_end) = Stream::outbound(1, Role::Stdin, &conn).unwrap();
        read_frame(&mut peer);

        stream.close(true, &conn, &poller).unwrap();
        assert!(!stream.is_open());
        match stream.accept_payload(1, &conn, &poller) {
            Err(Error::WriteAfterClose { .. }) => {}
            other => panic!("expected write-after-close, got {:?}", other),
        }
    }

    #[test]
    fn outbound_flush_close_waits_for_the_drain() {
        let (conn, mut peer) = conn_pair();
        let poller = Poller::new().unwrap();
        let (mut stream, child_end) = Stream::outbound(2, Role::Ctrl, &conn).unwrap();
        read_frame(&mut peer);

        peer.write_all(b"cmd").unwrap();
        stream.accept_payload(3, &conn, &poller).unwrap();
        stream.close(true, &conn, &poller).unwrap();
        assert!(stream.is_open());

        stream.on_writable(&conn, &poller).unwrap();
        assert!(!stream.is_open());
        let mut buf = [0u8; 8];
        assert_eq!(child_end.read(&mut buf).unwrap(), 3);
        // drained to EOF now that the daemon end is gone
        assert_eq!(child_end.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn inbound_forwards_only_granted_credit() {
        let (conn, mut peer) = conn_pair();
        let poller = Poller::new().unwrap();
        let (mut stream, child_end) = Stream::inbound(4, Role::Stdout, &poller).unwrap();

        child_end.write(&[b'a'; 300]).unwrap();
        stream.on_readable(&conn, &poller).unwrap();
        assert_quiet(&mut peer);

        stream.grant_credit(280, &conn, &poller).unwrap();
        let (header, payload) = read_frame(&mut peer);
        assert_eq!(header.cmd, Command::Write(Role::Stdout).encode());
        assert_eq!(payload.len(), MAX_FRAME_DATA);
        assert!(payload.iter().all(|b| *b == b'a'));
        let (_, payload) = read_frame(&mut peer);
        assert_eq!(payload.len(), 25);
        assert_quiet(&mut peer);

        stream.grant_credit(100, &conn, &poller).unwrap();
        let (_, payload) = read_frame(&mut peer);
        assert_eq!(payload.len(), 20);
        assert_quiet(&mut peer);
    }

    #[test]
    fn inbound_eof_drains_then_closes() {
        let (conn, mut peer) = conn_pair();
        let poller = Poller::new().unwrap();
        let (mut stream, child_end) = Stream::inbound(6, Role::Stderr, &poller).unwrap();

        child_end.write(b"bye").unwrap();
        drop(child_end);
        stream.on_readable(&conn, &poller).unwrap();
        // no credit yet: stream holds the bytes and stays open
        assert!(stream.is_open());
        assert_quiet(&mut peer);

        stream.grant_credit(10, &conn, &poller).unwrap();
        let (header, payload) = read_frame(&mut peer);
        assert_eq!(header.cmd, Command::Write(Role::Stderr).encode());
        assert_eq!(payload, b"bye");
        let (header, _) = read_frame(&mut peer);
        assert_eq!(header.cmd, Command::CloseStream(Role::Stderr).encode());
        assert_eq!(header.id, 6);
        assert!(!stream.is_open());
    }

    #[test]
    fn inbound_ack_batching_is_immaterial() {
        let (conn, mut peer) = conn_pair();
        let poller = Poller::new().unwrap();
        let (mut stream, child_end) = Stream::inbound(5, Role::Stdout, &poller).unwrap();

        child_end.write(&[b'x'; 64]).unwrap();
        stream.on_readable(&conn, &poller).unwrap();

        let mut forwarded = 0;
        for grant in &[1u32, 2, 61] {
            stream.grant_credit(*grant, &conn, &poller).unwrap();
            let (_, payload) = read_frame(&mut peer);
            forwarded += payload.len();
        }
        assert_eq!(forwarded, 64);
        assert_quiet(&mut peer);
    }
}

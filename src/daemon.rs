//! The daemon singleton and its event loop.
//!
//! Single-threaded and cooperative: the only suspension point is the
//! demultiplexer wait. Handlers never block on pipes; the short header and
//! payload reads on the (trusted) controller socket are the one exception.

use crate::{
    bootstrap,
    conn::Conn,
    error::Error,
    fd::Fd,
    poll::{Event, Interest, Poller, Token},
    process::{ChildEnds, Process, ProcessTable},
    proto::{decode_credit, Command, Direction, Role, MAX_FRAME_DATA},
};
use nix::{
    sys::{
        signal::{self, SigSet, SigmaskHow, Signal},
        signalfd::{SfdFlags, SignalFd},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{fork, ForkResult, Pid},
};
use std::{convert::TryFrom, os::unix::io::AsRawFd};

const EVENT_BATCH: usize = 16;

/// Everything the event loop owns: the controller connection, the poller,
/// the SIGCHLD descriptor, and the process table.
pub struct Daemon {
    conn: Conn,
    poller: Poller,
    sigfd: SignalFd,
    sig_mask: SigSet,
    table: ProcessTable,
}

impl Daemon {
    /// Takes ownership of the connected controller socket.
    pub fn new(sock: Fd) -> Result<Daemon, Error> {
        sock.set_nonblocking()?;
        let poller = Poller::new()?;
        poller.register(sock.as_raw(), Interest::Readable, Token::Controller)?;

        // SIGCHLD arrives through a descriptor instead of a handler.
        // SIGPIPE is blocked too, so writes to a dead child's pipe surface
        // as EPIPE rather than killing the daemon.
        let mut reap_mask = SigSet::empty();
        reap_mask.add(Signal::SIGCHLD);
        let mut sig_mask = reap_mask;
        sig_mask.add(Signal::SIGPIPE);
        signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&sig_mask), None)?;
        let sigfd = SignalFd::with_flags(
            &reap_mask,
            SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC,
        )?;
        poller.register(sigfd.as_raw_fd(), Interest::Readable, Token::Reaper)?;

        Ok(Daemon {
            conn: Conn::new(sock),
            poller,
            sigfd,
            sig_mask,
            table: ProcessTable::new(),
        })
    }

    /// Run until the controller resets the daemon. Returning an error is
    /// fatal; the caller maps it to a nonzero exit.
    pub fn run(&mut self) -> Result<(), Error> {
        let mut events = vec![Event::empty(); EVENT_BATCH];
        loop {
            let ready = self.poller.wait(&mut events)?;
            for event in &events[..ready] {
                match Token::unpack(event.data()) {
                    Some(Token::Controller) => {
                        if self.handle_frame()? {
                            tracing::info!("controller requested reset");
                            return Ok(());
                        }
                    }
                    Some(Token::Reaper) => self.reap_children()?,
                    Some(Token::Stream { id, role }) => self.handle_stream_event(id, role)?,
                    None => unreachable!("corrupt demultiplexer token"),
                }
            }
        }
    }

    /// Readiness on a stream's pipe end. The slot may have vanished earlier
    /// in the same event batch, so a stale token is ignored.
    fn handle_stream_event(&mut self, id: u8, role: Role) -> Result<(), Error> {
        let Daemon {
            conn,
            poller,
            table,
            ..
        } = self;
        let process = match table.get_mut(id) {
            Some(process) => process,
            None => return Ok(()),
        };
        let stream = process.stream_mut(role);
        if !stream.is_open() {
            return Ok(());
        }
        match role.direction() {
            Direction::Outbound => stream.on_writable(conn, poller),
            Direction::Inbound => stream.on_readable(conn, poller),
        }
    }

    /// One controller frame: the 4-byte header, then whatever payload the
    /// command defines. Returns true on RESET.
    fn handle_frame(&mut self) -> Result<bool, Error> {
        let header = self.conn.recv_header()?;
        let cmd = Command::decode(header.cmd).ok_or(Error::UnknownCommand { cmd: header.cmd })?;
        tracing::debug!(
            ?cmd,
            id = header.id,
            arg = header.arg,
            len = header.len,
            "controller frame"
        );
        match cmd {
            Command::Reset => return Ok(true),
            Command::Open => self.handle_open(header.id)?,
            Command::Close => self.handle_close(header.id)?,
            Command::Kill => self.handle_kill(header.id, header.arg)?,
            Command::Write(role) if role.direction() == Direction::Outbound => {
                let Daemon {
                    conn,
                    poller,
                    table,
                    ..
                } = self;
                let process = table.get_mut(header.id).ok_or(Error::NoSuchProcess {
                    cmd: header.cmd,
                    id: header.id,
                })?;
                process
                    .stream_mut(role)
                    .accept_payload(usize::from(header.len), conn, poller)?;
            }
            Command::Ack(role) if role.direction() == Direction::Inbound => {
                let mut raw = [0u8; MAX_FRAME_DATA];
                let width = usize::from(header.len);
                self.conn.read_exact(&mut raw[..width])?;
                let amount = decode_credit(&raw[..width]);
                let Daemon {
                    conn,
                    poller,
                    table,
                    ..
                } = self;
                let process = table.get_mut(header.id).ok_or(Error::NoSuchProcess {
                    cmd: header.cmd,
                    id: header.id,
                })?;
                process.stream_mut(role).grant_credit(amount, conn, poller)?;
            }
            Command::CloseStream(role) => {
                let Daemon {
                    conn,
                    poller,
                    table,
                    ..
                } = self;
                let process = table.get_mut(header.id).ok_or(Error::NoSuchProcess {
                    cmd: header.cmd,
                    id: header.id,
                })?;
                process.stream_mut(role).close(true, conn, poller)?;
            }
            // The remaining bands only ever travel daemon to controller.
            Command::Write(_) | Command::Ack(_) | Command::ExitStatus | Command::CloseAck => {
                return Err(Error::WrongDirection { cmd: header.cmd });
            }
        }
        Ok(false)
    }

    /// OPEN: allocate the four streams, fork, wire the child.
    fn handle_open(&mut self, id: u8) -> Result<(), Error> {
        if self.table.contains(id) {
            return Err(Error::SlotBusy { id });
        }
        let (process, child_ends) = Process::open(id, &self.conn, &self.poller)?;
        // Insert before forking so the sweep below covers this slot's
        // daemon-side descriptors too.
        self.table.insert(id, process);
        match unsafe { fork() }? {
            ForkResult::Child => self.exec_child(child_ends),
            ForkResult::Parent { child } => {
                drop(child_ends);
                let process = self.table.get_mut(id).expect("slot was just filled");
                process.set_pid(child.as_raw());
                tracing::info!(id, pid = child.as_raw(), "child forked");
            }
        }
        Ok(())
    }

    /// Forked child: shed every daemon descriptor, restore the signal mask,
    /// then bootstrap with only the four child-side pipe ends.
    fn exec_child(&self, ends: ChildEnds) -> ! {
        for process in self.table.iter() {
            for role in Role::ALL.iter() {
                if let Some(fd) = process.stream(*role).raw_fd() {
                    nix::unistd::close(fd).ok();
                }
            }
        }
        nix::unistd::close(self.conn.as_raw()).ok();
        nix::unistd::close(self.poller.as_raw()).ok();
        nix::unistd::close(self.sigfd.as_raw_fd()).ok();
        signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&self.sig_mask), None).ok();
        bootstrap::run(ends.ctrl, ends.stdin, ends.stdout, ends.stderr)
    }

    /// CLOSE: kill and reap if still live, tear down all four streams, free
    /// the slot, acknowledge.
    fn handle_close(&mut self, id: u8) -> Result<(), Error> {
        let mut process = self.table.remove(id).ok_or(Error::NoSuchProcess {
            cmd: Command::Close.encode(),
            id,
        })?;
        if process.pid() != 0 {
            let pid = Pid::from_raw(process.pid());
            signal::kill(pid, Signal::SIGKILL).ok();
            waitpid(pid, None).ok();
        }
        for role in Role::ALL.iter() {
            process.stream_mut(*role).discard(&self.poller)?;
        }
        drop(process);
        self.conn.send_header(Command::CloseAck, id, 255, 0)?;
        tracing::info!(id, "process slot closed");
        Ok(())
    }

    /// KILL: forward `signo` to the child if it is still alive. Unknown
    /// signal numbers and already-gone children are not errors.
    fn handle_kill(&mut self, id: u8, signo: u8) -> Result<(), Error> {
        let process = self.table.get_mut(id).ok_or(Error::NoSuchProcess {
            cmd: Command::Kill.encode(),
            id,
        })?;
        if process.pid() == 0 {
            return Ok(());
        }
        match Signal::try_from(i32::from(signo)) {
            Ok(sig) => {
                signal::kill(Pid::from_raw(process.pid()), sig).ok();
            }
            Err(_) => tracing::debug!(id, signo, "ignoring kill with unknown signal number"),
        }
        Ok(())
    }

    /// SIGCHLD readiness. Notifications coalesce, so the descriptor and the
    /// wait queue are drained independently: first every queued siginfo,
    /// then every reapable child.
    fn reap_children(&mut self) -> Result<(), Error> {
        loop {
            match self.sigfd.read_signal() {
                Ok(Some(info)) => {
                    if info.ssi_signo != Signal::SIGCHLD as u32 {
                        return Err(Error::UnexpectedSignal {
                            signo: info.ssi_signo,
                        });
                    }
                }
                Ok(None) => break,
                Err(err) => return Err(err.into()),
            }
        }
        loop {
            let status = match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => status,
                // No children at all: CLOSE may already have reaped them.
                Err(err) if err.as_errno() == Some(nix::errno::Errno::ECHILD) => break,
                Err(err) => return Err(err.into()),
            };
            let (pid, code) = match status {
                WaitStatus::Exited(pid, status) => (pid, status as u8),
                WaitStatus::Signaled(pid, sig, _core) => (pid, sig as i32 as u8),
                WaitStatus::StillAlive => break,
                other => {
                    tracing::debug!(status = ?other, "ignoring wait status");
                    continue;
                }
            };
            let id = match self.table.find_by_pid(pid.as_raw()) {
                Some(id) => id,
                None => {
                    tracing::error!(pid = pid.as_raw(), "reaped a pid with no process slot");
                    continue;
                }
            };
            self.table
                .get_mut(id)
                .expect("find_by_pid returned a live slot")
                .clear_pid();
            self.conn.send_header(Command::ExitStatus, id, code, 0)?;
            tracing::info!(id, pid = pid.as_raw(), code, "child exited");
        }
        Ok(())
    }
}

//! Readiness demultiplexer: a thin epoll wrapper plus the typed token
//! stored in each registration's user data, so dispatch never chases raw
//! pointers.

use crate::{error::Error, fd::Fd, proto::Role};
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use std::os::unix::io::RawFd;

pub type Event = EpollEvent;

/// What a readiness event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// The controller socket has a frame (or part of one) for us.
    Controller,
    /// The SIGCHLD descriptor fired; children are waiting to be reaped.
    Reaper,
    /// One stream's pipe end is ready in its registered direction.
    Stream { id: u8, role: Role },
}

const TAG_CONTROLLER: u64 = 0;
const TAG_REAPER: u64 = 1;
const TAG_STREAM: u64 = 2;

impl Token {
    pub(crate) fn pack(self) -> u64 {
        match self {
            Token::Controller => TAG_CONTROLLER,
            Token::Reaper => TAG_REAPER,
            Token::Stream { id, role } => {
                TAG_STREAM | (u64::from(id) << 8) | (u64::from(role.index()) << 16)
            }
        }
    }

    pub(crate) fn unpack(data: u64) -> Option<Token> {
        match data & 0xff {
            TAG_CONTROLLER => Some(Token::Controller),
            TAG_REAPER => Some(Token::Reaper),
            TAG_STREAM => Role::from_index(((data >> 16) & 0xff) as u8).map(|role| Token::Stream {
                id: ((data >> 8) & 0xff) as u8,
                role,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Interest {
    Readable,
    Writable,
}

pub struct Poller {
    epfd: Fd,
}

impl Poller {
    pub fn new() -> Result<Poller, Error> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Poller { epfd: Fd::new(epfd) })
    }

    pub fn register(&self, fd: RawFd, interest: Interest, token: Token) -> Result<(), Error> {
        let flags = match interest {
            Interest::Readable => EpollFlags::EPOLLIN,
            Interest::Writable => EpollFlags::EPOLLOUT,
        };
        let mut event = EpollEvent::new(flags, token.pack());
        epoll_ctl(self.epfd.as_raw(), EpollOp::EpollCtlAdd, fd, &mut event)?;
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> Result<(), Error> {
        epoll_ctl(self.epfd.as_raw(), EpollOp::EpollCtlDel, fd, None)?;
        Ok(())
    }

    /// Block until at least one registration is ready.
    pub fn wait(&self, events: &mut [EpollEvent]) -> Result<usize, Error> {
        loop {
            match epoll_wait(self.epfd.as_raw(), events, -1) {
                Ok(n) => return Ok(n),
                Err(err) if err.as_errno() == Some(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn as_raw(&self) -> RawFd {
        self.epfd.as_raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip() {
        let tokens = [
            Token::Controller,
            Token::Reaper,
            Token::Stream {
                id: 0,
                role: Role::Ctrl,
            },
            Token::Stream {
                id: 255,
                role: Role::Stderr,
            },
        ];
        for token in tokens.iter() {
            assert_eq!(Token::unpack(token.pack()), Some(*token));
        }
        assert_eq!(Token::unpack(0xff), None);
    }
}

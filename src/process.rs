//! The record for one managed child and the fixed-capacity table the
//! controller addresses by one-byte id.

use crate::{conn::Conn, error::Error, fd::Fd, poll::Poller, proto::Role, stream::Stream};

pub type Pid = libc::pid_t;

/// One managed child: its pid (0 once reaped) and its four conduits.
pub struct Process {
    pid: Pid,
    ctrl: Stream,
    stdin: Stream,
    stdout: Stream,
    stderr: Stream,
}

/// The four child-side pipe ends a freshly forked child inherits.
pub struct ChildEnds {
    pub ctrl: Fd,
    pub stdin: Fd,
    pub stdout: Fd,
    pub stderr: Fd,
}

impl Process {
    /// Allocate the four streams for slot `id`. The pid is recorded by the
    /// caller once the fork succeeds.
    pub fn open(id: u8, conn: &Conn, poller: &Poller) -> Result<(Process, ChildEnds), Error> {
        let (ctrl, ctrl_child) = Stream::outbound(id, Role::Ctrl, conn)?;
        let (stdin, stdin_child) = Stream::outbound(id, Role::Stdin, conn)?;
        let (stdout, stdout_child) = Stream::inbound(id, Role::Stdout, poller)?;
        let (stderr, stderr_child) = Stream::inbound(id, Role::Stderr, poller)?;
        Ok((
            Process {
                pid: 0,
                ctrl,
                stdin,
                stdout,
                stderr,
            },
            ChildEnds {
                ctrl: ctrl_child,
                stdin: stdin_child,
                stdout: stdout_child,
                stderr: stderr_child,
            },
        ))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn set_pid(&mut self, pid: Pid) {
        self.pid = pid;
    }

    /// The slot stays live after the reaper runs; only the pid goes away.
    pub fn clear_pid(&mut self) {
        self.pid = 0;
    }

    pub fn stream(&self, role: Role) -> &Stream {
        match role {
            Role::Ctrl => &self.ctrl,
            Role::Stdin => &self.stdin,
            Role::Stdout => &self.stdout,
            Role::Stderr => &self.stderr,
        }
    }

    pub fn stream_mut(&mut self, role: Role) -> &mut Stream {
        match role {
            Role::Ctrl => &mut self.ctrl,
            Role::Stdin => &mut self.stdin,
            Role::Stdout => &mut self.stdout,
            Role::Stderr => &mut self.stderr,
        }
    }
}

pub const TABLE_SIZE: usize = 256;

/// At most one live process per id; a slot is occupied from OPEN until the
/// matching CLOSE.
pub struct ProcessTable {
    slots: Vec<Option<Process>>,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        ProcessTable {
            slots: (0..TABLE_SIZE).map(|_| None).collect(),
        }
    }

    pub fn contains(&self, id: u8) -> bool {
        self.slots[usize::from(id)].is_some()
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Process> {
        self.slots[usize::from(id)].as_mut()
    }

    pub fn insert(&mut self, id: u8, process: Process) {
        let slot = &mut self.slots[usize::from(id)];
        assert!(slot.is_none(), "slot {} is occupied", id);
        *slot = Some(process);
    }

    pub fn remove(&mut self, id: u8) -> Option<Process> {
        self.slots[usize::from(id)].take()
    }

    /// Reverse lookup for the reaper; reaped slots (pid 0) never match.
    pub fn find_by_pid(&self, pid: Pid) -> Option<u8> {
        if pid == 0 {
            return None;
        }
        self.slots
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |p| p.pid == pid))
            .map(|idx| idx as u8)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter().filter_map(Option::as_ref)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        ProcessTable::new()
    }
}

use crate::proto::Role;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("controller closed the connection")]
    ControllerGone,
    #[error("system call failed in undesired fashion (error code {})", code)]
    Syscall { code: i32 },
    #[error("io error")]
    Io {
        #[from]
        cause: std::io::Error,
    },
    #[error("unknown command byte {:#04x}", cmd)]
    UnknownCommand { cmd: u8 },
    #[error("command {:#04x} only travels daemon to controller", cmd)]
    WrongDirection { cmd: u8 },
    #[error("command {:#04x} targets vacant process slot {}", cmd, id)]
    NoSuchProcess { cmd: u8, id: u8 },
    #[error("process slot {} is already in use", id)]
    SlotBusy { id: u8 },
    #[error("write to closed {:?} stream of process {}", role, id)]
    WriteAfterClose { id: u8, role: Role },
    #[error(
        "{} payload bytes exceed the remaining window of {} (process {}, {:?})",
        len,
        credit,
        id,
        role
    )]
    CreditOverrun {
        id: u8,
        role: Role,
        len: usize,
        credit: u32,
    },
    #[error("unexpected signal {} on the signal descriptor", signo)]
    UnexpectedSignal { signo: u32 },
    #[error("unknown error")]
    Unknown,
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        if let Some(errno) = err.as_errno() {
            Error::Syscall { code: errno as i32 }
        } else {
            Error::Unknown
        }
    }
}

//! The forked-child code path: read the NUL-separated command from the
//! control pipe, rewire stdio onto the daemon-created pipes, exec.
//!
//! Runs between fork and exec, after the daemon's own descriptors have been
//! closed. Failures here cannot reach the controller in band, so they go to
//! stderr (the pipe, once it is wired) and the child exits nonzero; the
//! controller observes the failure as EXIT_STATUS.

use crate::fd::Fd;
use std::{ffi::CString, io::ErrorKind, process};

/// Command buffer cap; one byte stays reserved the way the wire peer
/// expects, so at most 1023 command bytes are honored.
const COMMAND_CAPACITY: usize = 1024;
/// At most this many argv entries; the rest of the buffer is ignored.
const ARGV_CAPACITY: usize = 255;

pub(crate) fn run(ctrl: Fd, stdin: Fd, stdout: Fd, stderr: Fd) -> ! {
    let mut command = [0u8; COMMAND_CAPACITY];
    let mut total = 0;
    while total < COMMAND_CAPACITY - 1 {
        match ctrl.read(&mut command[total..COMMAND_CAPACITY - 1]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => die(&format!("reading command from control pipe: {}", err)),
        }
    }
    drop(ctrl);

    for (end, target) in &[(&stdin, 0), (&stdout, 1), (&stderr, 2)] {
        if let Err(err) = nix::unistd::dup2(end.as_raw(), *target) {
            die(&format!("wiring child stdio: {}", err));
        }
    }
    drop(stdin);
    drop(stdout);
    drop(stderr);

    // Every NUL ends one argument and starts the next, so a trailing NUL
    // yields a trailing empty argument.
    let mut argv: Vec<CString> = Vec::new();
    for part in command[..total].split(|&b| b == 0) {
        if argv.len() == ARGV_CAPACITY {
            break;
        }
        argv.push(CString::new(part).expect("split leaves no interior NULs"));
    }
    let program = match argv.first() {
        Some(name) if !name.as_bytes().is_empty() => name.clone(),
        _ => die("empty command"),
    };

    nix::unistd::execvp(&program, &argv).ok();
    let err = errno::errno();
    die(&format!(
        "exec of {:?} failed (error {}): {}",
        program, err.0, err
    ));
}

fn die(msg: &str) -> ! {
    eprintln!("procmuxd child: {}", msg);
    process::exit(1);
}

use anyhow::Context;
use clap::{App, Arg};
use procmuxd::{Daemon, Fd};
use std::{
    ffi::OsStr,
    os::unix::{io::IntoRawFd, net::UnixStream},
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let matches = App::new("procmuxd")
        .about("multiplexes child process lifecycle and stdio over a controller socket")
        .arg(
            Arg::with_name("socket")
                .help("path of the controller's unix domain socket")
                .required(true),
        )
        .get_matches();
    let path = matches.value_of_os("socket").expect("argument is required");
    if let Err(err) = run(path) {
        tracing::error!("fatal: {:#}", err);
        std::process::exit(1);
    }
}

fn run(path: &OsStr) -> anyhow::Result<()> {
    let sock = UnixStream::connect(path)
        .with_context(|| format!("connecting to controller socket {:?}", path))?;
    let mut daemon = Daemon::new(Fd::new(sock.into_raw_fd()))?;
    daemon.run()?;
    tracing::info!("clean shutdown");
    Ok(())
}

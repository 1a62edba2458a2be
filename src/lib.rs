/*!
 * procmuxd multiplexes the lifecycle and stdio of many child processes over
 * a single controller connection.
 *
 * The controller speaks a small framed protocol: it opens numbered process
 * slots, feeds each one a command line and stdin bytes, and receives stdout
 * and stderr bytes back, all gated by per-stream credit so neither side
 * buffers without bound. The daemon forks and reaps the children and plumbs
 * every byte through fixed-size ring buffers driven by one epoll loop.
 */
mod bootstrap;
mod conn;
mod daemon;
mod error;
mod fd;
mod poll;
mod process;
mod proto;
mod ring;
mod stream;

pub use daemon::Daemon;
pub use error::Error;
pub use fd::Fd;
pub use proto::{
    decode_credit, encode_credit, Command, Direction, Header, Role, CREDIT_WIRE_LEN,
    MAX_FRAME_DATA,
};
pub use ring::{RingBuffer, RING_CAPACITY};

//! Privilege separation
//!
//! Sandboxed processes are often not allowed to spawn gpg. A task given a
//! [`PrivilegeSeparationChannel`] hands the prepared command line and input to
//! a helper, which runs gpg and streams the status channel back. Input and
//! output travel in chunks, so neither side buffers a whole message. Prompts are
//! still answered on the calling side.
//!
//! [`SocketChannel`] and [`HelperServer`] implement both ends over a Unix
//! socket; the `gpg-task-helper` binary wraps the server.

mod protocol;
#[cfg(unix)]
mod server;
#[cfg(unix)]
mod socket;
mod traits;

pub use protocol::{
    ClientMessage, DATA_CHUNK_SIZE, HelperMessage, LaunchRequest, OutputChannel, RemoteExit, RemoteFailure,
};
#[cfg(unix)]
pub use server::{HelperServer, run_with_shutdown};
#[cfg(unix)]
pub use socket::SocketChannel;
pub use traits::{PrivilegeSeparationChannel, RemoteRun};

//! FIFO naming convention.
//!
//! The server and its clients agree on two kinds of paths, both inside one
//! shared directory (`/tmp` by default):
//!
//! - the inbound channel, `<dir>/<name>`, created by the server;
//! - one private reply channel per client, `<dir>/<pid>.<tid>`, created by
//!   the client before it sends its request.

use std::path::{Path, PathBuf};

/// Directory used when none is configured.
pub const DEFAULT_FIFO_DIR: &str = "/tmp";

/// Path of the server's inbound channel.
pub fn inbound_channel_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

/// Path of the private reply channel for the given client identity.
pub fn reply_channel_path(dir: &Path, client_pid: i32, client_tid: u64) -> PathBuf {
    dir.join(format!("{client_pid}.{client_tid}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_channel_is_pid_dot_tid() {
        let path = reply_channel_path(Path::new("/tmp"), 4242, 139_812);
        assert_eq!(path, PathBuf::from("/tmp/4242.139812"));
    }

    #[test]
    fn inbound_channel_joins_name() {
        let path = inbound_channel_path(Path::new(DEFAULT_FIFO_DIR), "stalls");
        assert_eq!(path, PathBuf::from("/tmp/stalls"));
    }
}

//! Runtime placement: where the control socket and pid file live when no
//! explicit override is given. Kept separate from [`hatago_config::HubConfig`]
//! (the on-disk config schema) since process wiring and serialized config
//! have different lifetimes.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub fn default_socket_path() -> PathBuf {
    socket_path_from_runtime_dir(std::env::var("XDG_RUNTIME_DIR").ok().as_deref(), effective_uid())
}

pub fn pid_path_for_socket(socket_path: &Path) -> PathBuf {
    let mut buf: OsString = socket_path.as_os_str().to_owned();
    buf.push(".pid");
    PathBuf::from(buf)
}

fn effective_uid() -> u32 {
    crate::socket::current_uid()
}

fn socket_path_from_runtime_dir(runtime_dir: Option<&str>, uid: u32) -> PathBuf {
    if let Some(runtime_dir) = runtime_dir {
        return PathBuf::from(runtime_dir).join("hatago").join("hub.sock");
    }
    PathBuf::from("/tmp").join(format!("hatago-{uid}")).join("hub.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_path_prefers_xdg_runtime_dir() {
        let path = socket_path_from_runtime_dir(Some("/tmp/xdg-test"), 1000);
        assert_eq!(path, Path::new("/tmp/xdg-test/hatago/hub.sock"));
    }

    #[test]
    fn default_socket_path_falls_back_to_tmp_with_uid() {
        let path = socket_path_from_runtime_dir(None, 1001);
        let path_string = path.to_string_lossy();
        assert!(path_string.contains("/tmp/hatago-"));
        assert!(path_string.ends_with("/hub.sock"));
    }

    #[test]
    fn pid_path_appends_pid_suffix() {
        let socket = Path::new("/tmp/hatago-1000/hub.sock");
        let pid = pid_path_for_socket(socket);
        assert_eq!(pid, Path::new("/tmp/hatago-1000/hub.sock.pid"));
    }
}

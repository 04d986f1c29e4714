//! `PasswordServer`: one-time interactive password prompt relayed to child
//! `SSH_ASKPASS` helpers over a private Unix-domain socket (§4.4).

use std::cell::RefCell;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use pssh_core::PsshError;
use pssh_io::IoMap;
use tracing::{debug, warn};

/// Binds a private socket and services up to `limit` connections, handing
/// back the same password to each. Registered with `IoMap` so its
/// accept/write handling runs inside the event loop with no extra threads.
pub struct PasswordServer {
    listener: UnixListener,
    pub address: PathBuf,
    password: String,
    limit: usize,
    served: RefCell<usize>,
    dir: PathBuf,
}

impl PasswordServer {
    /// Prompts once on `/dev/tty`, then binds a mode-0700 private directory
    /// and a socket inside it (§4.4).
    pub fn start(limit: usize) -> Result<Self, PsshError> {
        let password = prompt_password("Password: ")?;
        Self::with_password(password, limit)
    }

    /// Constructs the server with a pre-supplied password, used directly by
    /// tests to avoid touching the controlling TTY.
    pub fn with_password(password: String, limit: usize) -> Result<Self, PsshError> {
        let dir = private_runtime_dir()?;
        let address = dir.join("askpass.sock");
        let listener = UnixListener::bind(&address)
            .map_err(|e| PsshError::SetupFailure(format!("failed to bind askpass socket: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| PsshError::SetupFailure(format!("failed to set askpass socket nonblocking: {e}")))?;
        Ok(Self {
            listener,
            address,
            password,
            limit,
            served: RefCell::new(0),
            dir,
        })
    }

    /// Registers the listening socket with `iomap`; each accepted connection
    /// is answered and closed synchronously since the payload (a password)
    /// is far smaller than the socket's send buffer (§4.4, §5).
    pub fn install(self: &Rc<Self>, iomap: &mut IoMap) {
        let fd = self.listener.as_raw_fd();
        let me = self.clone();
        iomap.register_read(
            fd,
            pssh_io::handler(move |_fd, _iomap| loop {
                match me.listener.accept() {
                    Ok((stream, _addr)) => me.serve(stream),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("askpass accept error: {e}");
                        break;
                    }
                }
            }),
        );
    }

    fn serve(&self, mut stream: UnixStream) {
        let mut served = self.served.borrow_mut();
        if *served >= self.limit {
            debug!("askpass connection limit reached, dropping connection");
            return;
        }
        *served += 1;
        drop(served);
        if let Err(e) = stream.write_all(self.password.as_bytes()) {
            warn!("askpass write failed: {e}");
        }
        let _ = stream.write_all(b"\n");
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }
}

impl Drop for PasswordServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.address);
        let _ = std::fs::remove_dir(&self.dir);
    }
}

/// Disambiguates concurrent `PasswordServer`s within one process: `std::process::id()`
/// alone collides whenever more than one instance (e.g. parallel `#[cfg(test)]` cases)
/// is alive at once in the same test binary.
static RUNTIME_DIR_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

fn private_runtime_dir() -> Result<PathBuf, PsshError> {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::Ordering;
    let unique = RUNTIME_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir().join(format!(
        "pssh-askpass-{}-{unique}",
        std::process::id()
    ));
    std::fs::create_dir_all(&base)
        .map_err(|e| PsshError::SetupFailure(format!("failed to create askpass runtime dir: {e}")))?;
    std::fs::set_permissions(&base, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| PsshError::SetupFailure(format!("failed to chmod askpass runtime dir: {e}")))?;
    Ok(base)
}

/// Reads a password from `/dev/tty` with echo disabled, the one-time
/// interactive prompt described in §4.4.
pub fn prompt_password(prompt: &str) -> Result<String, PsshError> {
    use nix::sys::termios::{self, LocalFlags, SetArg};
    use std::io::BufRead;

    let tty = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/tty")
        .map_err(|e| PsshError::SetupFailure(format!("no controlling tty for askpass: {e}")))?;

    let original = termios::tcgetattr(&tty).ok();
    if let Some(mut term) = original.clone() {
        term.local_flags.remove(LocalFlags::ECHO);
        let _ = termios::tcsetattr(&tty, SetArg::TCSANOW, &term);
    }

    let mut writer = &tty;
    let _ = writer.write_all(prompt.as_bytes());
    let _ = writer.flush();

    let mut reader = std::io::BufReader::new(&tty);
    let mut line = String::new();
    let read_result = reader.read_line(&mut line);

    if let Some(term) = original {
        let _ = termios::tcsetattr(&tty, SetArg::TCSANOW, &term);
    }
    let _ = writer.write_all(b"\n");

    read_result.map_err(|e| PsshError::SetupFailure(format!("failed to read password: {e}")))?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// Reads the helper's end of the protocol: connects to `socket_path` and
/// returns the password. Used by the `pssh-askpass-helper` binary, extracted
/// here so it's unit-testable without a subprocess.
pub fn fetch_password(socket_path: &Path) -> Result<String, PsshError> {
    use std::io::Read;
    let mut stream = UnixStream::connect(socket_path)
        .map_err(|e| PsshError::Fatal(format!("failed to connect to askpass socket: {e}")))?;
    let mut buf = String::new();
    stream
        .read_to_string(&mut buf)
        .map_err(|e| PsshError::Fatal(format!("failed to read from askpass socket: {e}")))?;
    Ok(buf.trim_end_matches(['\n', '\r']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_with_password_binds_socket() {
        let server = PasswordServer::with_password("hunter2".into(), 4).expect("server");
        assert!(server.address.exists());
    }

    #[test]
    fn test_serve_relays_password_and_closes() {
        let server = Rc::new(PasswordServer::with_password("hunter2".into(), 4).expect("server"));
        let mut iomap = IoMap::new().expect("iomap");
        server.install(&mut iomap);

        let address = server.address.clone();
        let handle = std::thread::spawn(move || fetch_password(&address));

        for _ in 0..50 {
            iomap.poll(Some(Duration::from_millis(20))).expect("poll");
            if handle.is_finished() {
                break;
            }
        }
        let password = handle.join().expect("thread join").expect("fetch");
        assert_eq!(password, "hunter2");
    }

    #[test]
    fn test_limit_caps_served_connections() {
        let server = Rc::new(PasswordServer::with_password("x".into(), 1).expect("server"));
        let mut iomap = IoMap::new().expect("iomap");
        server.install(&mut iomap);

        let a1 = server.address.clone();
        let h1 = std::thread::spawn(move || fetch_password(&a1));
        for _ in 0..50 {
            iomap.poll(Some(Duration::from_millis(20))).expect("poll");
            if h1.is_finished() {
                break;
            }
        }
        assert_eq!(h1.join().unwrap().unwrap(), "x");
        assert_eq!(*server.served.borrow(), 1);
    }

    #[test]
    fn test_drop_removes_socket_and_dir() {
        let address;
        let dir;
        {
            let server = PasswordServer::with_password("x".into(), 1).expect("server");
            address = server.address.clone();
            dir = server.dir.clone();
        }
        assert!(!address.exists());
        assert!(!dir.exists());
    }
}

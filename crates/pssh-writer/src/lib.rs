//! `Writer`: a dedicated background thread that owns every per-host output
//! file plus the optional JSON-lines export sink, so the event-loop thread
//! never blocks on disk I/O (§4.2).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;

use serde::Serialize;
use tracing::{debug, warn};

/// One completed task's record, exported as a line of JSON (§4.2, §9).
#[derive(Debug, Clone, Serialize)]
pub struct DoneRecord {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub sequence: usize,
    pub exit_status: i32,
    pub failure_reasons: Vec<String>,
    pub elapsed_secs: f64,
}

enum Payload {
    Open,
    Bytes(Vec<u8>),
    Eof,
}

enum Msg {
    File(PathBuf, Payload),
    Export(DoneRecord),
    Abort,
}

/// Handle used from the event-loop thread; the worker thread is joined when
/// dropped after `signal_quit`.
pub struct Writer {
    sender: Sender<Msg>,
    host_counts: Mutex<HashMap<String, u32>>,
    outdir: Option<PathBuf>,
    errdir: Option<PathBuf>,
    join_handle: OnceLock<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Writer {
    /// Spawns the worker thread. Returns `None` when neither `outdir`,
    /// `errdir`, nor `export_path` is configured — callers treat `None` as
    /// "no Writer running" (§4.2 contract: `open_files` is a no-op then).
    pub fn spawn(
        outdir: Option<PathBuf>,
        errdir: Option<PathBuf>,
        export_path: Option<PathBuf>,
    ) -> Option<Writer> {
        if outdir.is_none() && errdir.is_none() && export_path.is_none() {
            return None;
        }
        let (sender, receiver) = channel::<Msg>();
        let join_handle = std::thread::Builder::new()
            .name("pssh-writer".into())
            .spawn(move || {
                let mut files: HashMap<PathBuf, File> = HashMap::new();
                let mut export_file = export_path.as_ref().and_then(|p| {
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(p)
                        .inspect_err(|e| warn!("failed to open export file {p:?}: {e}"))
                        .ok()
                });
                loop {
                    match receiver.recv() {
                        Ok(Msg::Abort) | Err(_) => break,
                        Ok(Msg::File(path, Payload::Open)) => {
                            match OpenOptions::new().create(true).append(true).open(&path) {
                                Ok(f) => {
                                    if let Err(e) = set_cloexec(&f) {
                                        warn!("failed to set cloexec on {path:?}: {e}");
                                    }
                                    files.insert(path, f);
                                }
                                Err(e) => warn!("failed to open output file {path:?}: {e}"),
                            }
                        }
                        Ok(Msg::File(path, Payload::Bytes(data))) => {
                            if let Some(f) = files.get_mut(&path) {
                                if let Err(e) = f.write_all(&data) {
                                    warn!("write to {path:?} failed: {e}");
                                } else {
                                    let _ = f.flush();
                                }
                            }
                        }
                        Ok(Msg::File(path, Payload::Eof)) => {
                            files.remove(&path);
                        }
                        Ok(Msg::Export(record)) => {
                            if let Some(f) = export_file.as_mut() {
                                match serde_json::to_string(&record) {
                                    Ok(line) => {
                                        if let Err(e) = writeln!(f, "{line}") {
                                            warn!("export write failed: {e}");
                                        }
                                    }
                                    Err(e) => warn!("export serialize failed: {e}"),
                                }
                            }
                        }
                    }
                }
                debug!("writer thread draining remaining queue before exit");
            })
            .expect("failed to spawn writer thread");

        Some(Writer {
            sender,
            host_counts: Mutex::new(HashMap::new()),
            outdir,
            errdir,
            join_handle: OnceLock::new(),
            handle: Mutex::new(Some(join_handle)),
        })
    }

    /// Computes deterministic filenames for `host` and enqueues OPEN for
    /// each configured directory (§4.2).
    pub fn open_files(&self, host: &str) -> (Option<PathBuf>, Option<PathBuf>) {
        if self.outdir.is_none() && self.errdir.is_none() {
            return (None, None);
        }
        let mut counts = self.host_counts.lock().expect("host_counts poisoned");
        let count = *counts.get(host).unwrap_or(&0);
        counts.insert(host.to_string(), count + 1);
        drop(counts);

        let filename = if count == 0 {
            host.to_string()
        } else {
            format!("{host}.{count}")
        };

        let outfile = self.outdir.as_ref().map(|dir| dir.join(&filename));
        let errfile = self.errdir.as_ref().map(|dir| dir.join(&filename));
        if let Some(p) = &outfile {
            let _ = self.sender.send(Msg::File(p.clone(), Payload::Open));
        }
        if let Some(p) = &errfile {
            let _ = self.sender.send(Msg::File(p.clone(), Payload::Open));
        }
        (outfile, errfile)
    }

    pub fn write(&self, filename: &Path, data: Vec<u8>) {
        let _ = self
            .sender
            .send(Msg::File(filename.to_path_buf(), Payload::Bytes(data)));
    }

    pub fn close(&self, filename: &Path) {
        let _ = self
            .sender
            .send(Msg::File(filename.to_path_buf(), Payload::Eof));
    }

    pub fn export_done(&self, record: DoneRecord) {
        let _ = self.sender.send(Msg::Export(record));
    }

    pub fn signal_quit(&self) {
        let _ = self.sender.send(Msg::Abort);
    }

    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().expect("handle poisoned").take() {
            let _ = handle.join();
        }
    }
}

fn set_cloexec(f: &File) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    pssh_io::set_cloexec(f.as_raw_fd()).map_err(|e| std::io::Error::other(e.to_string()))
}

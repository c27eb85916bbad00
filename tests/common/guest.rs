use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use embermesh::agent::{ExecHandle, ExecStatus, FileStat, GuestAgent, GuestError};

#[derive(Clone, Debug)]
pub struct GuestFile {
    pub bytes: Vec<u8>,
    pub executable: bool,
    pub mtime_ms: i64,
}

/// One recorded program dispatch.
#[derive(Clone, Debug)]
pub struct ExecRecord {
    pub path: String,
    pub args: String,
    pub at: Instant,
}

/// In-memory guest-agent double.
///
/// Program behavior is scripted per executable path: each dispatch pops
/// the next exit code from that path's queue (the last code repeats once
/// the queue empties). Ping failures can be injected to exercise the
/// reconnect backoff.
pub struct FakeGuest {
    files: Mutex<HashMap<String, GuestFile>>,
    scripted: Mutex<HashMap<String, VecDeque<i32>>>,
    running: Mutex<HashMap<u64, i32>>,
    executed: Mutex<Vec<ExecRecord>>,
    next_handle: AtomicU64,
    clock_ms: AtomicI64,
    fail_pings: AtomicU32,
}

impl Default for FakeGuest {
    fn default() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            clock_ms: AtomicI64::new(1),
            fail_pings: AtomicU32::new(0),
        }
    }
}

impl FakeGuest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the exit codes returned by successive dispatches of `path`.
    pub fn script_program(&self, path: &str, exit_codes: &[i32]) {
        self.scripted
            .lock()
            .unwrap()
            .insert(path.to_string(), exit_codes.iter().copied().collect());
    }

    /// Make the next `count` pings fail with a timeout.
    pub fn fail_next_pings(&self, count: u32) {
        self.fail_pings.store(count, Ordering::SeqCst);
    }

    /// Seed a file into the guest filesystem.
    pub fn seed_file(&self, path: &str, bytes: &[u8]) {
        let mtime_ms = self.tick();
        self.files.lock().unwrap().insert(
            path.to_string(),
            GuestFile {
                bytes: bytes.to_vec(),
                executable: false,
                mtime_ms,
            },
        );
    }

    pub fn file(&self, path: &str) -> Option<GuestFile> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn executed(&self) -> Vec<ExecRecord> {
        self.executed.lock().unwrap().clone()
    }

    pub fn executed_paths(&self) -> Vec<String> {
        self.executed().into_iter().map(|r| r.path).collect()
    }

    fn tick(&self) -> i64 {
        self.clock_ms.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl GuestAgent for FakeGuest {
    async fn ping(&self) -> Result<(), GuestError> {
        let remaining = self.fail_pings.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_pings.store(remaining - 1, Ordering::SeqCst);
            return Err(GuestError::Timeout { capability: "ping" });
        }
        Ok(())
    }

    async fn sync(&self) -> Result<(), GuestError> {
        Ok(())
    }

    async fn file_write(
        &self,
        path: &str,
        bytes: &[u8],
        executable: bool,
    ) -> Result<(), GuestError> {
        let mtime_ms = self.tick();
        self.files.lock().unwrap().insert(
            path.to_string(),
            GuestFile {
                bytes: bytes.to_vec(),
                executable,
                mtime_ms,
            },
        );
        Ok(())
    }

    async fn file_read(&self, path: &str) -> Result<Vec<u8>, GuestError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|file| file.bytes.clone())
            .ok_or_else(|| GuestError::Io {
                message: format!("no such file: {path}"),
            })
    }

    async fn file_stat(&self, path: &str) -> Result<FileStat, GuestError> {
        Ok(match self.files.lock().unwrap().get(path) {
            Some(file) => FileStat {
                exists: true,
                mtime_ms: file.mtime_ms,
                size: file.bytes.len() as u64,
            },
            None => FileStat::default(),
        })
    }

    async fn file_remove(&self, path: &str) -> Result<(), GuestError> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn exec(&self, path: &str, args: &str) -> Result<ExecHandle, GuestError> {
        self.executed.lock().unwrap().push(ExecRecord {
            path: path.to_string(),
            args: args.to_string(),
            at: Instant::now(),
        });
        let exit_code = {
            let mut scripted = self.scripted.lock().unwrap();
            match scripted.get_mut(path) {
                Some(codes) => {
                    if codes.len() > 1 {
                        codes.pop_front().unwrap()
                    } else {
                        codes.front().copied().unwrap_or(0)
                    }
                }
                None => 0,
            }
        };
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.running.lock().unwrap().insert(handle, exit_code);
        Ok(ExecHandle(handle))
    }

    async fn exec_status(&self, handle: ExecHandle) -> Result<ExecStatus, GuestError> {
        let exit_code = self
            .running
            .lock()
            .unwrap()
            .get(&handle.0)
            .copied()
            .ok_or(GuestError::UnknownHandle { handle: handle.0 })?;
        Ok(ExecStatus {
            running: false,
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn reboot(&self) -> Result<(), GuestError> {
        Ok(())
    }
}

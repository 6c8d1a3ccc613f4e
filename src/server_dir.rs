//! The server directory: the on-disk identity of a daemon instance.
//!
//! A directory with mode `0700` holding the daemon's port file and its two
//! append-only sinks. Clients find a running daemon by reading the port
//! file; the mode check keeps other users from planting files in it.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::error::{Result, SlotdError};

const DIR_MODE: u32 = 0o700;
const PORT_FILE: &str = "port.txt";
const LOG_FILE: &str = "log.txt";
const ERR_FILE: &str = "err.txt";

#[derive(Debug, Clone)]
pub struct ServerDir {
    root: PathBuf,
}

impl ServerDir {
    /// Create the directory if it does not exist, then validate it. Safe to
    /// call on an existing server directory.
    pub fn create(path: &Path) -> Result<Self> {
        let mut builder = fs::DirBuilder::new();
        builder.mode(DIR_MODE);
        match builder.create(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(SlotdError::ServerDir {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        }
        Self::open(path)
    }

    /// Validate an existing server directory without creating anything.
    pub fn open(path: &Path) -> Result<Self> {
        let reject = |reason: String| SlotdError::ServerDir {
            path: path.to_path_buf(),
            reason,
        };
        let meta = fs::metadata(path).map_err(|e| reject(e.to_string()))?;
        if !meta.is_dir() {
            return Err(reject("not a directory".to_string()));
        }
        let mode = meta.permissions().mode() & 0o777;
        if mode != DIR_MODE {
            return Err(reject(format!("mode {mode:03o}, expected {DIR_MODE:03o}")));
        }
        Ok(Self {
            root: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Record the daemon's listening port for clients to find.
    pub fn write_port(&self, port: u16) -> Result<()> {
        let path = self.root.join(PORT_FILE);
        fs::write(&path, format!("{port}\n"))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    /// The port a running daemon wrote at startup.
    pub fn read_port(&self) -> Result<u16> {
        let path = self.root.join(PORT_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SlotdError::NoPort)
            }
            Err(e) => return Err(e.into()),
        };
        contents
            .trim()
            .parse()
            .map_err(|_| SlotdError::ServerDir {
                path,
                reason: format!("invalid port file contents {:?}", contents.trim()),
            })
    }

    /// Append handle to the main log sink.
    pub fn log_sink(&self) -> Result<File> {
        self.append_sink(LOG_FILE)
    }

    /// Append handle to the error sink.
    pub fn err_sink(&self) -> Result<File> {
        self.append_sink(ERR_FILE)
    }

    fn append_sink(&self, name: &str) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(name))?)
    }
}

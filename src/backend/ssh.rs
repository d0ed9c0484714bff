//! SFTP backend over an `ssh2` session.
//!
//! Only adapts the SFTP subsystem to `RemoteFs`; connecting and
//! authenticating is left to the caller (`connect` covers the common
//! agent-auth case).

use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ssh2::{ErrorCode, FileStat, OpenType, Session, Sftp};

use super::{Capabilities, Handle, RemoteFs};
use crate::error::{Result, StatusCode, SyncError};
use crate::file::{system_time_secs, FileKind, RemoteFile};
use crate::flags::OpenFlags;
use crate::path::{is_dot_entry, join};

fn from_ssh(path: &str, err: ssh2::Error) -> SyncError {
    let code = match err.code() {
        ErrorCode::SFTP(code) => StatusCode::from_code(code as u32),
        ErrorCode::Session(_) => StatusCode::Failure,
    };
    SyncError::status_msg(code, path, err.message().to_string())
}

fn stat_to_file(path: String, stat: &FileStat) -> RemoteFile {
    let perm = stat.perm.unwrap_or(0);
    let at = |secs: Option<u64>| UNIX_EPOCH + Duration::from_secs(secs.unwrap_or(0));
    RemoteFile::new(FileKind::from_mode(perm), path)
        .with_size(stat.size.unwrap_or(0))
        .with_modified(at(stat.mtime))
        .with_accessed(at(stat.atime))
        .with_owner(stat.uid.unwrap_or(0), stat.gid.unwrap_or(0))
        .with_permissions(perm)
}

fn empty_stat() -> FileStat {
    FileStat {
        size: None,
        uid: None,
        gid: None,
        perm: None,
        atime: None,
        mtime: None,
    }
}

pub struct Ssh2Backend {
    // Keeps the connection alive for as long as the SFTP channel is used.
    _session: Session,
    sftp: Sftp,
}

impl Ssh2Backend {
    pub fn new(session: Session) -> Result<Self> {
        let sftp = session.sftp().map_err(|e| from_ssh("sftp", e))?;
        Ok(Self {
            _session: session,
            sftp,
        })
    }

    /// Connect to `host:port` and authenticate `user` through the SSH agent.
    pub fn connect(host: &str, port: u16, user: &str) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let tcp = TcpStream::connect(&addr).map_err(|e| SyncError::io("connect", &addr, e))?;
        let mut session = Session::new().map_err(|e| from_ssh(&addr, e))?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| from_ssh(&addr, e))?;
        session.userauth_agent(user).map_err(|e| from_ssh(&addr, e))?;
        if !session.authenticated() {
            return Err(SyncError::status_msg(
                StatusCode::PermissionDenied,
                addr,
                "agent authentication failed",
            ));
        }
        tracing::info!("Connected to {} as {}", host, user);
        Self::new(session)
    }

    fn setstat(&self, path: &str, stat: FileStat) -> Result<()> {
        self.sftp
            .setstat(Path::new(path), stat)
            .map_err(|e| from_ssh(path, e))
    }

    fn raw_stat(&self, path: &str) -> Result<FileStat> {
        self.sftp.stat(Path::new(path)).map_err(|e| from_ssh(path, e))
    }
}

impl RemoteFs for Ssh2Backend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::RAW_HANDLES
            | Capabilities::SET_MOD_TIME
            | Capabilities::LSTAT
            | Capabilities::SYMLINKS
            | Capabilities::OWNERSHIP
    }

    fn default_path(&self) -> Result<String> {
        let home = self
            .sftp
            .realpath(Path::new("."))
            .map_err(|e| from_ssh(".", e))?;
        Ok(home.to_string_lossy().into_owned())
    }

    fn stat(&self, path: &str) -> Result<RemoteFile> {
        Ok(stat_to_file(path.to_string(), &self.raw_stat(path)?))
    }

    fn lstat(&self, path: &str) -> Result<RemoteFile> {
        let stat = self.sftp.lstat(Path::new(path)).map_err(|e| from_ssh(path, e))?;
        Ok(stat_to_file(path.to_string(), &stat))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<RemoteFile>> {
        let entries = self.sftp.readdir(Path::new(path)).map_err(|e| from_ssh(path, e))?;
        Ok(entries
            .into_iter()
            .filter_map(|(entry, stat)| {
                let name = entry.file_name()?.to_string_lossy().into_owned();
                (!is_dot_entry(&name)).then(|| stat_to_file(join(path, &name), &stat))
            })
            .collect())
    }

    fn open_handle(&self, path: &str, flags: OpenFlags, permissions: u32) -> Result<Box<dyn Handle>> {
        let mut mode = ssh2::OpenFlags::empty();
        for (ours, theirs) in [
            (OpenFlags::READ, ssh2::OpenFlags::READ),
            (OpenFlags::WRITE, ssh2::OpenFlags::WRITE),
            (OpenFlags::APPEND, ssh2::OpenFlags::APPEND),
            (OpenFlags::CREATE, ssh2::OpenFlags::CREATE),
            (OpenFlags::TRUNCATE, ssh2::OpenFlags::TRUNCATE),
            (OpenFlags::EXCLUSIVE, ssh2::OpenFlags::EXCLUSIVE),
        ] {
            if flags.contains(ours) {
                mode |= theirs;
            }
        }
        let file = self
            .sftp
            .open_mode(Path::new(path), mode, permissions as i32, OpenType::File)
            .map_err(|e| from_ssh(path, e))?;
        Ok(Box::new(SftpHandle {
            file: Some(file),
            path: path.to_string(),
            pos: 0,
        }))
    }

    fn mkdir(&self, path: &str, permissions: u32) -> Result<()> {
        self.sftp
            .mkdir(Path::new(path), permissions as i32)
            .map_err(|e| from_ssh(path, e))
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.sftp.unlink(Path::new(path)).map_err(|e| from_ssh(path, e))
    }

    fn remove_dir(&self, path: &str) -> Result<()> {
        self.sftp.rmdir(Path::new(path)).map_err(|e| from_ssh(path, e))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.sftp
            .rename(Path::new(from), Path::new(to), None)
            .map_err(|e| from_ssh(from, e))
    }

    fn chmod(&self, path: &str, permissions: u32) -> Result<()> {
        self.setstat(
            path,
            FileStat {
                perm: Some(permissions & 0o7777),
                ..empty_stat()
            },
        )
    }

    // SFTP v3 sets uid and gid together.
    fn chown(&self, path: &str, uid: u32) -> Result<()> {
        let current = self.raw_stat(path)?;
        self.setstat(
            path,
            FileStat {
                uid: Some(uid),
                gid: current.gid,
                ..empty_stat()
            },
        )
    }

    fn chgrp(&self, path: &str, gid: u32) -> Result<()> {
        let current = self.raw_stat(path)?;
        self.setstat(
            path,
            FileStat {
                uid: current.uid,
                gid: Some(gid),
                ..empty_stat()
            },
        )
    }

    fn set_mod_time(&self, path: &str, modified: SystemTime) -> Result<()> {
        let current = self.raw_stat(path)?;
        let mtime = system_time_secs(modified).max(0) as u64;
        self.setstat(
            path,
            FileStat {
                atime: current.atime.or(Some(mtime)),
                mtime: Some(mtime),
                ..empty_stat()
            },
        )
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let target = self.sftp.readlink(Path::new(path)).map_err(|e| from_ssh(path, e))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn symlink(&self, link: &str, target: &str) -> Result<()> {
        self.sftp
            .symlink(Path::new(link), Path::new(target))
            .map_err(|e| from_ssh(link, e))
    }
}

struct SftpHandle {
    file: Option<ssh2::File>,
    path: String,
    pos: u64,
}

impl SftpHandle {
    fn file_at_pos(&mut self) -> Result<&mut ssh2::File> {
        let pos = self.pos;
        let path = &self.path;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SyncError::status(StatusCode::InvalidHandle, path.clone()))?;
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| SyncError::from_io("seek", path, e))?;
        Ok(file)
    }
}

impl Handle for SftpHandle {
    fn position(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let path = self.path.clone();
        let file = self.file_at_pos()?;
        file.read(buf).map_err(|e| SyncError::from_io("read", path, e))
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let path = self.path.clone();
        let file = self.file_at_pos()?;
        file.write_all(buf).map_err(|e| SyncError::from_io("write", path, e))
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the file sends SSH_FXP_CLOSE.
        self.file.take();
        Ok(())
    }
}

use std::mem;
use std::os::unix::prelude::RawFd;

use nix::{
  errno::Errno,
  fcntl::{fcntl, FcntlArg, OFlag},
  unistd::{self, close, pipe2},
};

use crate::error::SnakeBoxError;

/// A pipe before fork; each side keeps exactly one end afterwards
pub struct SnakeBoxPipe(RawFd, RawFd);

/// Parent end, non-blocking
pub struct SnakeBoxReadPipe {
  fd: RawFd,
  eof: bool,
}

/// Child end, blocking
pub struct SnakeBoxWritePipe(RawFd);

impl SnakeBoxPipe {
  pub fn new() -> Result<Self, SnakeBoxError> {
    let result = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
    Ok(SnakeBoxPipe(result.0, result.1))
  }

  pub fn read(self) -> Result<SnakeBoxReadPipe, SnakeBoxError> {
    let (read, write) = self.into_fds();
    let pipe = SnakeBoxReadPipe {
      fd: read,
      eof: false,
    };
    close(write)?;
    Ok(pipe)
  }

  pub fn write(self) -> Result<SnakeBoxWritePipe, SnakeBoxError> {
    let (read, write) = self.into_fds();
    let pipe = SnakeBoxWritePipe(write);
    close(read)?;
    fcntl(write, FcntlArg::F_SETFL(OFlag::empty()))?;
    Ok(pipe)
  }

  fn into_fds(self) -> (RawFd, RawFd) {
    let fds = (self.0, self.1);
    mem::forget(self);
    fds
  }
}

impl Drop for SnakeBoxPipe {
  fn drop(&mut self) {
    let _ = close(self.0);
    let _ = close(self.1);
  }
}

impl SnakeBoxReadPipe {
  pub fn fd(&self) -> RawFd {
    self.fd
  }

  /// Whether the other end has been closed and everything was read
  pub fn is_eof(&self) -> bool {
    self.eof
  }

  /// Append everything currently buffered in the pipe, keeping at most `limit` bytes in `buf`
  pub fn read_available(&mut self, buf: &mut Vec<u8>, limit: usize) -> Result<usize, SnakeBoxError> {
    let mut chunk = [0u8; 4096];
    let mut total = 0;
    while !self.eof {
      match unistd::read(self.fd, &mut chunk) {
        Ok(0) => self.eof = true,
        Ok(size) => {
          total += size;
          let room = limit.saturating_sub(buf.len());
          buf.extend_from_slice(&chunk[..size.min(room)]);
        }
        Err(Errno::EINTR) => continue,
        Err(Errno::EAGAIN) => break,
        Err(errno) => return Err(errno.into()),
      }
    }
    Ok(total)
  }

  /// Read the single message of a write-once channel
  pub fn read_message(&mut self) -> Result<String, SnakeBoxError> {
    let mut buf = vec![];
    self.read_available(&mut buf, usize::MAX)?;
    // 忽略 UTF-8 parse 错误
    Ok(String::from_utf8_lossy(&buf).into_owned())
  }
}

impl Drop for SnakeBoxReadPipe {
  fn drop(&mut self) {
    let _ = close(self.fd);
  }
}

impl SnakeBoxWritePipe {
  pub fn fd(&self) -> RawFd {
    self.0
  }

  /// Write all bytes, blocking while the pipe is full
  pub fn write_all(&self, bytes: &[u8]) -> Result<(), SnakeBoxError> {
    let mut rest = bytes;
    while !rest.is_empty() {
      match unistd::write(self.0, rest) {
        Ok(size) => rest = &rest[size..],
        Err(Errno::EINTR) => continue,
        Err(errno) => return Err(errno.into()),
      }
    }
    Ok(())
  }
}

impl Drop for SnakeBoxWritePipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}

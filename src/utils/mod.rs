use std::fs;
use std::os::unix::prelude::RawFd;

use flexi_logger::DeferredNow;
use log::Record;
use nix::unistd::close;

pub use pipe::{SnakeBoxPipe, SnakeBoxReadPipe, SnakeBoxWritePipe};

pub mod pipe;

/// Fallback bound when `/proc/self/fd` can not be listed
const FALLBACK_MAX_FD: RawFd = 1024;

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Start running submission```
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

/// Close every descriptor above stderr except `keep`.
///
/// Called in the forked host, so that pipes of concurrent executions never stay
/// open in a sibling process.
pub(crate) fn close_inherited_fds(keep: &[RawFd]) {
  let fds = match fs::read_dir("/proc/self/fd") {
    Ok(entries) => entries
      .flatten()
      .filter_map(|entry| entry.file_name().into_string().ok())
      .filter_map(|name| name.parse::<RawFd>().ok())
      .collect::<Vec<RawFd>>(),
    Err(_) => (0..FALLBACK_MAX_FD).collect(),
  };
  for fd in fds {
    if fd > 2 && !keep.contains(&fd) {
      // 目录句柄已经关闭，忽略 EBADF
      let _ = close(fd);
    }
  }
}

/// Cut `text` to at most `limit` bytes on a char boundary
pub(crate) fn truncate_utf8(text: &mut String, limit: usize) {
  if text.len() <= limit {
    return;
  }
  let mut end = limit;
  while !text.is_char_boundary(end) {
    end -= 1;
  }
  text.truncate(end);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_should_truncate_on_char_boundary() {
    let mut text = "ab✅cd".to_string();
    truncate_utf8(&mut text, 3);
    assert_eq!(text, "ab");

    let mut text = "short".to_string();
    truncate_utf8(&mut text, 64);
    assert_eq!(text, "short");
  }
}

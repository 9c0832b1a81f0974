//! Line-prefixed output for interleaved child process logs

use std::io::{self, Write};
use tokio::io::{AsyncRead, AsyncReadExt};

const CYAN: &str = "\x1b[0;36m";
const RED: &str = "\x1b[0;31m";
const RESET: &str = "\x1b[0;00m";

/// Size of the read buffer used when pumping child output
const PUMP_BUFFER_SIZE: usize = 8 * 1024;

/// Writes to `dest`, inserting the result of `prefix()` before every line.
///
/// The prefix function is called again for each new line, so it may embed a
/// timestamp. Errors from `dest` are ignored: a write of `n` bytes always
/// reports `n`.
pub struct PrefixedLineWriter<W, F> {
    dest: W,
    prefix: F,
    in_line: bool,
}

impl<W, F> PrefixedLineWriter<W, F>
where
    W: Write,
    F: FnMut() -> String,
{
    pub fn new(dest: W, prefix: F) -> Self {
        Self {
            dest,
            prefix,
            in_line: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.dest
    }
}

impl<W, F> Write for PrefixedLineWriter<W, F>
where
    W: Write,
    F: FnMut() -> String,
{
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut rest = data;

        while !rest.is_empty() {
            if !self.in_line {
                let prefix = (self.prefix)();
                let _ = self.dest.write_all(prefix.as_bytes());
                self.in_line = true;
            }

            let end = match rest.iter().position(|&b| b == b'\n') {
                Some(newline) => {
                    self.in_line = false;
                    newline + 1
                }
                None => rest.len(),
            };
            let _ = self.dest.write_all(&rest[..end]);
            rest = &rest[end..];
        }

        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.dest.flush()
    }
}

fn prefix_with(color: &'static str, name: String) -> impl FnMut() -> String {
    move || {
        format!(
            "{}{} {}\t| {}",
            color,
            chrono::Local::now().format("%H:%M:%S"),
            name,
            RESET
        )
    }
}

/// Prefix for a child's stdout lines
pub fn stdout_prefix(name: &str) -> impl FnMut() -> String {
    prefix_with(CYAN, name.to_string())
}

/// Prefix for a child's stderr lines
pub fn stderr_prefix(name: &str) -> impl FnMut() -> String {
    prefix_with(RED, name.to_string())
}

/// Copy everything from `reader` into `writer` until EOF or a read error.
pub async fn pump<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: Write,
{
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.flush();
            return Ok(total);
        }
        writer.write_all(&buf[..n])?;
        let _ = writer.flush();
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(p: &'static str) -> impl FnMut() -> String {
        move || p.to_string()
    }

    #[test]
    fn test_prefix_each_line() {
        let mut w = PrefixedLineWriter::new(Vec::new(), fixed("P:"));
        let n = w.write(b"a\nb").unwrap();
        assert_eq!(n, 3);
        assert_eq!(w.into_inner(), b"P:a\nP:b");
    }

    #[test]
    fn test_prefix_across_writes() {
        let mut w = PrefixedLineWriter::new(Vec::new(), fixed("> "));
        w.write_all(b"hel").unwrap();
        w.write_all(b"lo\nwor").unwrap();
        w.write_all(b"ld\n").unwrap();
        w.write_all(b"\n").unwrap();
        assert_eq!(w.into_inner(), b"> hello\n> world\n> \n");
    }

    #[test]
    fn test_empty_write_adds_nothing() {
        let mut w = PrefixedLineWriter::new(Vec::new(), fixed("P:"));
        assert_eq!(w.write(b"").unwrap(), 0);
        assert!(w.into_inner().is_empty());
    }

    #[test]
    fn test_prefix_called_per_line() {
        let mut counter = 0;
        let mut w = PrefixedLineWriter::new(Vec::new(), move || {
            counter += 1;
            format!("{}:", counter)
        });
        w.write_all(b"x\ny\nz").unwrap();
        assert_eq!(w.into_inner(), b"1:x\n2:y\n3:z");
    }

    #[test]
    fn test_stream_prefix_format() {
        let line = stdout_prefix("web.0")();
        assert!(line.starts_with(CYAN));
        assert!(line.contains(" web.0\t| "));
        assert!(line.ends_with(RESET));

        let line = stderr_prefix("worker.1")();
        assert!(line.starts_with(RED));
        assert!(line.contains(" worker.1\t| "));
    }

    #[tokio::test]
    async fn test_pump_copies_everything() {
        let mut out = Vec::new();
        let copied = pump(&b"one\ntwo\n"[..], PrefixedLineWriter::new(&mut out, fixed("|")))
            .await
            .unwrap();
        assert_eq!(copied, 8);
        assert_eq!(out, b"|one\n|two\n");
    }
}

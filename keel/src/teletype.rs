//! A teletype (TTY) interface for character-based I/O.
//!
//! The machine has a single console. Output written with [`putbuf`] goes to the
//! serial line and is also captured so that [`crate::Shutdown::output`] can
//! report it. Input is a queue of bytes fed before boot or with [`feed`];
//! [`input_getc`] returns `None` once it is drained.

use crate::{KernelError, boot, sync::SpinLock};
use crossbeam_queue::SegQueue;

/// The `Teletype` trait represents a generic character-based input/output
/// device.
pub trait Teletype {
    /// Writes data to the teletype.
    ///
    /// Returns the number of bytes successfully written.
    fn write(&self, data: &[u8]) -> Result<usize, KernelError>;

    /// Reads data from the teletype.
    ///
    /// Returns the number of bytes read, which is short once the input is
    /// exhausted.
    fn read(&self, data: &mut [u8]) -> Result<usize, KernelError>;
}

/// The console device.
pub struct Console {
    output: SpinLock<Vec<u8>>,
    input: SegQueue<u8>,
}

impl Console {
    /// Creates a console whose input holds `stdin`.
    pub fn new(stdin: &[u8]) -> Self {
        let input = SegQueue::new();
        for b in stdin {
            input.push(*b);
        }
        Self {
            output: SpinLock::new(Vec::new()),
            input,
        }
    }

    /// Writes `buf` to the console.
    pub fn putbuf(&self, buf: &[u8]) {
        let mut output = self.output.lock();
        output.extend_from_slice(buf);
        output.unlock();
        abyss::kprint::put_bytes(buf);
    }

    /// Takes one byte of input, or `None` if there is none left.
    pub fn input_getc(&self) -> Option<u8> {
        self.input.pop()
    }

    /// Appends bytes to the input queue.
    pub fn feed(&self, bytes: &[u8]) {
        for b in bytes {
            self.input.push(*b);
        }
    }

    /// Everything written so far, lossily decoded.
    pub fn output(&self) -> String {
        let output = self.output.lock();
        let result = String::from_utf8_lossy(&output).into_owned();
        output.unlock();
        result
    }
}

impl Teletype for Console {
    fn write(&self, data: &[u8]) -> Result<usize, KernelError> {
        self.putbuf(data);
        Ok(data.len())
    }

    fn read(&self, data: &mut [u8]) -> Result<usize, KernelError> {
        for (i, slot) in data.iter_mut().enumerate() {
            match self.input_getc() {
                Some(b) => *slot = b,
                None => return Ok(i),
            }
        }
        Ok(data.len())
    }
}

/// Writes `buf` to the console of the running kernel.
pub fn putbuf(buf: &[u8]) {
    boot::kernel().console.putbuf(buf);
}

/// Takes one byte from the console input of the running kernel.
pub fn input_getc() -> Option<u8> {
    boot::kernel().console.input_getc()
}

/// Appends bytes to the console input of the running kernel.
pub fn feed(bytes: &[u8]) {
    boot::kernel().console.feed(bytes);
}

/// Everything written to the console of the running kernel so far.
pub fn output() -> String {
    boot::kernel().console.output()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_reads_short_at_end_of_input() {
        let console = Console::new(b"ab");
        let mut buf = [0; 4];
        assert_eq!(console.read(&mut buf), Ok(2));
        assert_eq!(&buf[..2], b"ab");
        assert_eq!(console.input_getc(), None);
        console.feed(b"c");
        assert_eq!(console.input_getc(), Some(b'c'));
    }

    #[test]
    fn console_captures_output() {
        let console = Console::new(&[]);
        assert_eq!(console.write(b"hi"), Ok(2));
        console.putbuf(b"!\n");
        assert_eq!(console.output(), "hi!\n");
    }
}

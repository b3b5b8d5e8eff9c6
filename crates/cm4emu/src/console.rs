//! Injectable UART console.
//!
//! The peripheral stubs at the UART TXD/RXD addresses call exactly one
//! operation each. Isolating them behind a trait keeps `getchar`/`putchar`
//! side effects out of the otherwise pure-looking memory path and lets
//! tests supply deterministic input and capture output instead of touching
//! the real terminal.

/// Byte-oriented console backing the emulated UART.
pub trait Console {
    /// Read one byte, blocking if none is available. Returns `None` at EOF.
    fn getchar(&mut self) -> Option<u8>;
    /// Write one byte, bypassing any buffering.
    fn putchar(&mut self, byte: u8);
}

/// A console with no input and a discarded output; the default when no
/// terminal is wired up (e.g. during tests that don't exercise the UART).
#[derive(Debug, Default)]
pub struct NullConsole;

impl Console for NullConsole {
    fn getchar(&mut self) -> Option<u8> {
        None
    }

    fn putchar(&mut self, _byte: u8) {}
}

/// An in-memory console for tests: consumes bytes from a fixed input
/// queue and records every byte written.
#[derive(Debug, Default)]
pub struct BufferConsole {
    input: std::collections::VecDeque<u8>,
    pub output: Vec<u8>,
}

impl BufferConsole {
    #[must_use]
    pub fn with_input(input: impl IntoIterator<Item = u8>) -> Self {
        Self {
            input: input.into_iter().collect(),
            output: Vec::new(),
        }
    }
}

impl Console for BufferConsole {
    fn getchar(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn putchar(&mut self, byte: u8) {
        self.output.push(byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_console_round_trips() {
        let mut console = BufferConsole::with_input([b'h', b'i']);
        assert_eq!(console.getchar(), Some(b'h'));
        assert_eq!(console.getchar(), Some(b'i'));
        assert_eq!(console.getchar(), None);
        console.putchar(b'x');
        assert_eq!(console.output, vec![b'x']);
    }
}

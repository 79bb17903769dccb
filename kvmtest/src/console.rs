use tracing::info;

/// Lines longer than this are split.
const MAX_LINE_LEN: usize = 4096;

/// Collects bytes the guest writes to the console port into lines.
#[derive(Debug, Default)]
pub struct Console {
    line: Vec<u8>,
    lines: Vec<String>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            match byte {
                b'\n' => self.flush_line(),
                b'\r' => {}
                byte => {
                    self.line.push(byte);
                    if self.line.len() >= MAX_LINE_LEN {
                        self.flush_line();
                    }
                }
            }
        }
    }

    fn flush_line(&mut self) {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        info!(target: "kvmtest::guest", "{line}");
        self.lines.push(line);
    }

    /// Flush a trailing partial line and return everything the guest wrote.
    pub fn finish(mut self) -> Vec<String> {
        if !self.line.is_empty() {
            self.flush_line();
        }
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::{Console, MAX_LINE_LEN};

    #[test]
    fn test_lines() {
        let mut console = Console::new();
        console.write(b"hello ");
        console.write(b"world\r\nsecond");
        console.write(b"\n\nlast");
        assert_eq!(console.finish(), ["hello world", "second", "", "last"]);
    }

    #[test]
    fn test_long_lines_are_split() {
        let mut console = Console::new();
        console.write(&vec![b'a'; MAX_LINE_LEN + 1]);
        let lines = console.finish();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE_LEN);
        assert_eq!(lines[1], "a");
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut console = Console::new();
        console.write(b"\xffok\n");
        assert_eq!(console.finish(), ["\u{fffd}ok"]);
    }
}

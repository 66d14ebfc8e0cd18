//! Newline framing for raw client byte streams.
//!
//! Reads from a socket arrive in arbitrary chunks. [`LineFramer`] keeps the
//! unterminated tail between reads and hands back every complete line as soon
//! as its `\n` shows up.

const LINE_FEED: u8 = b'\n';
const CARRIAGE_RETURN: u8 = b'\r';

/// Accumulates bytes for one connection and splits them into lines.
///
/// Both LF and CRLF framing are accepted: a single `\r` directly before the
/// `\n` is dropped. Bytes after the last `\n` stay buffered until more data
/// arrives. `feed` never surfaces them as a line on their own, so a peer that
/// disconnects mid-line loses that partial line at the relay.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every line completed by them, in order.
    ///
    /// Invalid UTF-8 is replaced with U+FFFD rather than rejected.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let Some(last_newline) = self.buffer.iter().rposition(|&byte| byte == LINE_FEED) else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        // Drop the final terminator so `split` yields exactly one piece per line.
        complete[..last_newline]
            .split(|&byte| byte == LINE_FEED)
            .map(decode_line)
            .collect()
    }

    /// Number of buffered bytes still waiting for a line terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Takes the unterminated tail as a line, if there is one.
    ///
    /// The relay never calls this; the terminal client uses it to print a
    /// last line the relay sent without a terminator.
    pub fn take_pending(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.buffer);
        Some(decode_line(&tail))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(&[CARRIAGE_RETURN]).unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

//! Wire codec for the line-oriented helper protocol.
//!
//! Lines are ASCII, CRLF-terminated, with space-separated arguments.
//! Backslash escapes a backslash, space, CR, or LF inside an argument; the
//! decoder treats `\X` as a literal `X`. A line consisting of the single
//! token `R` is the asynchronous "results waiting" marker, not a reply.

/// The lone token a helper sends to signal that queued results are waiting.
pub const ASYNC_RESULTS_MARKER: &str = "R";

/// Escapes one argument for transmission: backslash, space, CR, and LF are
/// each preceded by a backslash.
pub fn escape(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    for ch in arg.chars() {
        if matches!(ch, '\\' | ' ' | '\r' | '\n') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Builds a full CRLF-terminated request line: verb, optional request id,
/// then each argument escaped.
pub fn request_line(verb: &str, reqid: Option<u32>, args: &[&str]) -> String {
    let mut line = String::from(verb);
    if let Some(id) = reqid {
        line.push(' ');
        line.push_str(&id.to_string());
    }
    for arg in args {
        line.push(' ');
        line.push_str(&escape(arg));
    }
    line.push_str("\r\n");
    line
}

/// Incremental decoder for incoming lines.
///
/// Feed bytes one at a time; each unescaped LF completes a line and yields
/// its argument vector. Unescaped CRs are dropped, unescaped spaces end the
/// current argument.
#[derive(Debug, Default)]
pub struct Decoder {
    args: Vec<String>,
    current: Vec<u8>,
    escaped: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one byte; returns the completed argument vector when the
    /// byte terminates a line.
    pub fn feed(&mut self, byte: u8) -> Option<Vec<String>> {
        if self.escaped {
            self.escaped = false;
            self.current.push(byte);
            return None;
        }
        match byte {
            b'\\' => {
                self.escaped = true;
                None
            }
            b'\r' => None,
            b' ' => {
                self.end_arg();
                None
            }
            b'\n' => {
                self.end_arg();
                Some(std::mem::take(&mut self.args))
            }
            other => {
                self.current.push(other);
                None
            }
        }
    }

    fn end_arg(&mut self) {
        let raw = std::mem::take(&mut self.current);
        self.args
            .push(String::from_utf8_lossy(&raw).into_owned());
    }
}

/// Classification of one decoded line.
#[derive(Debug, PartialEq, Eq)]
pub enum LineClass {
    /// A genuine reply line (prefix already stripped if one was configured).
    Reply(Vec<String>),
    /// The async `R` marker: poll for results, do not treat as a reply.
    ResultsReady,
    /// Unprefixed noise from the helper's own libraries; discard.
    Noise,
}

/// Applies the optional response-prefix filter and recognizes the async
/// results marker.
///
/// With a prefix configured, any line whose first argument does not start
/// with it is noise: the helper's underlying libraries sometimes write
/// diagnostics to the same stream, and the prefix is what lets us tell the
/// difference.
pub fn classify(mut argv: Vec<String>, prefix: Option<&str>) -> LineClass {
    if let Some(prefix) = prefix {
        match argv.first_mut() {
            Some(first) if first.starts_with(prefix) => {
                first.replace_range(..prefix.len(), "");
            }
            _ => return LineClass::Noise,
        }
    }
    if argv.len() == 1 && argv[0] == ASYNC_RESULTS_MARKER {
        return LineClass::ResultsReady;
    }
    LineClass::Reply(argv)
}

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::Fields;

/// Largest header block accepted, request line included.
pub const MAX_HEADER_SIZE: usize = 32 * 1024;

/// Incremental request header parser.
///
/// Line endings are stripped as data comes in, so the accumulator only holds line contents.
pub struct HttpParser {
    data: BytesMut,
    has_cr: bool,
    last_line: usize,
    lines: Vec<usize>,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self {
            data: BytesMut::new(),
            has_cr: false,
            last_line: 0,
            lines: Vec::new(),
        }
    }
}

impl HttpParser {
    /// Consume bytes into the parser.
    ///
    /// Suspends and returns once a complete header is available, leaving anything after it in
    /// `bytes`. Everything before that point is consumed.
    pub fn consume(&mut self, bytes: &mut BytesMut) -> Result<Option<ParserEvent>, ParseError> {
        for consumed in 1..=bytes.len() {
            let byte = bytes[consumed - 1];

            match byte {
                // CRNL is the required newline, so consume CR if it happens
                b'\r' => {
                    self.has_cr = true;
                }
                b'\n' => {
                    // A bare NL is accepted the same as CRNL
                    let header_done = self.handle_line()?;
                    self.has_cr = false;

                    if header_done {
                        bytes.advance(consumed);

                        let header = self.take_header()?;
                        return Ok(Some(ParserEvent::Header(header)));
                    }
                }
                _ => {
                    // CR with no NL needs to be counted as a space
                    if self.has_cr {
                        self.data.put_u8(b' ');
                    }

                    self.data.put_u8(byte);
                    self.has_cr = false;

                    if self.data.len() > MAX_HEADER_SIZE {
                        return Err(ParseError::TooLarge);
                    }
                }
            }
        }

        bytes.clear();
        Ok(None)
    }

    fn handle_line(&mut self) -> Result<bool, ParseError> {
        // Extract the current line for convenience
        let line = &self.data[self.last_line..];

        if line.is_empty() {
            // Blank lines before the request line are tolerated and skipped
            if self.lines.is_empty() {
                return Ok(false);
            }

            // Empty line signals end of the header
            return Ok(true);
        }

        // Folded continuation lines are obsolete and ambiguous
        if !self.lines.is_empty() && matches!(line[0], b' ' | b'\t') {
            return Err(ParseError::FoldedField);
        }

        // Remember that this line is available
        self.lines.push(line.len());

        // Remember where this line ended in the accumulator
        self.last_line = self.data.len();

        Ok(false)
    }

    /// Take the data and return it as an assembled header.
    ///
    /// Clears all currently pending data.
    fn take_header(&mut self) -> Result<HttpHeader, ParseError> {
        let mut data = std::mem::take(&mut self.data).freeze();
        let lines = std::mem::take(&mut self.lines);

        // Clear parser state
        self.has_cr = false;
        self.last_line = 0;

        let mut header = HttpHeader::default();

        for (i, length) in lines.into_iter().enumerate() {
            let line = data.split_to(length);

            if i == 0 {
                header.request_line = std::str::from_utf8(&line)
                    .map_err(|_| ParseError::RequestLine)?
                    .to_string();
                continue;
            }

            let (key, value) = parse_field(&line)?;
            header.fields.append(&key, value);
        }

        Ok(header)
    }
}

fn parse_field(line: &[u8]) -> Result<(String, String), ParseError> {
    let split = line
        .iter()
        .position(|ch| *ch == b':')
        .ok_or(ParseError::MalformedField)?;

    let key = &line[..split];
    let valid_key = !key.is_empty() && key.iter().all(|b| b.is_ascii_graphic());
    if !valid_key {
        return Err(ParseError::MalformedField);
    }

    let key = String::from_utf8_lossy(key).into_owned();
    let value = String::from_utf8_lossy(&line[split + 1..]).trim().to_string();

    Ok((key, value))
}

pub enum ParserEvent {
    Header(HttpHeader),
}

#[derive(Debug, Default)]
pub struct HttpHeader {
    pub request_line: String,
    pub fields: Fields,
}

/// Terminal parser failures, all of them answered with 400.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("header block too large")]
    TooLarge,
    #[error("request line is not valid text")]
    RequestLine,
    #[error("malformed header field")]
    MalformedField,
    #[error("folded header field")]
    FoldedField,
}

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Longest chunk size or trailer line accepted.
const MAX_CHUNK_LINE: usize = 1024;

/// Splits a request body out of the connection's input.
#[derive(Debug)]
pub enum BodyDecoder {
    Length { remaining: u64 },
    Chunked(ChunkState),
}

#[derive(Debug)]
pub enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailer,
    Done,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Data(Bytes),
    NeedMore,
    Done,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BodyError {
    #[error("invalid chunk size line")]
    ChunkSize,
    #[error("chunk data not followed by a line break")]
    ChunkEnd,
    #[error("chunk framing line too long")]
    LineTooLong,
}

impl BodyDecoder {
    pub fn length(length: u64) -> Self {
        BodyDecoder::Length { remaining: length }
    }

    pub fn chunked() -> Self {
        BodyDecoder::Chunked(ChunkState::Size)
    }

    /// Take the next piece of body out of `input`.
    pub fn decode(&mut self, input: &mut BytesMut) -> Result<Decoded, BodyError> {
        match self {
            BodyDecoder::Length { remaining } => {
                if *remaining == 0 {
                    return Ok(Decoded::Done);
                }
                if input.is_empty() {
                    return Ok(Decoded::NeedMore);
                }

                let take = input.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                *remaining -= take as u64;

                Ok(Decoded::Data(input.split_to(take).freeze()))
            }
            BodyDecoder::Chunked(state) => decode_chunked(state, input),
        }
    }
}

fn decode_chunked(state: &mut ChunkState, input: &mut BytesMut) -> Result<Decoded, BodyError> {
    loop {
        match state {
            ChunkState::Size => {
                let Some(line) = take_line(input)? else {
                    return Ok(Decoded::NeedMore);
                };

                let size = parse_chunk_size(&line)?;
                *state = if size == 0 {
                    ChunkState::Trailer
                } else {
                    ChunkState::Data { remaining: size }
                };
            }
            ChunkState::Data { remaining } => {
                if input.is_empty() {
                    return Ok(Decoded::NeedMore);
                }

                let take = input.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                *remaining -= take as u64;
                let data = input.split_to(take).freeze();

                if *remaining == 0 {
                    *state = ChunkState::DataEnd;
                }

                return Ok(Decoded::Data(data));
            }
            ChunkState::DataEnd => {
                if input.starts_with(b"\r\n") {
                    input.advance(2);
                } else if input.starts_with(b"\n") {
                    input.advance(1);
                } else if input.is_empty() || &input[..] == b"\r" {
                    return Ok(Decoded::NeedMore);
                } else {
                    return Err(BodyError::ChunkEnd);
                }

                *state = ChunkState::Size;
            }
            ChunkState::Trailer => {
                let Some(line) = take_line(input)? else {
                    return Ok(Decoded::NeedMore);
                };

                // Trailer fields are read and dropped
                if line.is_empty() {
                    *state = ChunkState::Done;
                }
            }
            ChunkState::Done => return Ok(Decoded::Done),
        }
    }
}

/// Next line without its terminator, if a complete one is buffered.
fn take_line(input: &mut BytesMut) -> Result<Option<BytesMut>, BodyError> {
    let Some(end) = input.iter().position(|b| *b == b'\n') else {
        if input.len() > MAX_CHUNK_LINE {
            return Err(BodyError::LineTooLong);
        }
        return Ok(None);
    };

    if end > MAX_CHUNK_LINE {
        return Err(BodyError::LineTooLong);
    }

    let mut line = input.split_to(end + 1);
    line.truncate(end);
    if line.last() == Some(&b'\r') {
        line.truncate(end - 1);
    }

    Ok(Some(line))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, BodyError> {
    // Chunk extensions are ignored
    let digits = line.split(|b| *b == b';').next().unwrap_or_default();
    let digits = std::str::from_utf8(digits)
        .map_err(|_| BodyError::ChunkSize)?
        .trim();
    if digits.is_empty() {
        return Err(BodyError::ChunkSize);
    }

    u64::from_str_radix(digits, 16).map_err(|_| BodyError::ChunkSize)
}

use std::fmt;

use thiserror::Error;

/// The camera frames carry raw JPEG bytes inside a JSON-looking envelope, so
/// the payload as a whole is usually not valid UTF-8, let alone valid JSON.
/// The parser therefore never round-trips through a JSON decoder; it locates
/// the `"val":"` literal and splits on ASCII spaces, treating everything up to
/// the fixed `"}]}` trailer as block data.
const VAL_MARKER: &[u8] = b"\"val\":\"";
const TRAILER_LEN: usize = 3;

#[derive(Debug, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload contains no recognized frame type")]
    UnknownType,
    #[error("frame has no \"val\" field")]
    MissingVal,
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// Which camera produced the frame. The wire tokens are `…AV` (front) and
/// `…AR` (rear).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Camera {
    Front,
    Rear,
}

impl Camera {
    pub fn as_str(&self) -> &'static str {
        match self {
            Camera::Front => "CAMAV",
            Camera::Rear => "CAMAR",
        }
    }
}

impl fmt::Display for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `DCAV`/`DCAR`: a new image is coming, in `total_blocks` blocks.
    Init { camera: Camera, total_blocks: u32 },
    /// `BCAV`/`BCAR`: one block, `"val":"<number> <size> <raw bytes>"`.
    Block {
        camera: Camera,
        number: u32,
        size: usize,
        data: Vec<u8>,
    },
}

/// Parse one inbound camera message into a [`Frame`].
pub fn parse_frame(body: &[u8]) -> Result<Frame, FrameError> {
    if contains(body, b"\"type\":\"DCAV\"") {
        parse_init(body, Camera::Front)
    } else if contains(body, b"\"type\":\"DCAR\"") {
        parse_init(body, Camera::Rear)
    } else if contains(body, b"\"type\":\"BCAV\"") {
        parse_block(body, Camera::Front)
    } else if contains(body, b"\"type\":\"BCAR\"") {
        parse_block(body, Camera::Rear)
    } else {
        Err(FrameError::UnknownType)
    }
}

fn parse_init(body: &[u8], camera: Camera) -> Result<Frame, FrameError> {
    let start = val_start(body).ok_or(FrameError::MissingVal)?;
    let end = find_byte(body, b'"', start).ok_or(FrameError::Malformed("unterminated val"))?;
    let total_blocks = ascii_int(&body[start..end], "total block count")?;

    Ok(Frame::Init {
        camera,
        total_blocks,
    })
}

fn parse_block(body: &[u8], camera: Camera) -> Result<Frame, FrameError> {
    let start = val_start(body).ok_or(FrameError::MissingVal)?;

    let space1 = find_byte(body, b' ', start).ok_or(FrameError::Malformed("missing block number"))?;
    let number = ascii_int(&body[start..space1], "block number")?;

    let space2 =
        find_byte(body, b' ', space1 + 1).ok_or(FrameError::Malformed("missing block size"))?;
    let size = ascii_int(&body[space1 + 1..space2], "block size")? as usize;

    let data_start = space2 + 1;
    if body.len() < data_start + TRAILER_LEN {
        return Err(FrameError::Malformed("truncated block data"));
    }
    let data = body[data_start..body.len() - TRAILER_LEN].to_vec();

    Ok(Frame::Block {
        camera,
        number,
        size,
        data,
    })
}

fn val_start(body: &[u8]) -> Option<usize> {
    body.windows(VAL_MARKER.len())
        .position(|w| w == VAL_MARKER)
        .map(|pos| pos + VAL_MARKER.len())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn find_byte(haystack: &[u8], needle: u8, from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .iter()
        .position(|b| *b == needle)
        .map(|pos| pos + from)
}

fn ascii_int(bytes: &[u8], what: &'static str) -> Result<u32, FrameError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(FrameError::Malformed(what))
}

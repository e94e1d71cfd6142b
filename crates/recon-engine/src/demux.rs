//! Decoder for the runtime's multiplexed output stream.
//!
//! Non-TTY logs and exec attach streams interleave stdout and stderr as
//! frames: one stream-type byte, three zero bytes, a big-endian `u32` payload
//! length, then the payload. Frames may be split across reads at any byte, so
//! the decoder is an incremental state machine fed with arbitrary chunks.
//!
//! If a header carries a stream type the runtime never emits, the input is
//! treated as an unframed (TTY) stream and every byte from there on is
//! collected as stdout.

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
    /// Errors the runtime itself reports on the stream, such as a failed exec.
    SystemErr,
}

impl StreamKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(StreamKind::Stdin),
            1 => Some(StreamKind::Stdout),
            2 => Some(StreamKind::Stderr),
            3 => Some(StreamKind::SystemErr),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            StreamKind::Stdin => 0,
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
            StreamKind::SystemErr => 3,
        }
    }
}

/// Encode one frame in the runtime's wire format.
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(kind.as_byte());
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decode a complete buffer in one call.
pub fn demux(bytes: &[u8]) -> DemuxedOutput {
    let mut decoder = FrameDecoder::new();
    decoder.push(bytes);
    decoder.finish()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemuxedOutput {
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Bytes of a frame that was cut off by the end of the stream.
    pub trailing_bytes: usize,
}

#[derive(Debug)]
enum DecodeState {
    Header { buf: [u8; HEADER_LEN], filled: usize },
    Payload { kind: StreamKind, remaining: usize },
    Raw,
}

#[derive(Debug)]
struct CappedBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn extend(&mut self, data: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        if data.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&data[..data.len().min(room)]);
    }
}

#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    stdout: CappedBuffer,
    stderr: CappedBuffer,
    frames: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Decoder that keeps at most `limit` bytes per stream.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            state: DecodeState::Header {
                buf: [0; HEADER_LEN],
                filled: 0,
            },
            stdout: CappedBuffer::new(limit),
            stderr: CappedBuffer::new(limit),
            frames: 0,
        }
    }

    /// Number of complete frame headers decoded so far.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn push(&mut self, mut input: &[u8]) {
        while !input.is_empty() {
            match &mut self.state {
                DecodeState::Raw => {
                    self.stdout.extend(input);
                    return;
                }
                DecodeState::Header { buf, filled } => {
                    let take = (HEADER_LEN - *filled).min(input.len());
                    buf[*filled..*filled + take].copy_from_slice(&input[..take]);
                    *filled += take;
                    input = &input[take..];
                    if *filled < HEADER_LEN {
                        continue;
                    }

                    let header = *buf;
                    match StreamKind::from_byte(header[0]) {
                        Some(kind) => {
                            let len =
                                u32::from_be_bytes([header[4], header[5], header[6], header[7]])
                                    as usize;
                            self.frames += 1;
                            self.state = if len == 0 {
                                DecodeState::Header {
                                    buf: [0; HEADER_LEN],
                                    filled: 0,
                                }
                            } else {
                                DecodeState::Payload {
                                    kind,
                                    remaining: len,
                                }
                            };
                        }
                        None => {
                            self.stdout.extend(&header);
                            self.state = DecodeState::Raw;
                        }
                    }
                }
                DecodeState::Payload { kind, remaining } => {
                    let take = (*remaining).min(input.len());
                    let kind = *kind;
                    *remaining -= take;
                    let done = *remaining == 0;
                    let (payload, rest) = input.split_at(take);
                    match kind {
                        // stdin echoes only show up when stdin is attached; keep them with stdout
                        StreamKind::Stdin | StreamKind::Stdout => self.stdout.extend(payload),
                        StreamKind::Stderr | StreamKind::SystemErr => self.stderr.extend(payload),
                    }
                    input = rest;
                    if done {
                        self.state = DecodeState::Header {
                            buf: [0; HEADER_LEN],
                            filled: 0,
                        };
                    }
                }
            }
        }
    }

    pub fn finish(self) -> DemuxedOutput {
        let trailing_bytes = match self.state {
            DecodeState::Header { filled, .. } => filled,
            DecodeState::Payload { remaining, .. } => remaining,
            DecodeState::Raw => 0,
        };
        DemuxedOutput {
            stdout: String::from_utf8_lossy(&self.stdout.bytes).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr.bytes).into_owned(),
            stdout_truncated: self.stdout.truncated,
            stderr_truncated: self.stderr.truncated,
            trailing_bytes,
        }
    }
}

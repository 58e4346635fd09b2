//! Wire command codec: logical keystroke operations → tagged byte frames.
//! One-byte operation tag, operation-specific payload, sized to the link's
//! negotiated maximum frame. Insert payloads chunk at UTF-8 scalar
//! boundaries so the remote decoder never sees a torn code point.

/// Operation tags understood by the peripheral.
pub mod tags {
    pub const BACKSPACE: u8 = 0x01;
    pub const INSERT: u8 = 0x02;
    pub const ENTER: u8 = 0x03;
    pub const CTRL_COMBO: u8 = 0x04;
}

/// Smallest frame budget the codec accepts: tag plus one payload byte.
pub const MIN_FRAME: usize = 2;

/// One encoded wire frame, ready for the transport.
pub type Frame = Vec<u8>;

/// Logical keystroke operations the bridge can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCommand<'a> {
    /// Type text at the remote cursor.
    Insert(&'a str),
    /// Delete 1-255 characters behind the remote cursor.
    Delete(u8),
    /// Press Enter.
    Enter,
    /// Press Ctrl plus an ASCII key.
    ControlCombo(u8),
}

/// Caller-side invariant violations. The codec refuses to encode rather
/// than silently truncating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame budget below [`MIN_FRAME`]; nothing useful fits.
    FrameTooSmall(usize),
    /// A single scalar needs more bytes than one Insert payload allows.
    ScalarExceedsFrame { ch: char, budget: usize },
    /// The wire format expresses delete counts of 1-255 only.
    EmptyDelete,
    /// Combo keys are single ASCII codes on the wire.
    NonAsciiCombo(u8),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::FrameTooSmall(max) => {
                write!(f, "frame budget {max} below minimum {MIN_FRAME}")
            }
            CodecError::ScalarExceedsFrame { ch, budget } => {
                write!(f, "scalar {ch:?} wider than payload budget {budget}")
            }
            CodecError::EmptyDelete => write!(f, "delete count must be 1-255"),
            CodecError::NonAsciiCombo(key) => write!(f, "combo key 0x{key:02x} is not ASCII"),
        }
    }
}

/// Encode one command into its ordered frame sequence.
///
/// `max_frame` is the negotiated maximum frame size including the tag byte.
/// Insert text may produce any number of frames; the other operations
/// produce exactly one. Frame order is significant and preserving it on the
/// wire is the caller's responsibility.
pub fn encode(cmd: &KeyCommand<'_>, max_frame: usize) -> Result<Vec<Frame>, CodecError> {
    if max_frame < MIN_FRAME {
        return Err(CodecError::FrameTooSmall(max_frame));
    }
    match cmd {
        KeyCommand::Insert(text) => encode_insert(text, max_frame),
        KeyCommand::Delete(0) => Err(CodecError::EmptyDelete),
        KeyCommand::Delete(count) => Ok(vec![vec![tags::BACKSPACE, *count]]),
        KeyCommand::Enter => Ok(vec![vec![tags::ENTER]]),
        KeyCommand::ControlCombo(key) if !key.is_ascii() => Err(CodecError::NonAsciiCombo(*key)),
        KeyCommand::ControlCombo(key) => Ok(vec![vec![tags::CTRL_COMBO, *key]]),
    }
}

/// Split UTF-8 text into tagged frames of at most `max_frame` bytes.
/// Chunk boundaries always fall on scalar boundaries: a code point that
/// would straddle the budget starts the next frame instead.
fn encode_insert(text: &str, max_frame: usize) -> Result<Vec<Frame>, CodecError> {
    let budget = max_frame - 1;
    let mut frames = Vec::new();
    let mut current = open_insert_frame(max_frame);

    for ch in text.chars() {
        let width = ch.len_utf8();
        if width > budget {
            return Err(CodecError::ScalarExceedsFrame { ch, budget });
        }
        if current.len() - 1 + width > budget {
            frames.push(current);
            current = open_insert_frame(max_frame);
        }
        let mut buf = [0u8; 4];
        current.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
    }

    if current.len() > 1 {
        frames.push(current);
    }
    Ok(frames)
}

fn open_insert_frame(max_frame: usize) -> Frame {
    let mut frame = Frame::with_capacity(max_frame);
    frame.push(tags::INSERT);
    frame
}

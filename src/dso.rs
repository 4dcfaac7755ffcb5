use std::{error, fmt};

use tracing::debug;

use crate::bytes::{self, Cursor};

/// Container parsing errors.
#[derive(Debug, Clone)]
pub enum Error {
    Read(bytes::Error),
    PatchOutOfRange { location: usize, code_len: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(err) => err.fmt(f),
            Self::PatchOutOfRange { location, code_len } => {
                write!(
                    f,
                    "patch table names code location {location} but the code has {code_len} entries"
                )
            }
        }
    }
}

impl error::Error for Error {}

impl From<bytes::Error> for Error {
    fn from(err: bytes::Error) -> Self {
        Self::Read(err)
    }
}

/// A parsed DSO module: the compiled form of one TorqueScript file.
///
/// String tables are raw blobs of concatenated null-terminated strings,
/// addressed by byte offset; float tables are addressed by index. Both come
/// in a global and a per-function flavour, selected by a flag on most
/// opcodes. The patch table has already been applied to `code` when parsing
/// succeeds, so every opcode argument naming a string holds its table offset.
#[derive(Debug, Clone, Default)]
pub struct Dso {
    pub version: u32,
    pub global_strings: Vec<u8>,
    pub function_strings: Vec<u8>,
    pub global_floats: Vec<f64>,
    pub function_floats: Vec<f64>,
    pub code: Vec<u32>,
    pub linebreak_pairs: Vec<u32>,
}

impl Dso {
    /// Parse a DSO container from raw bytes and apply its patch table.
    pub fn new(data: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(data);
        let version = cursor.u32()?;

        let size = cursor.u32()? as usize;
        let global_strings = cursor.bytes(size)?.to_vec();
        let size = cursor.u32()? as usize;
        let function_strings = cursor.bytes(size)?.to_vec();

        let mut global_floats = Vec::new();
        let count = cursor.u32()? as usize;
        for _ in 0..count {
            global_floats.push(cursor.f64()?);
        }
        let mut function_floats = Vec::new();
        let count = cursor.u32()? as usize;
        for _ in 0..count {
            function_floats.push(cursor.f64()?);
        }

        // The code size counts opcodes and arguments, not bytes: values below
        // 0xFF are stored in one byte, anything else as 0xFF plus four bytes.
        let code_size = cursor.u32()? as usize;
        let linebreak_count = cursor.u32()? as usize;
        let mut code = Vec::new();
        for _ in 0..code_size {
            let byte = cursor.u8()?;
            code.push(if byte == 0xFF {
                cursor.u32()?
            } else {
                u32::from(byte)
            });
        }
        let mut linebreak_pairs = Vec::new();
        for _ in 0..linebreak_count * 2 {
            linebreak_pairs.push(cursor.u32()?);
        }

        // The identifier table lists, for every string, the code locations
        // where a zero placeholder must be replaced by its table offset.
        let patch_entries = cursor.u32()?;
        for _ in 0..patch_entries {
            let string_offset = cursor.u32()?;
            let locations = cursor.u32()?;
            for _ in 0..locations {
                let location = cursor.u32()? as usize;
                let code_len = code.len();
                let slot = code
                    .get_mut(location)
                    .ok_or(Error::PatchOutOfRange { location, code_len })?;
                *slot = string_offset;
            }
        }

        debug!(
            version,
            code = code.len(),
            global_strings = global_strings.len(),
            function_strings = function_strings.len(),
            "parsed DSO module"
        );
        Ok(Self {
            version,
            global_strings,
            function_strings,
            global_floats,
            function_floats,
            code,
            linebreak_pairs,
        })
    }

    /// The null-terminated string starting at `offset` in the selected table,
    /// stripped of trailing newlines. Out-of-range offsets yield `""`.
    #[must_use]
    pub fn string(&self, offset: u32, in_function: bool) -> String {
        let table = if in_function {
            &self.function_strings
        } else {
            &self.global_strings
        };
        let Some(tail) = table.get(offset as usize..) else {
            return String::new();
        };
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        let mut text = decode(&tail[..end]);
        while text.ends_with('\n') {
            text.pop();
        }
        text
    }

    /// The value at `index` in the selected float table.
    #[must_use]
    pub fn float(&self, index: u32, in_function: bool) -> Option<f64> {
        let table = if in_function {
            &self.function_floats
        } else {
            &self.global_floats
        };
        table.get(index as usize).copied()
    }

    /// Number of code slots a string-table reference operand occupies.
    /// Entries were widened in dialect 44.
    #[must_use]
    pub fn ste_size(&self) -> usize {
        if self.version < 44 { 1 } else { 2 }
    }
}

/// UTF-8 when valid, with a byte-for-byte fallback for legacy files that
/// carry arbitrary single-byte data.
fn decode(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

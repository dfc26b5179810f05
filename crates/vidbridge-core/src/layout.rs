//! Result record layout and decoding.
//!
//! The engine reports the outcome of a call as a fixed-shape record in its
//! own memory. Field offsets are a wire contract with the native struct
//! definition, so they are named here once and validated when the engine is
//! loaded instead of being scattered through pointer arithmetic.
//!
//! ```text
//! wire():               emscripten_wrapper():
//! +0  i32 success       +0    i32 success
//! +8  u32 error ptr     +4    i32 progress
//! +12 u32 output ptr    +8    char error_message[256]
//! +16 u64 output len    +264  u32 output ptr
//!                       +268  u32 output len (size_t)
//! ```

use serde::{Deserialize, Serialize};

use crate::arena::{Arena, ArenaPtr};
use crate::error::{BridgeError, Result};

/// Message used when a failed record carries a null error pointer.
pub const UNKNOWN_ERROR: &str = "unknown error";

/// Where the error message of a failed record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorField {
    /// A pointer to a NUL-terminated string elsewhere in memory
    Pointer { offset: u32 },
    /// A fixed-size, NUL-terminated character buffer inside the record
    Inline { offset: u32, capacity: u32 },
}

impl ErrorField {
    fn offset(&self) -> u32 {
        match *self {
            ErrorField::Pointer { offset } | ErrorField::Inline { offset, .. } => offset,
        }
    }

    fn width(&self) -> u32 {
        match *self {
            ErrorField::Pointer { .. } => 4,
            ErrorField::Inline { capacity, .. } => capacity,
        }
    }
}

/// Width of the output length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthWidth {
    U32,
    U64,
}

impl LengthWidth {
    pub const fn bytes(self) -> u32 {
        match self {
            LengthWidth::U32 => 4,
            LengthWidth::U64 => 8,
        }
    }
}

/// Byte layout of the engine's result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultLayout {
    /// `i32` success flag, nonzero means success
    pub success_offset: u32,
    /// Error message field, meaningful only on failure
    pub error: ErrorField,
    /// `u32` pointer to the output bytes, meaningful only on success
    pub output_ptr_offset: u32,
    /// Output length, meaningful only on success
    pub output_len_offset: u32,
    pub output_len_width: LengthWidth,
    /// Total size of the native struct
    pub record_size: u32,
}

impl ResultLayout {
    /// The documented wire contract:
    /// `{ success: i32 @0, error: ptr @8, output: ptr @12, len: i64 @16 }`.
    pub const fn wire() -> Self {
        Self {
            success_offset: 0,
            error: ErrorField::Pointer { offset: 8 },
            output_ptr_offset: 12,
            output_len_offset: 16,
            output_len_width: LengthWidth::U64,
            record_size: 24,
        }
    }

    /// The C wrapper's `TranscodeResult` struct compiled for wasm32.
    pub const fn emscripten_wrapper() -> Self {
        Self {
            success_offset: 0,
            error: ErrorField::Inline {
                offset: 8,
                capacity: 256,
            },
            output_ptr_offset: 264,
            output_len_offset: 268,
            output_len_width: LengthWidth::U32,
            record_size: 272,
        }
    }

    fn fields(&self) -> [(&'static str, u32, u32); 4] {
        [
            ("success", self.success_offset, 4),
            ("error", self.error.offset(), self.error.width()),
            ("output_ptr", self.output_ptr_offset, 4),
            (
                "output_len",
                self.output_len_offset,
                self.output_len_width.bytes(),
            ),
        ]
    }

    /// Check that every field lies inside the record and no two overlap.
    pub fn validate(&self) -> Result<()> {
        let fields = self.fields();
        for (name, offset, width) in fields {
            if offset as u64 + width as u64 > self.record_size as u64 {
                return Err(BridgeError::LayoutMismatch(format!(
                    "field '{}' at {}..{} exceeds record size {}",
                    name,
                    offset,
                    offset as u64 + width as u64,
                    self.record_size
                )));
            }
        }
        for (i, (a, a_off, a_width)) in fields.iter().enumerate() {
            for (b, b_off, b_width) in &fields[i + 1..] {
                if *a_off < b_off + b_width && *b_off < a_off + a_width {
                    return Err(BridgeError::LayoutMismatch(format!(
                        "fields '{}' and '{}' overlap",
                        a, b
                    )));
                }
            }
        }
        Ok(())
    }

    /// Compare against the struct size reported by the native side.
    pub fn check_native_size(&self, native_size: u32) -> Result<()> {
        if native_size != self.record_size {
            return Err(BridgeError::LayoutMismatch(format!(
                "native record is {} bytes, layout expects {}",
                native_size, self.record_size
            )));
        }
        Ok(())
    }

    /// Write a success record pointing at `len` bytes of output at `output`.
    pub fn encode_success(
        &self,
        arena: &mut dyn Arena,
        record: ArenaPtr,
        output: ArenaPtr,
        len: u32,
    ) -> Result<()> {
        self.clear(arena, record)?;
        arena.write_u32(field(record, self.success_offset)?, 1)?;
        arena.write_u32(field(record, self.output_ptr_offset)?, output.offset())?;
        let len_ptr = field(record, self.output_len_offset)?;
        match self.output_len_width {
            LengthWidth::U32 => arena.write_u32(len_ptr, len),
            LengthWidth::U64 => arena.write_u64(len_ptr, len as u64),
        }
    }

    /// Write a failure record carrying `message`.
    ///
    /// For [`ErrorField::Pointer`] the message is copied into a fresh
    /// allocation whose pointer is returned; the record's owner releases it
    /// together with the record. Inline messages are truncated to fit.
    pub fn encode_failure(
        &self,
        arena: &mut dyn Arena,
        record: ArenaPtr,
        message: &str,
    ) -> Result<Option<ArenaPtr>> {
        self.clear(arena, record)?;
        match self.error {
            ErrorField::Pointer { offset } => {
                let mut bytes = message.as_bytes().to_vec();
                bytes.push(0);
                let text = arena.allocate(bytes.len() as u32)?;
                arena.write(text, &bytes)?;
                arena.write_u32(field(record, offset)?, text.offset())?;
                Ok(Some(text))
            }
            ErrorField::Inline { offset, capacity } => {
                let max = capacity.saturating_sub(1) as usize;
                let mut end = message.len().min(max);
                while !message.is_char_boundary(end) {
                    end -= 1;
                }
                arena.write(field(record, offset)?, &message.as_bytes()[..end])?;
                Ok(None)
            }
        }
    }

    fn clear(&self, arena: &mut dyn Arena, record: ArenaPtr) -> Result<()> {
        arena.write(record, &vec![0; self.record_size as usize])
    }
}

impl Default for ResultLayout {
    fn default() -> Self {
        Self::wire()
    }
}

fn field(record: ArenaPtr, offset: u32) -> Result<ArenaPtr> {
    record.add(offset).ok_or(BridgeError::OutOfBounds {
        ptr: record.offset(),
        len: offset as u64,
    })
}

/// Outcome carried by a result record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Success(Vec<u8>),
    Failure(String),
}

/// Reads result records according to a validated [`ResultLayout`].
///
/// Decoding is read-only. Releasing the record afterwards is the caller's job.
#[derive(Debug, Clone)]
pub struct ResultDecoder {
    layout: ResultLayout,
}

impl ResultDecoder {
    pub fn new(layout: ResultLayout) -> Result<Self> {
        layout.validate()?;
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &ResultLayout {
        &self.layout
    }

    /// Decode the record at `record` into an owned output or an error message.
    pub fn decode(&self, arena: &dyn Arena, record: ArenaPtr) -> Result<Decoded> {
        let layout = &self.layout;
        let success = arena.read_i32(field(record, layout.success_offset)?)?;

        if success != 0 {
            let output = ArenaPtr::new(arena.read_u32(field(record, layout.output_ptr_offset)?)?);
            let len_ptr = field(record, layout.output_len_offset)?;
            let len = match layout.output_len_width {
                LengthWidth::U32 => arena.read_u32(len_ptr)? as u64,
                LengthWidth::U64 => arena.read_u64(len_ptr)?,
            };
            if len == 0 {
                return Ok(Decoded::Success(Vec::new()));
            }
            let len = u32::try_from(len)
                .ok()
                .filter(|_| !output.is_null())
                .ok_or(BridgeError::OutOfBounds {
                    ptr: output.offset(),
                    len,
                })?;
            return Ok(Decoded::Success(arena.read(output, len)?));
        }

        let message = match layout.error {
            ErrorField::Pointer { offset } => {
                let text = ArenaPtr::new(arena.read_u32(field(record, offset)?)?);
                if text.is_null() {
                    UNKNOWN_ERROR.to_string()
                } else {
                    arena.read_cstring(text)?
                }
            }
            ErrorField::Inline { offset, capacity } => {
                arena.read_cstring_bounded(field(record, offset)?, capacity)?
            }
        };
        Ok(Decoded::Failure(message))
    }
}

//! DNS names: length-prefixed label sequences, at most 255 wire octets,
//! each label at most 63 octets. Compression pointers are followed on
//! read but never emitted by our own writers.

use std::fmt;

use super::buffer::{Buffer, Result, WireError};

const MAX_NAME_OCTETS: usize = 255;
const MAX_LABEL_OCTETS: usize = 63;
const POINTER_TAG: u8 = 0b1100_0000;

//----------- Dname -------------------------------------------------------------

/// An owned, uncompressed DNS name in wire format: a sequence of
/// length-prefixed labels terminated by a zero-length root label.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Dname {
    wire: Vec<u8>,
}

impl fmt::Debug for Dname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dname({})", self.to_text())
    }
}

impl Dname {
    pub fn root() -> Self {
        Self { wire: vec![0] }
    }

    /// Parse a presentation-format name like `"example.com."` into wire
    /// form. A trailing dot is optional; an absent one is treated as
    /// implicitly rooted, matching how zone files and configuration both
    /// write names.
    pub fn from_text(text: &str) -> Result<Self> {
        let text = text.strip_suffix('.').unwrap_or(text);
        let mut wire = Vec::with_capacity(text.len() + 2);
        if !text.is_empty() {
            for label in text.split('.') {
                if label.is_empty() || label.len() > MAX_LABEL_OCTETS {
                    return Err(WireError::NameTooLong);
                }
                wire.push(label.len() as u8);
                wire.extend_from_slice(label.as_bytes());
            }
        }
        wire.push(0);
        if wire.len() > MAX_NAME_OCTETS {
            return Err(WireError::NameTooLong);
        }
        Ok(Self { wire })
    }

    /// Build a name directly from already-validated wire bytes (used by
    /// [`Buffer::read_dname`]).
    fn from_wire_labels(wire: Vec<u8>) -> Self {
        Self { wire }
    }

    pub fn as_wire(&self) -> &[u8] {
        &self.wire
    }

    pub fn len_wire(&self) -> usize {
        self.wire.len()
    }

    pub fn to_text(&self) -> String {
        if self.wire == [0] {
            return ".".to_string();
        }
        let mut out = String::new();
        let mut i = 0;
        while i < self.wire.len() {
            let len = self.wire[i] as usize;
            if len == 0 {
                break;
            }
            i += 1;
            out.push_str(&String::from_utf8_lossy(&self.wire[i..i + len]));
            out.push('.');
            i += len;
        }
        out
    }

    /// Case-insensitive equality, per DNS name comparison rules.
    pub fn eq_ignore_case(&self, other: &Dname) -> bool {
        self.wire.eq_ignore_ascii_case(&other.wire)
    }
}

impl fmt::Display for Dname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

//----------- Buffer extension --------------------------------------------------

impl Buffer {
    /// Write a name in uncompressed wire form; internal writers never
    /// emit compression pointers.
    pub fn write_dname(&mut self, name: &Dname) -> Result<()> {
        self.write_bytes(name.as_wire())
    }

    /// Read a (possibly compressed) name starting at the current
    /// position, following pointers, and return its decompressed form.
    /// `position` after return points just past the name as it appeared
    /// at the *start* of this call (i.e. past the first pointer, if any
    /// was taken immediately).
    pub fn read_dname(&mut self) -> Result<Dname> {
        let mut out = Vec::with_capacity(32);
        let mut cursor = self.position();
        let mut visited: Vec<usize> = Vec::new();
        let mut advanced_past_first = false;
        let mut final_position = cursor;

        loop {
            let len = self.read_at_u8(cursor)?;

            if len & POINTER_TAG == POINTER_TAG {
                let lo = self.read_at_u8(cursor + 1)?;
                let pointer = (((len & !POINTER_TAG) as usize) << 8) | lo as usize;

                if !advanced_past_first {
                    final_position = cursor + 2;
                    advanced_past_first = true;
                }

                if pointer >= cursor || visited.contains(&pointer) {
                    return Err(WireError::CompressionLoop);
                }
                visited.push(pointer);
                cursor = pointer;
                continue;
            }

            if len == 0 {
                out.push(0);
                if !advanced_past_first {
                    final_position = cursor + 1;
                }
                break;
            }

            let label_len = len as usize;
            if label_len > MAX_LABEL_OCTETS {
                return Err(WireError::NameTooLong);
            }
            let label = self.read_bytes_at(cursor + 1, label_len)?;
            out.push(len);
            out.extend_from_slice(label);
            cursor += 1 + label_len;
            if !advanced_past_first {
                final_position = cursor;
            }

            if out.len() > MAX_NAME_OCTETS {
                return Err(WireError::NameTooLong);
            }
        }

        self.set_position(final_position)?;
        Ok(Dname::from_wire_labels(out))
    }

    fn read_bytes_at(&self, at: usize, n: usize) -> Result<&[u8]> {
        if at + n > self.limit() {
            return Err(WireError::Overrun);
        }
        Ok(&self.as_slice()[at..at + n])
    }

    /// Advance past a name without decompressing it: labels are walked
    /// literally, and a compression pointer (if encountered) is accepted
    /// as the name's final two octets without being followed.
    pub fn skip_dname(&mut self) -> Result<()> {
        loop {
            let len = self.read_u8()?;
            if len & POINTER_TAG == POINTER_TAG {
                self.skip(1)?;
                return Ok(());
            }
            if len == 0 {
                return Ok(());
            }
            self.skip(len as usize)?;
        }
    }

    /// Skip a full resource record: name, type, class, ttl, rdlength,
    /// rdata. Used by the journal reader and the classifier to step past
    /// RRs it doesn't need to fully parse.
    pub fn skip_rr(&mut self) -> Result<()> {
        self.skip_dname()?;
        self.skip(2 + 2 + 4)?; // type, class, ttl
        let rdlength = self.read_u16()? as usize;
        self.skip(rdlength)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_plain_name() {
        let mut buf = Buffer::new(64).unwrap();
        let name = Dname::from_text("example.com.").unwrap();
        buf.write_dname(&name).unwrap();
        buf.flip();
        let decoded = buf.read_dname().unwrap();
        assert!(decoded.eq_ignore_case(&name));
        assert_eq!(decoded.to_text(), "example.com.");
    }

    #[test]
    fn root_name_round_trips() {
        let mut buf = Buffer::new(8).unwrap();
        buf.write_dname(&Dname::root()).unwrap();
        buf.flip();
        assert_eq!(buf.read_dname().unwrap().to_text(), ".");
    }

    #[test]
    fn follows_a_compression_pointer() {
        let mut buf = Buffer::new(64).unwrap();
        let name = Dname::from_text("example.com.").unwrap();
        buf.write_dname(&name).unwrap(); // at offset 0
        let pointer_offset = buf.position();
        // A pointer back to offset 0.
        buf.write_u16(POINTER_TAG as u16 * 256).unwrap();
        buf.flip();
        buf.set_position(pointer_offset).unwrap();
        let decoded = buf.read_dname().unwrap();
        assert_eq!(decoded.to_text(), "example.com.");
    }

    #[test]
    fn rejects_a_label_over_63_octets() {
        let long_label = "a".repeat(64);
        let text = format!("{long_label}.com.");
        assert_eq!(
            Dname::from_text(&text).unwrap_err(),
            WireError::NameTooLong
        );
    }

    #[test]
    fn rejects_a_forward_pointing_pointer_as_a_loop() {
        let mut buf = Buffer::new(8).unwrap();
        buf.write_u16(POINTER_TAG as u16 * 256 + 4).unwrap(); // points forward
        buf.flip();
        assert_eq!(
            buf.read_dname().unwrap_err(),
            WireError::CompressionLoop
        );
    }
}

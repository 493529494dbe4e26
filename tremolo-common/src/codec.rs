//! Wire codec for sync payloads
//!
//! Payloads are flat little-endian byte buffers with no framing or version
//! tag of their own; fields are strictly positional. Strings and sequences
//! are length-prefixed with an i32, where `-1` encodes null. Durations are
//! a signed count of 100 ns ticks. Decoding is strict: running past the end
//! of the buffer or hitting a malformed count fails the whole payload.

use chrono::TimeDelta;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{AudioFormat, Song};
use crate::time::{delta_to_ticks, ticks_to_delta};

/// Payload decoding failure. Fatal for the payload it occurred in,
/// never for the connection carrying it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Read past the end of the payload
    #[error("unexpected end of payload at offset {offset}, needed {needed} more bytes")]
    UnexpectedEnd { offset: usize, needed: usize },

    /// Length or count prefix that is neither `-1` nor a sane non-negative value
    #[error("invalid count prefix {0}")]
    InvalidCount(i32),

    /// String bytes were not valid UTF-8
    #[error("payload string is not valid UTF-8")]
    InvalidUtf8,

    /// Null encoded where a value is required
    #[error("null {0} where a value is required")]
    UnexpectedNull(&'static str),

    /// Enum tag with no corresponding variant
    #[error("unknown {kind} tag {tag}")]
    UnknownTag { kind: &'static str, tag: i32 },
}

/// Builds a payload by appending values in wire order.
#[derive(Debug, Default, Clone)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn push_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn push_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn push_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Length-prefixed UTF-8 string; `None` is encoded as length `-1`.
    pub fn push_opt_string(&mut self, value: Option<&str>) {
        match value {
            Some(s) => {
                self.push_i32(s.len() as i32);
                self.buf.extend_from_slice(s.as_bytes());
            }
            None => self.push_i32(-1),
        }
    }

    pub fn push_string(&mut self, value: &str) {
        self.push_opt_string(Some(value));
    }

    /// 16 raw bytes, RFC byte order.
    pub fn push_uuid(&mut self, value: Uuid) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn push_delta(&mut self, value: TimeDelta) {
        self.push_i64(delta_to_ticks(value));
    }

    pub fn push_song(&mut self, song: &Song) {
        self.push_i32(song.index);
        self.push_opt_string(song.title.as_deref());
        self.push_opt_string(song.artist.as_deref());
        self.push_string(&song.full_path);
    }

    /// Count-prefixed sequence; `None` is encoded as count `-1`.
    pub fn push_seq<T>(&mut self, values: Option<&[T]>, mut push: impl FnMut(&mut Self, &T)) {
        match values {
            Some(items) => {
                self.push_i32(items.len() as i32);
                for item in items {
                    push(self, item);
                }
            }
            None => self.push_i32(-1),
        }
    }

    pub fn push_songs(&mut self, songs: Option<&[Song]>) {
        self.push_seq(songs, |w, s| w.push_song(s));
    }

    pub fn push_strings(&mut self, values: Option<&[String]>) {
        self.push_seq(values, |w, s| w.push_string(s));
    }

    pub fn push_uuids(&mut self, values: &[Uuid]) {
        self.push_seq(Some(values), |w, id| w.push_uuid(*id));
    }

    /// Raw trailing bytes without a length prefix (audio stream chunks).
    pub fn push_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed byte block.
    pub fn push_blob(&mut self, bytes: &[u8]) {
        self.push_i32(bytes.len() as i32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn push_audio_format(&mut self, format: &AudioFormat) {
        self.push_i32(format.sample_rate);
        self.push_i32(format.channels);
        self.push_i32(format.bits_per_sample);
        self.push_i32(format.block_align);
        self.push_i32(format.avg_bytes_per_sec);
        self.push_u16(format.encoding);
    }
}

/// Reads a payload front to back, tracking the current offset.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < count {
            return Err(DecodeError::UnexpectedEnd {
                offset: self.pos,
                needed: count - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(arr))
    }

    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Count prefix where `-1` means null. Anything longer than the rest of
    /// the payload could possibly hold is malformed.
    fn read_count(&mut self, element_floor: usize) -> Result<Option<usize>, DecodeError> {
        let count = self.read_i32()?;
        if count == -1 {
            return Ok(None);
        }
        if count < 0 {
            return Err(DecodeError::InvalidCount(count));
        }
        let count = count as usize;
        if count.saturating_mul(element_floor.max(1)) > self.remaining() {
            return Err(DecodeError::InvalidCount(count as i32));
        }
        Ok(Some(count))
    }

    pub fn read_opt_string(&mut self) -> Result<Option<String>, DecodeError> {
        match self.read_count(1)? {
            None => Ok(None),
            Some(len) => {
                let bytes = self.take(len)?;
                let s = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
                Ok(Some(s.to_owned()))
            }
        }
    }

    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        self.read_opt_string()?
            .ok_or(DecodeError::UnexpectedNull("string"))
    }

    pub fn read_uuid(&mut self) -> Result<Uuid, DecodeError> {
        let bytes = self.take(16)?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(bytes);
        Ok(Uuid::from_bytes(arr))
    }

    pub fn read_delta(&mut self) -> Result<TimeDelta, DecodeError> {
        Ok(ticks_to_delta(self.read_i64()?))
    }

    pub fn read_song(&mut self) -> Result<Song, DecodeError> {
        Ok(Song {
            index: self.read_i32()?,
            title: self.read_opt_string()?,
            artist: self.read_opt_string()?,
            full_path: self.read_string()?,
        })
    }

    pub fn read_seq<T>(
        &mut self,
        element_floor: usize,
        mut read: impl FnMut(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<Option<Vec<T>>, DecodeError> {
        match self.read_count(element_floor)? {
            None => Ok(None),
            Some(count) => {
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(read(self)?);
                }
                Ok(Some(items))
            }
        }
    }

    pub fn read_songs(&mut self) -> Result<Option<Vec<Song>>, DecodeError> {
        // A song is at least index + three length prefixes.
        self.read_seq(16, |r| r.read_song())
    }

    pub fn read_strings(&mut self) -> Result<Option<Vec<String>>, DecodeError> {
        self.read_seq(4, |r| r.read_string())
    }

    pub fn read_uuids(&mut self) -> Result<Vec<Uuid>, DecodeError> {
        self.read_seq(16, |r| r.read_uuid())?
            .ok_or(DecodeError::UnexpectedNull("uuid sequence"))
    }

    /// Length-prefixed byte block.
    pub fn read_blob(&mut self) -> Result<Vec<u8>, DecodeError> {
        match self.read_count(1)? {
            None => Err(DecodeError::UnexpectedNull("byte block")),
            Some(len) => Ok(self.take(len)?.to_vec()),
        }
    }

    /// All remaining bytes (audio stream chunks).
    pub fn read_raw(&mut self) -> Vec<u8> {
        let rest = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        rest
    }

    pub fn read_audio_format(&mut self) -> Result<AudioFormat, DecodeError> {
        Ok(AudioFormat {
            sample_rate: self.read_i32()?,
            channels: self.read_i32()?,
            bits_per_sample: self.read_i32()?,
            block_align: self.read_i32()?,
            avg_bytes_per_sec: self.read_i32()?,
            encoding: self.read_u16()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trips() {
        let mut w = WireWriter::new();
        w.push_bool(true);
        w.push_u16(0xBEEF);
        w.push_i32(-7);
        w.push_i64(1 << 40);
        w.push_f32(0.25);
        let buf = w.into_vec();

        let mut r = WireReader::new(&buf);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u16().unwrap(), 0xBEEF);
        assert_eq!(r.read_i32().unwrap(), -7);
        assert_eq!(r.read_i64().unwrap(), 1 << 40);
        assert_eq!(r.read_f32().unwrap(), 0.25);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_null_string_uses_negative_length() {
        let mut w = WireWriter::new();
        w.push_opt_string(None);
        let buf = w.into_vec();
        assert_eq!(buf, (-1i32).to_le_bytes());

        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_opt_string().unwrap(), None);
    }

    #[test]
    fn test_empty_string_is_not_null() {
        let mut w = WireWriter::new();
        w.push_string("");
        let buf = w.into_vec();

        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_opt_string().unwrap(), Some(String::new()));
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let mut w = WireWriter::new();
        w.push_i64(42);
        let buf = w.into_vec();

        let mut r = WireReader::new(&buf[..5]);
        let err = r.read_i64().unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEnd { .. }));
    }

    #[test]
    fn test_count_larger_than_payload_is_an_error() {
        let mut w = WireWriter::new();
        w.push_i32(1_000_000); // claims a million songs, no bytes follow
        let buf = w.into_vec();

        let mut r = WireReader::new(&buf);
        assert!(matches!(
            r.read_songs().unwrap_err(),
            DecodeError::InvalidCount(_)
        ));
    }

    #[test]
    fn test_negative_count_other_than_null_is_an_error() {
        let mut w = WireWriter::new();
        w.push_i32(-2);
        let buf = w.into_vec();

        let mut r = WireReader::new(&buf);
        assert!(matches!(
            r.read_songs().unwrap_err(),
            DecodeError::InvalidCount(-2)
        ));
    }

    #[test]
    fn test_non_utf8_string_is_an_error() {
        let mut w = WireWriter::new();
        w.push_i32(2);
        w.push_raw(&[0xFF, 0xFE]);
        let buf = w.into_vec();

        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_opt_string().unwrap_err(), DecodeError::InvalidUtf8);
    }
}

//! Stream framing for MQTT packets
//!
//! TCP hands over arbitrary chunks; [`PacketReader`] finds packet boundaries from the
//! fixed header so that each complete packet can be handed to `mqttrs::decode_slice`.

const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("incomplete packet")]
    Incomplete,
    #[error("invalid remaining length")]
    InvalidLength,
    #[error("packet rejected by the codec")]
    Codec,
}

/// Decode a remaining-length field, returning `(value, bytes used)`
pub fn read_remaining_length(bytes: &[u8]) -> Result<(usize, usize), PacketError> {
    let mut multiplier = 1;
    let mut value = 0usize;
    let mut used = 0usize;

    loop {
        let Some(&byte) = bytes.get(used) else {
            return Err(PacketError::Incomplete);
        };
        used += 1;
        value += (byte as usize & 0x7F) * multiplier;

        if value > MAX_REMAINING_LENGTH {
            return Err(PacketError::InvalidLength);
        }

        if byte & 0x80 == 0 {
            break;
        }

        multiplier *= 128;
        if used == 4 {
            return Err(PacketError::InvalidLength);
        }
    }

    Ok((value, used))
}

/// Reassembles packets from a byte stream.
///
/// Reads go straight into [`spare`](Self::spare). Packets larger than the buffer are
/// skipped in full and counted in [`dropped`](Self::dropped).
pub struct PacketReader<const N: usize> {
    buf: [u8; N],
    len: usize,
    discard: usize,
    dropped: u32,
}

impl<const N: usize> PacketReader<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            discard: 0,
            dropped: 0,
        }
    }

    /// Free space for the next read
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    /// Account for `n` bytes read into [`spare`](Self::spare)
    pub fn filled(&mut self, n: usize) {
        let start = self.len;
        self.len = (self.len + n).min(N);

        if self.discard > 0 {
            let skip = self.discard.min(self.len - start);
            self.buf.copy_within(start + skip..self.len, start);
            self.len -= skip;
            self.discard -= skip;
        }
    }

    /// Length of the complete packet at the front, if any
    pub fn frame(&mut self) -> Result<Option<usize>, PacketError> {
        if self.len < 2 {
            return Ok(None);
        }

        let (remaining, used) = match read_remaining_length(&self.buf[1..self.len]) {
            Ok(parsed) => parsed,
            Err(PacketError::Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };

        let total = 1 + used + remaining;
        if total > N {
            log::warn!("[MQTT] Dropping {} byte packet, buffer holds {}", total, N);
            self.discard = total - self.len;
            self.len = 0;
            self.dropped = self.dropped.wrapping_add(1);
            return Ok(None);
        }

        Ok((self.len >= total).then_some(total))
    }

    /// Bytes of the front packet reported by [`frame`](Self::frame)
    pub fn packet(&self, len: usize) -> &[u8] {
        &self.buf[..len.min(self.len)]
    }

    /// Remove the front packet
    pub fn consume(&mut self, len: usize) {
        let len = len.min(self.len);
        self.buf.copy_within(len..self.len, 0);
        self.len -= len;
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.discard = 0;
    }

    pub fn buffered(&self) -> usize {
        self.len
    }

    /// Oversized packets skipped so far
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

impl<const N: usize> Default for PacketReader<N> {
    fn default() -> Self {
        Self::new()
    }
}

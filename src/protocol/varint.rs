//! Base-128 varints as used by the game's tag/length encoding.

/// Longest varint accepted. Anything longer is treated as corrupt.
pub const MAX_VARINT_LEN: usize = 10;

/// Outcome of reading a varint from the front of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Varint {
    /// Decoded value and the number of bytes it occupied.
    Value(u64, usize),
    /// The buffer ends before the last byte of the varint.
    Incomplete,
    /// More than `MAX_VARINT_LEN` continuation bytes.
    Overlong,
}

pub fn read(data: &[u8]) -> Varint {
    let mut value = 0u64;
    for (i, &byte) in data.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Varint::Overlong;
        }
        value |= u64::from(byte & 0x7F) << (7 * i as u32);
        if byte & 0x80 == 0 {
            return Varint::Value(value, i + 1);
        }
    }
    if data.len() >= MAX_VARINT_LEN {
        Varint::Overlong
    } else {
        Varint::Incomplete
    }
}

/// Lenient read for field bodies that were already bounded by a length
/// prefix: truncated input yields `None`.
pub fn read_value(data: &[u8]) -> Option<(u64, usize)> {
    match read(data) {
        Varint::Value(v, n) => Some((v, n)),
        _ => None,
    }
}

pub fn write(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Number of bytes occupied by a field body of the given wire type, or
/// `None` if the body runs past the end of `data`.
pub fn field_len(wire_type: u8, data: &[u8]) -> Option<usize> {
    let len = match wire_type {
        0 => read_value(data)?.1,
        1 => 8,
        2 => {
            let (len, read) = read_value(data)?;
            read.checked_add(usize::try_from(len).ok()?)?
        }
        5 => 4,
        _ => return None,
    };
    (len <= data.len()).then_some(len)
}

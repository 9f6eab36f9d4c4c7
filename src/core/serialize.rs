// Binary codec shared by blocks, transactions and storage records

use std::io::{self, Read, Write};

use super::CodecError;

/// Types with a canonical byte encoding
pub trait Serializable: Sized {
    fn serialize(&self) -> Vec<u8>;
    fn deserialize(data: &[u8]) -> Result<Self, CodecError>;
}

/// Write a Bitcoin-style VarInt
pub fn write_varint<W: Write + ?Sized>(writer: &mut W, value: u64) -> io::Result<()> {
    match value {
        0..=0xfc => writer.write_all(&[value as u8]),
        0xfd..=0xffff => {
            writer.write_all(&[0xfd])?;
            writer.write_all(&(value as u16).to_le_bytes())
        }
        0x10000..=0xffff_ffff => {
            writer.write_all(&[0xfe])?;
            writer.write_all(&(value as u32).to_le_bytes())
        }
        _ => {
            writer.write_all(&[0xff])?;
            writer.write_all(&value.to_le_bytes())
        }
    }
}

pub fn read_varint<R: Read + ?Sized>(reader: &mut R) -> io::Result<u64> {
    let [prefix] = read_array::<1, R>(reader)?;
    match prefix {
        0xfd => Ok(u16::from_le_bytes(read_array(reader)?) as u64),
        0xfe => Ok(u32::from_le_bytes(read_array(reader)?) as u64),
        0xff => Ok(u64::from_le_bytes(read_array(reader)?)),
        small => Ok(small as u64),
    }
}

/// Length-prefixed byte string
pub fn write_var_bytes<W: Write + ?Sized>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    write_varint(writer, data.len() as u64)?;
    writer.write_all(data)
}

pub fn read_var_bytes<R: Read + ?Sized>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = read_varint(reader)? as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok(data)
}

pub fn read_array<const N: usize, R: Read + ?Sized>(reader: &mut R) -> io::Result<[u8; N]> {
    let mut bytes = [0u8; N];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encoded_len(value: u64) -> usize {
        let mut buf = Vec::new();
        write_varint(&mut buf, value).unwrap();
        buf.len()
    }

    #[test]
    fn test_varint_widths() {
        assert_eq!(encoded_len(0xfc), 1);
        assert_eq!(encoded_len(0xfd), 3);
        assert_eq!(encoded_len(100_000), 5);
        assert_eq!(encoded_len(u64::MAX), 9);
    }

    #[test]
    fn test_varint_decodes_what_it_encodes() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 1000).unwrap();
        write_varint(&mut buf, 7).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_varint(&mut cursor).unwrap(), 1000);
        assert_eq!(read_varint(&mut cursor).unwrap(), 7);
    }

    #[test]
    fn test_var_bytes_truncated_input() {
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, b"hello world").unwrap();
        buf.truncate(5);

        let mut cursor = Cursor::new(buf);
        assert!(read_var_bytes(&mut cursor).is_err());
    }
}

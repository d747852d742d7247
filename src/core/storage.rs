use std::io::{self, Read, Write};

pub const MAGIC: &[u8; 8] = b"LMART001";
pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

/// Largest uncompressed chunk we agree to inflate (guards corrupt headers).
pub const MAX_CHUNK_BYTES: usize = 1 << 30;

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    // Strict format: raw LZ4 block with external expected size.
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

pub struct CountingWriter {
    written: usize,
}

impl CountingWriter {
    pub fn new() -> Self {
        Self { written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl Default for CountingWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written = self.written.saturating_add(buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f64_le<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    Ok(read_exact::<1, _>(r)?[0])
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_f64_le<R: Read>(r: &mut R) -> io::Result<f64> {
    Ok(f64::from_le_bytes(read_exact::<8, _>(r)?))
}

/// `usize` -> `u32` for length fields.
pub fn len_u32(n: usize) -> io::Result<u32> {
    u32::try_from(n).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "length too large"))
}

/// Write a chunk whose payload is LZ4-compressed and preceded by the uncompressed length.
///
/// Layout:
/// - tag: [u8;4]
/// - len: u32 (bytes following, including the 4-byte uncompressed length)
/// - uncompressed_len: u32
/// - compressed payload bytes
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = len_u32(payload.len())?;
    let total_len = 4u32.saturating_add(len_u32(compressed.len())?);

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// Read and inflate the body of a chunk written by [`write_chunk_lz4`].
pub fn read_chunk_payload<R: Read>(r: &mut R, len: u32) -> io::Result<Vec<u8>> {
    let mut take = r.take(len as u64);
    let uncompressed_len = read_u32_le(&mut take)? as usize;
    if uncompressed_len > MAX_CHUNK_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk exceeds size limit",
        ));
    }
    let mut compressed = Vec::with_capacity((len as usize).saturating_sub(4));
    take.read_to_end(&mut compressed)?;
    decompress_lz4(&compressed, uncompressed_len)
}

/// Skip a chunk body without inflating it.
pub fn skip_chunk<R: Read>(r: &mut R, len: u32) -> io::Result<()> {
    let mut take = r.take(len as u64);
    io::copy(&mut take, &mut io::sink())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_roundtrip_and_skip() {
        let mut buf = Vec::new();
        write_chunk_lz4(&mut buf, *b"AAAA", &[7u8; 300]).unwrap();
        write_chunk_lz4(&mut buf, *b"BBBB", b"hello").unwrap();

        let mut r = io::Cursor::new(buf);
        let (tag, len) = read_chunk_header(&mut r).unwrap();
        assert_eq!(&tag, b"AAAA");
        skip_chunk(&mut r, len).unwrap();

        let (tag, len) = read_chunk_header(&mut r).unwrap();
        assert_eq!(&tag, b"BBBB");
        assert_eq!(read_chunk_payload(&mut r, len).unwrap(), b"hello");
        assert!(read_chunk_header(&mut r).is_err());
    }

    #[test]
    fn counting_writer_counts() {
        let mut w = CountingWriter::new();
        write_u32_le(&mut w, 1).unwrap();
        write_f64_le(&mut w, 1.0).unwrap();
        assert_eq!(w.written(), 12);
    }
}

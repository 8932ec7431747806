//! Chunked transfer coding (RFC 9112 section 7.1).

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

const MAX_LINE: usize = 16 * 1024;

pub(crate) async fn write_chunk<W>(io: &mut W, data: &Bytes) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
    io.write_all(data).await?;
    io.write_all(b"\r\n").await
}

pub(crate) async fn write_last_chunk<W>(io: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(b"0\r\n\r\n").await
}

/// Reads one `\r\n`-terminated line, without the terminator.
pub(crate) async fn read_line<R>(io: &mut R) -> crate::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = io
        .take(MAX_LINE as u64 + 2)
        .read_until(b'\n', &mut line)
        .await
        .map_err(Error::decode)?;
    if n == 0 {
        return Err(Error::decode(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed mid-message",
        )));
    }
    if !line.ends_with(b"\n") {
        return Err(Error::decode("header line too long or unterminated"));
    }
    line.pop();
    if line.ends_with(b"\r") {
        line.pop();
    }
    Ok(line)
}

/// Parses the `size[;extensions]` line starting a chunk.
pub(crate) async fn read_chunk_size<R>(io: &mut R) -> crate::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(io).await?;
    let size_part = line
        .split(|b| *b == b';')
        .next()
        .unwrap_or_default();
    let text = std::str::from_utf8(size_part)
        .map_err(|_| Error::decode("malformed chunk size"))?
        .trim();
    u64::from_str_radix(text, 16).map_err(|_| Error::decode("malformed chunk size"))
}

/// Consumes the CRLF that terminates a chunk's data.
pub(crate) async fn read_chunk_end<R>(io: &mut R) -> crate::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(io).await?;
    if line.is_empty() {
        Ok(())
    } else {
        Err(Error::decode("missing CRLF after chunk data"))
    }
}

/// Discards trailer lines after the last chunk, up to the blank line.
pub(crate) async fn discard_trailers<R>(io: &mut R) -> crate::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = read_line(io).await?;
        if line.is_empty() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn chunk_size_line_with_extension() {
        let mut io = BufReader::new(Cursor::new(&b"1a;name=value\r\n"[..]));
        assert_eq!(read_chunk_size(&mut io).await.unwrap(), 0x1a);
    }

    #[tokio::test]
    async fn chunk_size_rejects_garbage() {
        let mut io = BufReader::new(Cursor::new(&b"zz\r\n"[..]));
        assert!(read_chunk_size(&mut io).await.is_err());
    }

    #[tokio::test]
    async fn writer_emits_sized_chunks() {
        let mut out = Vec::new();
        write_chunk(&mut out, &Bytes::from_static(b"hello")).await.unwrap();
        write_last_chunk(&mut out).await.unwrap();
        assert_eq!(out, b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn trailers_are_discarded() {
        let mut io = BufReader::new(Cursor::new(&b"x-checksum: 1\r\n\r\nrest"[..]));
        discard_trailers(&mut io).await.unwrap();
        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut io, &mut rest)
            .await
            .unwrap();
        assert_eq!(rest, b"rest");
    }
}

//! Directional stream copier.
//!
//! A relay exchange runs one copier per direction and is finished only when
//! both directions have finished. [`copy_bytes`] is the byte-accurate
//! default; [`copy_lines`] is the legacy content-rewriting mode that feeds
//! each line through an injectable transform, used when a proxied
//! application was not designed to run behind a path prefix.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copy bytes from `reader` to `writer` until end-of-stream, then flush and
/// shut the writer down to signal completion. Returns the byte count.
pub async fn copy_bytes<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(total)
}

/// Copy line-wise from `reader` to `writer`, passing each line (newline
/// included) through `transform`. Non-UTF-8 input is converted lossily —
/// this mode is only meant for text responses.
pub async fn copy_lines<R, W, F>(
    mut reader: R,
    mut writer: W,
    mut transform: F,
) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(&str) -> String,
{
    let mut raw = Vec::new();
    let mut total = 0u64;
    loop {
        raw.clear();
        let n = reader.read_until(b'\n', &mut raw).await?;
        if n == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&raw);
        let out = transform(&line);
        writer.write_all(out.as_bytes()).await?;
        total += out.len() as u64;
    }
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    #[tokio::test]
    async fn test_copy_bytes_round_trip() {
        let input: &[u8] = b"hello tunnel";
        let (writer, mut read_end) = tokio::io::duplex(64);
        let copied = copy_bytes(input, writer).await.unwrap();
        assert_eq!(copied, 12);

        let mut out = Vec::new();
        read_end.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn test_copy_bytes_empty_stream() {
        let input: &[u8] = b"";
        let (writer, mut read_end) = tokio::io::duplex(64);
        assert_eq!(copy_bytes(input, writer).await.unwrap(), 0);
        let mut out = Vec::new();
        read_end.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_copy_lines_applies_transform() {
        let input: &[u8] = b"one\ntwo\nthree";
        let (writer, mut read_end) = tokio::io::duplex(64);
        copy_lines(BufReader::new(input), writer, |line| line.to_uppercase())
            .await
            .unwrap();

        let mut out = String::new();
        read_end.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "ONE\nTWO\nTHREE");
    }

    #[tokio::test]
    async fn test_copy_lines_preserves_newlines_verbatim() {
        let input: &[u8] = b"a\r\nb\n";
        let (writer, mut read_end) = tokio::io::duplex(64);
        copy_lines(BufReader::new(input), writer, |line| line.to_string())
            .await
            .unwrap();

        let mut out = String::new();
        read_end.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "a\r\nb\n");
    }
}

//! Splits one byte stream into a plain log stream and an out-of-band stream.
//!
//! Out-of-band messages are written by the device as
//! `MAGIC_TOKEN base64(payload) \n`. Everything else is plain output.
//!
//! Limitation: plain output that happens to contain the literal token is
//! taken for an out-of-band message. The token is chosen to make that
//! unlikely, not impossible.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::chan::{self, ChanReader, ChanWriter, Offer};

/// Escape token that introduces an out-of-band message.
pub const MAGIC_TOKEN: &[u8] = b"Jag15261520";

/// Longest base64 line accepted after a token before it is dropped.
const MAX_OOB_LINE: usize = 128 * 1024;

/// Chunks buffered per derived stream.
const STREAM_DEPTH: usize = 64;

/// Output of one [`Demux::push`] step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Bytes that belong to the plain stream.
    Plain(Vec<u8>),
    /// A decoded out-of-band payload.
    OutOfBand(Vec<u8>),
}

/// Incremental token scanner.
///
/// Holds back only bytes that may still turn out to be part of a token or
/// of an unterminated out-of-band line.
#[derive(Debug, Default)]
pub struct Demux {
    buf: Vec<u8>,
}

impl Demux {
    /// Creates an empty scanner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `data` and returns every segment that can be decided so far.
    pub fn push(&mut self, data: &[u8]) -> Vec<Segment> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        let mut plain = Vec::new();
        let mut start = 0;

        loop {
            let rest = &self.buf[start..];
            let Some(at) = rest.iter().position(|&b| b == MAGIC_TOKEN[0]) else {
                plain.extend_from_slice(rest);
                start = self.buf.len();
                break;
            };
            plain.extend_from_slice(&rest[..at]);
            start += at;
            let candidate = &self.buf[start..];

            if candidate.len() < MAGIC_TOKEN.len() {
                if MAGIC_TOKEN.starts_with(candidate) {
                    break;
                }
                plain.push(candidate[0]);
                start += 1;
                continue;
            }
            if !candidate.starts_with(MAGIC_TOKEN) {
                plain.push(candidate[0]);
                start += 1;
                continue;
            }

            let body = &candidate[MAGIC_TOKEN.len()..];
            let Some(nl) = body.iter().position(|&b| b == b'\n') else {
                if body.len() > MAX_OOB_LINE {
                    start = self.buf.len();
                }
                break;
            };
            let line = body[..nl].strip_suffix(b"\r").unwrap_or(&body[..nl]);
            if let Ok(decoded) = BASE64.decode(line) {
                if !plain.is_empty() {
                    out.push(Segment::Plain(std::mem::take(&mut plain)));
                }
                out.push(Segment::OutOfBand(decoded));
            }
            start += MAGIC_TOKEN.len() + nl + 1;
        }

        if !plain.is_empty() {
            out.push(Segment::Plain(plain));
        }
        self.buf.drain(..start);
        out
    }

    /// Returns held-back bytes once the source has ended.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

/// Encodes `payload` as an out-of-band message line.
pub fn encode_oob(payload: &[u8]) -> Vec<u8> {
    let mut line = MAGIC_TOKEN.to_vec();
    line.extend_from_slice(BASE64.encode(payload).as_bytes());
    line.push(b'\n');
    line
}

/// Splits `source` into `(plain, out_of_band)` streams.
///
/// A background task reads `source` until it ends. Each derived stream is
/// read independently: out-of-band delivery waits for its reader, while
/// plain output that finds its queue full is dropped, so unread logs never
/// hold back protocol traffic. A read error on the source reaches both.
pub fn multiplex<R>(source: R) -> (ChanReader, ChanReader)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (plain_tx, plain_rx) = chan::channel(STREAM_DEPTH);
    let (oob_tx, oob_rx) = chan::channel(STREAM_DEPTH);
    tokio::spawn(pump(source, plain_tx, oob_tx));
    (plain_rx, oob_rx)
}

async fn pump<R>(mut source: R, plain: ChanWriter, oob: ChanWriter)
where
    R: AsyncRead + Unpin,
{
    let mut demux = Demux::new();
    let mut buf = vec![0u8; 4096];
    let mut dropped = 0usize;
    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for segment in demux.push(&buf[..n]) {
                    match segment {
                        Segment::Plain(bytes) => {
                            let len = bytes.len();
                            if plain.offer(bytes) == Offer::Full {
                                dropped += len;
                            } else if dropped > 0 {
                                debug!(dropped, "plain stream was not read; output dropped");
                                dropped = 0;
                            }
                        }
                        // A dropped consumer only silences its own stream.
                        Segment::OutOfBand(bytes) => {
                            oob.send(bytes).await;
                        }
                    }
                }
                if plain.is_closed() && oob.is_closed() {
                    return;
                }
            }
            Err(e) => {
                let kind = e.kind();
                let msg = e.to_string();
                oob.fail(std::io::Error::new(kind, msg.clone())).await;
                plain.offer_error(std::io::Error::new(kind, msg));
                return;
            }
        }
    }
    if let Some(rest) = demux.finish() {
        plain.offer(rest);
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadBuf};

    use super::*;

    /// Source whose every read fails.
    struct Unplugged;

    impl AsyncRead for Unplugged {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "unplugged")))
        }
    }

    fn collect(segments: Vec<Segment>, plain: &mut Vec<u8>, oob: &mut Vec<Vec<u8>>) {
        for s in segments {
            match s {
                Segment::Plain(b) => plain.extend(b),
                Segment::OutOfBand(b) => oob.push(b),
            }
        }
    }

    fn scenario() -> (Vec<u8>, Vec<u8>, Vec<Vec<u8>>) {
        let messages = vec![b"\x05\x00\x02abcd\n".to_vec(), vec![0xFF, 0x00, 0x02], Vec::new()];
        let plain = b"boot: ok\nJ is for Jag1526 and J\nready\n".to_vec();
        let mut stream = Vec::new();
        stream.extend_from_slice(&plain[..9]);
        stream.extend(encode_oob(&messages[0]));
        stream.extend_from_slice(&plain[9..20]);
        stream.extend(encode_oob(&messages[1]));
        stream.extend_from_slice(&plain[20..]);
        stream.extend(encode_oob(&messages[2]));
        (stream, plain, messages)
    }

    #[test]
    fn separates_streams_in_one_push() {
        let (stream, plain, messages) = scenario();
        let mut demux = Demux::new();
        let (mut got_plain, mut got_oob) = (Vec::new(), Vec::new());
        collect(demux.push(&stream), &mut got_plain, &mut got_oob);
        assert!(demux.finish().is_none());
        assert_eq!(got_plain, plain);
        assert_eq!(got_oob, messages);
    }

    #[test]
    fn token_split_across_every_boundary() {
        let (stream, plain, messages) = scenario();
        for step in 1..=13 {
            let mut demux = Demux::new();
            let (mut got_plain, mut got_oob) = (Vec::new(), Vec::new());
            for piece in stream.chunks(step) {
                collect(demux.push(piece), &mut got_plain, &mut got_oob);
            }
            if let Some(rest) = demux.finish() {
                got_plain.extend(rest);
            }
            assert_eq!(got_plain, plain, "step {step}");
            assert_eq!(got_oob, messages, "step {step}");
        }
    }

    #[test]
    fn near_miss_prefix_stays_plain() {
        let mut demux = Demux::new();
        let mut got = Vec::new();
        collect(demux.push(b"Jag1526"), &mut got, &mut Vec::new());
        assert!(got.is_empty());
        collect(demux.push(b"X tail"), &mut got, &mut Vec::new());
        assert_eq!(got, b"Jag1526X tail");
    }

    #[test]
    fn undecodable_line_is_dropped() {
        let mut demux = Demux::new();
        let (mut plain, mut oob) = (Vec::new(), Vec::new());
        let mut input = MAGIC_TOKEN.to_vec();
        input.extend_from_slice(b"!!not base64!!\nafter");
        collect(demux.push(&input), &mut plain, &mut oob);
        assert!(oob.is_empty());
        assert_eq!(plain, b"after");
    }

    #[test]
    fn waits_for_newline_after_token() {
        let mut demux = Demux::new();
        let mut line = encode_oob(b"payload");
        let tail = line.split_off(line.len() - 3);
        assert!(demux.push(&line).is_empty());
        assert_eq!(
            demux.push(&tail),
            vec![Segment::OutOfBand(b"payload".to_vec())]
        );
    }

    #[tokio::test]
    async fn streams_are_read_independently() {
        let (mut device, host) = tokio::io::duplex(256);
        let (mut plain, mut oob) = multiplex(host);

        device.write_all(b"log line\n").await.unwrap();
        device.write_all(&encode_oob(b"first")).await.unwrap();
        device.write_all(&encode_oob(b"second")).await.unwrap();
        device.write_all(b"more log\n").await.unwrap();
        drop(device);

        let mut got_oob = Vec::new();
        oob.read_to_end(&mut got_oob).await.unwrap();
        assert_eq!(got_oob, b"firstsecond");

        let mut got_plain = String::new();
        plain.read_to_string(&mut got_plain).await.unwrap();
        assert_eq!(got_plain, "log line\nmore log\n");
    }

    #[tokio::test]
    async fn unread_logs_do_not_block_responses() {
        let (mut device, host) = tokio::io::duplex(1024);
        let (_plain, mut oob) = multiplex(host);

        for i in 0..200 {
            device.write_all(format!("log line {i}\n").as_bytes()).await.unwrap();
        }
        device.write_all(&encode_oob(b"resp")).await.unwrap();

        let mut got = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(2), oob.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, b"resp");
    }

    #[tokio::test]
    async fn source_error_reaches_both_streams() {
        let (mut plain, mut oob) = multiplex(Unplugged);
        let mut buf = [0u8; 8];
        let err = oob.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        let err = plain.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}

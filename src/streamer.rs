//! Bounded, decode-safe streaming of subprocess output.
//!
//! Turns raw pipe bytes into a lazy sequence of text fragments. Each pull
//! reads at most `buffer_size` bytes; a running byte counter enforces
//! `max_output_size` per stream, after which a single truncation marker is
//! emitted and the stream ends. Read errors become inline marker fragments
//! rather than surfacing to the consumer.

use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::ExecError;

/// Which side of a subprocess a fragment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

pub type OutputStream = Pin<Box<dyn Stream<Item = String> + Send>>;
pub type PairedOutputStream = Pin<Box<dyn Stream<Item = (String, String)> + Send>>;

fn truncation_marker(limit: usize) -> String {
    format!("\n[OUTPUT TRUNCATED: exceeded {limit} bytes]")
}

/// Per-pipe read state threaded through the lazy stream.
struct Channel<R> {
    pipe: R,
    total: usize,
    done: bool,
}

impl<R> Channel<R> {
    fn new(pipe: R) -> Self {
        Self {
            pipe,
            total: 0,
            done: false,
        }
    }
}

/// Fold one read outcome into the channel state, producing the fragment to
/// yield, if any. EOF yields nothing; crossing the output ceiling yields
/// the retained prefix plus the truncation marker and closes the channel;
/// a read error yields an inline error marker and closes the channel.
fn ingest<R>(
    channel: &mut Channel<R>,
    buf: &[u8],
    read: std::io::Result<usize>,
    max_output_size: usize,
) -> Option<String> {
    match read {
        Ok(0) => {
            channel.done = true;
            None
        }
        Ok(n) => {
            channel.total += n;
            if channel.total > max_output_size {
                channel.done = true;
                let kept = n - (channel.total - max_output_size);
                let mut text = String::from_utf8_lossy(&buf[..kept]).into_owned();
                text.push_str(&truncation_marker(max_output_size));
                debug!(
                    limit = max_output_size,
                    "output ceiling reached, truncating stream"
                );
                Some(text)
            } else {
                Some(String::from_utf8_lossy(&buf[..n]).into_owned())
            }
        }
        Err(e) => {
            channel.done = true;
            Some(format!("[STREAM ERROR: {e}]"))
        }
    }
}

/// Lazy, bounded reader for subprocess pipes.
#[derive(Debug, Clone)]
pub struct OutputStreamer {
    buffer_size: usize,
    max_output_size: usize,
}

impl OutputStreamer {
    /// Rejects a non-positive buffer size; this is the one place the crate
    /// fails fast instead of degrading into a result.
    pub fn new(buffer_size: usize, max_output_size: usize) -> Result<Self, ExecError> {
        if buffer_size == 0 {
            return Err(ExecError::Config {
                message: format!("buffer size must be positive, got {buffer_size}"),
            });
        }
        debug!(buffer_size, max_output_size, "output streamer initialized");
        Ok(Self {
            buffer_size,
            max_output_size,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn max_output_size(&self) -> usize {
        self.max_output_size
    }

    /// Adjust the per-read buffer size at runtime. Same validation as the
    /// constructor.
    pub fn set_buffer_size(&mut self, buffer_size: usize) -> Result<(), ExecError> {
        if buffer_size == 0 {
            return Err(ExecError::Config {
                message: format!("buffer size must be positive, got {buffer_size}"),
            });
        }
        self.buffer_size = buffer_size;
        Ok(())
    }

    /// Stream a pipe as text fragments. Finite and not restartable:
    /// consuming the stream drains the underlying pipe. Errors never
    /// escape the iteration; they end the stream after an inline marker.
    pub fn stream<R>(&self, pipe: R) -> OutputStream
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let buffer_size = self.buffer_size;
        let max_output_size = self.max_output_size;
        Box::pin(futures::stream::unfold(
            Channel::new(pipe),
            move |mut channel| async move {
                if channel.done {
                    return None;
                }
                let mut buf = vec![0u8; buffer_size];
                let read = channel.pipe.read(&mut buf).await;
                ingest(&mut channel, &buf, read, max_output_size)
                    .map(|fragment| (fragment, channel))
            },
        ))
    }

    /// Eagerly drain a pipe to completion under the output ceiling.
    pub async fn capture<R>(&self, pipe: R) -> String
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut stream = self.stream(pipe);
        let mut out = String::new();
        while let Some(fragment) = stream.next().await {
            out.push_str(&fragment);
        }
        out
    }

    /// Drain both pipes of a subprocess concurrently. Either side may be
    /// absent; absent sides capture as empty.
    pub async fn capture_both<O, E>(&self, stdout: Option<O>, stderr: Option<E>) -> (String, String)
    where
        O: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        let stdout_fut = async {
            match stdout {
                Some(pipe) => self.capture(pipe).await,
                None => String::new(),
            }
        };
        let stderr_fut = async {
            match stderr {
                Some(pipe) => self.capture(pipe).await,
                None => String::new(),
            }
        };
        tokio::join!(stdout_fut, stderr_fut)
    }

    /// Stream two pipes concurrently as (stdout, stderr) fragment pairs.
    ///
    /// Fairness between the channels is best-effort; no ordering guarantee
    /// holds across channels, only within each. A fragment carries text on
    /// the side that produced it and an empty string on the other. Each
    /// channel has its own output ceiling and truncation marker. The
    /// stream ends once both channels are exhausted.
    pub fn stream_separated<O, E>(&self, stdout: O, stderr: E) -> PairedOutputStream
    where
        O: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        let buffer_size = self.buffer_size;
        let max_output_size = self.max_output_size;

        struct Separated<O, E> {
            stdout: Channel<O>,
            stderr: Channel<E>,
        }

        Box::pin(futures::stream::unfold(
            Separated {
                stdout: Channel::new(stdout),
                stderr: Channel::new(stderr),
            },
            move |mut state| async move {
                loop {
                    if state.stdout.done && state.stderr.done {
                        return None;
                    }
                    let mut out_buf = vec![0u8; buffer_size];
                    let mut err_buf = vec![0u8; buffer_size];

                    if state.stderr.done {
                        let read = state.stdout.pipe.read(&mut out_buf).await;
                        match ingest(&mut state.stdout, &out_buf, read, max_output_size) {
                            Some(fragment) => return Some(((fragment, String::new()), state)),
                            None => continue,
                        }
                    } else if state.stdout.done {
                        let read = state.stderr.pipe.read(&mut err_buf).await;
                        match ingest(&mut state.stderr, &err_buf, read, max_output_size) {
                            Some(fragment) => return Some(((String::new(), fragment), state)),
                            None => continue,
                        }
                    } else {
                        tokio::select! {
                            read = state.stdout.pipe.read(&mut out_buf) => {
                                match ingest(&mut state.stdout, &out_buf, read, max_output_size) {
                                    Some(fragment) => return Some(((fragment, String::new()), state)),
                                    None => continue,
                                }
                            }
                            read = state.stderr.pipe.read(&mut err_buf) => {
                                match ingest(&mut state.stderr, &err_buf, read, max_output_size) {
                                    Some(fragment) => return Some(((String::new(), fragment), state)),
                                    None => continue,
                                }
                            }
                        }
                    }
                }
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    fn streamer(buffer_size: usize, max_output_size: usize) -> OutputStreamer {
        OutputStreamer::new(buffer_size, max_output_size).unwrap()
    }

    async fn collect(stream: OutputStream) -> Vec<String> {
        stream.collect().await
    }

    /// Reader that yields one chunk and then fails.
    struct FailingReader {
        served: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let me = self.get_mut();
            if me.served {
                Poll::Ready(Err(std::io::Error::other("pipe exploded")))
            } else {
                me.served = true;
                buf.put_slice(b"partial ");
                Poll::Ready(Ok(()))
            }
        }
    }

    #[test]
    fn rejects_zero_buffer_size() {
        assert!(matches!(
            OutputStreamer::new(0, 1024),
            Err(ExecError::Config { .. })
        ));
    }

    #[test]
    fn set_buffer_size_validates() {
        let mut s = streamer(1024, 4096);
        s.set_buffer_size(2048).unwrap();
        assert_eq!(s.buffer_size(), 2048);
        assert!(s.set_buffer_size(0).is_err());
        assert_eq!(s.buffer_size(), 2048);
    }

    #[tokio::test]
    async fn streams_in_buffer_sized_chunks() {
        let s = streamer(4, 1024);
        let data = Cursor::new(b"abcdefghij".to_vec());
        let chunks = collect(s.stream(data)).await;
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.len() <= 4));
        assert_eq!(chunks.concat(), "abcdefghij");
    }

    #[tokio::test]
    async fn empty_pipe_yields_nothing() {
        let s = streamer(64, 1024);
        let chunks = collect(s.stream(Cursor::new(Vec::new()))).await;
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn truncates_with_single_marker() {
        let s = streamer(16, 50);
        let data = Cursor::new(vec![b'x'; 200]);
        let chunks = collect(s.stream(data)).await;
        let total = chunks.concat();
        let marker = truncation_marker(50);
        assert_eq!(total.matches("[OUTPUT TRUNCATED").count(), 1);
        assert!(total.ends_with(&marker));
        let payload_len = total.len() - marker.len();
        assert!(payload_len <= 50, "payload {payload_len} exceeds ceiling");
    }

    #[tokio::test]
    async fn capture_applies_ceiling() {
        let s = streamer(16, 50);
        let out = s.capture(Cursor::new(vec![b'y'; 200])).await;
        assert!(out.contains("[OUTPUT TRUNCATED"));

        let s = streamer(16, 1024);
        let out = s.capture(Cursor::new(b"hello world".to_vec())).await;
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn lossy_decode_of_invalid_utf8() {
        let s = streamer(64, 1024);
        let out = s
            .capture(Cursor::new(vec![0x00, 0x01, 0xff, 0xfe, b'o', b'k']))
            .await;
        assert!(out.contains('\u{FFFD}'));
        assert!(out.contains("ok"));
    }

    #[tokio::test]
    async fn unicode_survives_capture() {
        let s = streamer(64, 1024);
        let text = "Hello 世界 🌍";
        let out = s.capture(Cursor::new(text.as_bytes().to_vec())).await;
        assert_eq!(out, text);
    }

    #[tokio::test]
    async fn read_error_becomes_inline_marker() {
        let s = streamer(64, 1024);
        let chunks = collect(s.stream(FailingReader { served: false })).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "partial ");
        assert!(chunks[1].starts_with("[STREAM ERROR:"));
        assert!(chunks[1].contains("pipe exploded"));
    }

    #[tokio::test]
    async fn capture_both_keeps_channels_apart() {
        let s = streamer(64, 1024);
        let (out, err) = s
            .capture_both(
                Some(Cursor::new(b"to stdout".to_vec())),
                Some(Cursor::new(b"to stderr".to_vec())),
            )
            .await;
        assert_eq!(out, "to stdout");
        assert_eq!(err, "to stderr");
    }

    #[tokio::test]
    async fn capture_both_tolerates_missing_sides() {
        let s = streamer(64, 1024);
        let (out, err) = s
            .capture_both::<Cursor<Vec<u8>>, Cursor<Vec<u8>>>(None, None)
            .await;
        assert_eq!(out, "");
        assert_eq!(err, "");
    }

    #[tokio::test]
    async fn separated_streaming_pairs_by_source() {
        let s = streamer(64, 1024);
        let pairs: Vec<(String, String)> = s
            .stream_separated(
                Cursor::new(b"out data".to_vec()),
                Cursor::new(b"err data".to_vec()),
            )
            .collect()
            .await;

        let stdout: String = pairs.iter().map(|(o, _)| o.as_str()).collect();
        let stderr: String = pairs.iter().map(|(_, e)| e.as_str()).collect();
        assert_eq!(stdout, "out data");
        assert_eq!(stderr, "err data");
        // every pair has exactly one populated side
        assert!(pairs
            .iter()
            .all(|(o, e)| o.is_empty() != e.is_empty() || (o.is_empty() && e.is_empty())));
    }

    #[tokio::test]
    async fn separated_streaming_truncates_each_channel_independently() {
        let s = streamer(16, 40);
        let pairs: Vec<(String, String)> = s
            .stream_separated(
                Cursor::new(vec![b'a'; 100]),
                Cursor::new(b"short".to_vec()),
            )
            .collect()
            .await;

        let stdout: String = pairs.iter().map(|(o, _)| o.as_str()).collect();
        let stderr: String = pairs.iter().map(|(_, e)| e.as_str()).collect();
        assert_eq!(stdout.matches("[OUTPUT TRUNCATED").count(), 1);
        assert_eq!(stderr, "short");
    }
}

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::path::Path;

use tokio::sync::mpsc;

/// Result of one non-blocking read from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRead {
    /// This many samples were written to the front of the buffer.
    Samples(usize),
    /// Nothing available right now; a live source may produce more later.
    Pending,
    End,
}

/// Lazy sequence of interleaved 48 kHz stereo `i16` samples. Finite sources
/// end with [`SourceRead::End`]; live ones may return `Pending` indefinitely.
pub trait AudioSource: Send {
    fn read(&mut self, buf: &mut [i16]) -> SourceRead;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// `buf` holds a full frame; a short tail was zero-padded.
    Ready,
    /// Live source had nothing for this slot.
    Underrun,
    Finished,
}

/// Fill `buf` with exactly one frame from `source`.
pub fn next_frame(source: &mut dyn AudioSource, buf: &mut [i16]) -> FrameStatus {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            SourceRead::Samples(0) => continue,
            SourceRead::Samples(n) => filled += n.min(buf.len() - filled),
            SourceRead::Pending if filled == 0 => return FrameStatus::Underrun,
            SourceRead::End if filled == 0 => return FrameStatus::Finished,
            SourceRead::Pending | SourceRead::End => break,
        }
    }
    buf[filled..].fill(0);
    FrameStatus::Ready
}

/// Adapts any sample iterator.
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = i16> + Send,
{
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

impl<I> AudioSource for IterSource<I>
where
    I: Iterator<Item = i16> + Send,
{
    fn read(&mut self, buf: &mut [i16]) -> SourceRead {
        let mut n = 0;
        for (slot, sample) in buf.iter_mut().zip(&mut self.iter) {
            *slot = sample;
            n += 1;
        }
        if n == 0 {
            SourceRead::End
        } else {
            SourceRead::Samples(n)
        }
    }
}

/// Live source fed through a channel, e.g. from a capture or TTS task.
/// Dropping every sender ends it.
pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<i16>>,
    pending: Vec<i16>,
    offset: usize,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Vec<i16>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            offset: 0,
        }
    }

    pub fn channel(buffer: usize) -> (mpsc::Sender<Vec<i16>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }
}

impl AudioSource for ChannelSource {
    fn read(&mut self, buf: &mut [i16]) -> SourceRead {
        while self.offset >= self.pending.len() {
            match self.rx.try_recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Err(mpsc::error::TryRecvError::Empty) => return SourceRead::Pending,
                Err(mpsc::error::TryRecvError::Disconnected) => return SourceRead::End,
            }
        }
        let available = &self.pending[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        SourceRead::Samples(n)
    }
}

/// Raw signed 16-bit little-endian PCM, 48 kHz stereo, no container.
pub struct PcmReader<R> {
    reader: R,
    bytes: Vec<u8>,
}

impl PcmReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read + Send> PcmReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            bytes: Vec::new(),
        }
    }
}

impl<R: Read + Send> AudioSource for PcmReader<R> {
    fn read(&mut self, buf: &mut [i16]) -> SourceRead {
        self.bytes.resize(buf.len() * 2, 0);
        let mut filled = 0;
        while filled < self.bytes.len() {
            match self.reader.read(&mut self.bytes[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("pcm source read failed, ending playback: {e}");
                    break;
                }
            }
        }
        // a dangling odd byte at EOF is dropped
        let samples = filled / 2;
        for (slot, pair) in buf.iter_mut().zip(self.bytes[..samples * 2].chunks_exact(2)) {
            *slot = i16::from_le_bytes([pair[0], pair[1]]);
        }
        if samples == 0 {
            SourceRead::End
        } else {
            SourceRead::Samples(samples)
        }
    }
}

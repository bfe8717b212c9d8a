//! WAV recorder — streams the master mix to a 32-bit float stereo file.
//!
//! The header is written up front with zero lengths and patched when the
//! recording ends. Frames are interleaved right channel first.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Size of the header written before the sample data.
pub const HEADER_LEN: u64 = 46;

const RIFF_SIZE_OFFSET: u64 = 4;
const DATA_SIZE_OFFSET: u64 = 42;
const BYTES_PER_FRAME: u32 = 8;

#[derive(Debug)]
pub struct WavRecorder {
    path: PathBuf,
    writer: BufWriter<File>,
    sample_rate: u32,
    data_len: u32,
}

impl WavRecorder {
    /// Create `path` and write a header with placeholder lengths.
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(&header(sample_rate, 0))?;
        Ok(WavRecorder {
            path,
            writer,
            sample_rate,
            data_len: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Bytes of sample data written so far.
    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    /// Append one block of frames.
    pub fn write(&mut self, left: &[f32], right: &[f32]) -> io::Result<()> {
        let frames = left.len().min(right.len());
        for (l, r) in left[..frames].iter().zip(&right[..frames]) {
            self.writer.write_all(&r.to_le_bytes())?;
            self.writer.write_all(&l.to_le_bytes())?;
        }
        self.data_len = self.data_len.saturating_add(frames as u32 * BYTES_PER_FRAME);
        Ok(())
    }

    /// Patch the two length fields and close the file.
    pub fn finish(mut self) -> io::Result<PathBuf> {
        self.writer.seek(SeekFrom::Start(RIFF_SIZE_OFFSET))?;
        self.writer.write_all(&(self.data_len.saturating_add(36)).to_le_bytes())?;
        self.writer.seek(SeekFrom::Start(DATA_SIZE_OFFSET))?;
        self.writer.write_all(&self.data_len.to_le_bytes())?;
        self.writer.flush()?;
        Ok(self.path)
    }
}

fn header(sample_rate: u32, data_len: u32) -> Vec<u8> {
    let channels: u16 = 2;
    let bits_per_sample: u16 = 32;
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate * block_align as u32;

    let mut buf = Vec::with_capacity(HEADER_LEN as usize);
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(data_len + 36).to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    // fmt chunk (WAVEFORMATEX, IEEE float)
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&18u32.to_le_bytes());
    buf.extend_from_slice(&3u16.to_le_bytes());
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&bits_per_sample.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes()); // cbSize

    // data chunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf
}

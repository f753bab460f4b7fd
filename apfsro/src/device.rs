use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A reference-counted block buffer. Dropping the last clone releases the
/// memory back to the host.
pub type Buffer = Arc<[u8]>;

/// Block size assumed until the container superblock declares the real one.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Host block-device interface.
///
/// The core reads whole blocks through this trait and never writes anything.
/// `read_block` takes `&self` so parallel threads can share one device; I/O
/// errors are handed back to callers verbatim.
pub trait BlockReader {
    /// Switch the read granularity. Returns false if the size is not
    /// supported by the device.
    fn set_block_size(&mut self, size: u32) -> bool;

    /// Current block size in bytes.
    fn block_size(&self) -> u32;

    /// Read block `bno` at the current block size.
    fn read_block(&self, bno: u64) -> std::io::Result<Buffer>;
}

/// Block access over any `Read + Seek` image: a file, a raw device, or an
/// in-memory `Cursor`. A mutex serializes the underlying stream so shared
/// references can read from parallel threads.
#[derive(Debug)]
pub struct ImageReader<R> {
    inner: Mutex<R>,
    block_size: u32,
}

impl<R: Read + Seek> ImageReader<R> {
    pub fn new(reader: R) -> Self {
        ImageReader {
            inner: Mutex::new(reader),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl ImageReader<std::io::BufReader<std::fs::File>> {
    /// Open a container image from disk.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(ImageReader::new(std::io::BufReader::new(file)))
    }
}

impl<R: Read + Seek> BlockReader for ImageReader<R> {
    fn set_block_size(&mut self, size: u32) -> bool {
        // Same range the kernel block layer would take.
        if !size.is_power_of_two() || !(512..=65536).contains(&size) {
            return false;
        }
        self.block_size = size;
        true
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read_block(&self, bno: u64) -> std::io::Result<Buffer> {
        let mut buf = vec![0u8; self.block_size as usize];
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.seek(SeekFrom::Start(bno * self.block_size as u64))?;
        inner.read_exact(&mut buf)?;
        drop(inner);
        Ok(buf.into())
    }
}

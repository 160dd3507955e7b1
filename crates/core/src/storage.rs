//! Backing storage for the flash array.
//!
//! The device keeps its working copy in RAM and pushes modified regions out
//! through [`BlockBackend::write_async`]. Write-back is fire-and-forget: the
//! flash protocol never waits for it, so a guest cannot observe storage
//! latency. [`FileBackend`] hands writes to a worker thread; [`MemoryBackend`]
//! applies them in place and is handy for tests and scratch images.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Persistent image behind the flash array.
pub trait BlockBackend: Send {
    /// Size of the image in bytes.
    fn size(&self) -> u64;

    /// Fill `buf` from `offset`. Used once at attach time.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Queue `data` to be written at `offset`. Completion is not reported.
    fn write_async(&mut self, offset: u64, data: Vec<u8>);

    /// Read-only images are never written back.
    fn is_read_only(&self) -> bool {
        false
    }

    /// Block until every queued write has reached the image.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum WriteMsg {
    Write { offset: u64, data: Vec<u8> },
    Sync(Sender<io::Result<()>>),
}

/// Image file with write-back on a background thread.
pub struct FileBackend {
    size: u64,
    read_only: bool,
    file: File,
    tx: Option<Sender<WriteMsg>>,
    worker: Option<JoinHandle<()>>,
}

impl FileBackend {
    /// Open an existing image.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path.as_ref())?;
        Self::from_file(file, path.as_ref(), read_only)
    }

    /// Create (or truncate) an erased image of `size` bytes.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let chunk = vec![0xFFu8; 64 * 1024];
        let mut left = size;
        while left > 0 {
            let n = left.min(chunk.len() as u64) as usize;
            file.write_all(&chunk[..n])?;
            left -= n as u64;
        }
        file.sync_all()?;
        Self::from_file(file, path.as_ref(), false)
    }

    fn from_file(file: File, path: &Path, read_only: bool) -> io::Result<Self> {
        let size = file.metadata()?.len();
        let (tx, worker) = if read_only {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel::<WriteMsg>();
            // Separate open so the worker's cursor never races attach-time reads.
            let mut out = OpenOptions::new().write(true).open(path)?;
            let worker = std::thread::Builder::new()
                .name("quadflash-writeback".into())
                .spawn(move || {
                    for msg in rx {
                        match msg {
                            WriteMsg::Write { offset, data } => {
                                let res = out
                                    .seek(SeekFrom::Start(offset))
                                    .and_then(|_| out.write_all(&data));
                                if let Err(e) = res {
                                    log::error!(target: "quadflash::storage",
                                        "write-back of {} bytes at {:#x} failed: {}", data.len(), offset, e);
                                }
                            }
                            WriteMsg::Sync(done) => {
                                let _ = done.send(out.flush().and_then(|_| out.sync_data()));
                            }
                        }
                    }
                })?;
            (Some(tx), Some(worker))
        };
        Ok(FileBackend { size, read_only, file, tx, worker })
    }
}

impl BlockBackend for FileBackend {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_async(&mut self, offset: u64, data: Vec<u8>) {
        let Some(tx) = &self.tx else { return };
        if tx.send(WriteMsg::Write { offset, data }).is_err() {
            log::error!(target: "quadflash::storage", "write-back worker is gone, dropping write at {:#x}", offset);
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn flush(&mut self) -> io::Result<()> {
        let Some(tx) = &self.tx else { return Ok(()) };
        let (done_tx, done_rx) = mpsc::channel();
        tx.send(WriteMsg::Sync(done_tx))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "write-back worker is gone"))?;
        done_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "write-back worker is gone"))?
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// In-memory image shared through an `Arc`, with a log of write-backs.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryImage>>,
}

#[derive(Default)]
pub struct MemoryImage {
    pub data: Vec<u8>,
    /// `(offset, len)` of every write-back, in arrival order.
    pub writes: Vec<(u64, usize)>,
    pub read_only: bool,
}

impl MemoryBackend {
    /// Image holding `data`.
    pub fn new(data: Vec<u8>) -> Self {
        MemoryBackend {
            inner: Arc::new(Mutex::new(MemoryImage { data, writes: Vec::new(), read_only: false })),
        }
    }

    /// Erased image of `size` bytes.
    pub fn erased(size: usize) -> Self {
        Self::new(vec![0xFF; size])
    }

    /// Mark the image read-only.
    pub fn read_only(self) -> Self {
        self.lock().read_only = true;
        self
    }

    /// Access the shared image. Clones of this backend see the same image.
    pub fn lock(&self) -> std::sync::MutexGuard<'_, MemoryImage> {
        // A poisoned lock only means a test panicked mid-write; the bytes are still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BlockBackend for MemoryBackend {
    fn size(&self) -> u64 {
        self.lock().data.len() as u64
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let img = self.lock();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= img.data.len())
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(&img.data[start..end]);
        Ok(())
    }

    fn write_async(&mut self, offset: u64, data: Vec<u8>) {
        let mut img = self.lock();
        let start = offset as usize;
        let end = (start + data.len()).min(img.data.len());
        if start < end {
            img.data[start..end].copy_from_slice(&data[..end - start]);
        }
        img.writes.push((offset, data.len()));
    }

    fn is_read_only(&self) -> bool {
        self.lock().read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_shares_image() {
        let backend = MemoryBackend::erased(16);
        let mut writer = backend.clone();
        writer.write_async(4, vec![1, 2, 3]);
        let img = backend.lock();
        assert_eq!(&img.data[3..8], &[0xFF, 1, 2, 3, 0xFF]);
        assert_eq!(img.writes, vec![(4, 3)]);
    }

    #[test]
    fn test_memory_backend_short_read() {
        let mut backend = MemoryBackend::erased(8);
        let mut buf = [0u8; 16];
        assert!(backend.read(0, &mut buf).is_err());
    }

    #[test]
    fn test_file_backend_create_and_write_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.bin");
        {
            let mut backend = FileBackend::create(&path, 4096).unwrap();
            assert_eq!(backend.size(), 4096);
            backend.write_async(256, vec![0x12, 0x34]);
            backend.flush().unwrap();
        }
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 4096);
        assert_eq!(bytes[255], 0xFF);
        assert_eq!(&bytes[256..258], &[0x12, 0x34]);
        assert_eq!(bytes[258], 0xFF);
    }

    #[test]
    fn test_file_backend_read_only_ignores_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.bin");
        std::fs::write(&path, vec![0xAA; 512]).unwrap();
        let mut backend = FileBackend::open(&path, true).unwrap();
        assert!(backend.is_read_only());
        backend.write_async(0, vec![0x00; 4]);
        backend.flush().unwrap();
        let mut buf = [0u8; 4];
        backend.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xAA; 4]);
    }
}

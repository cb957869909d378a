//! File-backed block device.

use crate::device::{BlockDevice, BlockNr};
use crate::error::{DeviceError, DeviceResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A block device backed by a regular file.
///
/// The file holds a flat image of `block_count * block_size` bytes. The
/// image is locked exclusively for the lifetime of the device so that two
/// journals never share one image.
///
/// # Durability
///
/// - `write_block` pushes data to the OS
/// - `flush` calls `File::sync_data()`
///
/// # Example
///
/// ```no_run
/// use sluice_blockdev::{BlockDevice, FileDevice};
/// use std::path::Path;
///
/// let device = FileDevice::create(Path::new("fs.img"), 4096, 1024).unwrap();
/// device.write_block(0, &vec![0u8; 4096]).unwrap();
/// device.flush().unwrap();
/// ```
#[derive(Debug)]
pub struct FileDevice {
    path: PathBuf,
    file: Mutex<File>,
    block_size: usize,
    block_count: u64,
}

impl FileDevice {
    /// Creates (or resizes) an image with the given geometry.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created, resized or locked.
    pub fn create(path: &Path, block_size: usize, block_count: u64) -> DeviceResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::lock(&file)?;
        file.set_len(block_size as u64 * block_count)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            block_size,
            block_count,
        })
    }

    /// Opens an existing image; the block count is derived from its length.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or locked.
    pub fn open(path: &Path, block_size: usize) -> DeviceResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::lock(&file)?;
        let block_count = file.metadata()?.len() / block_size as u64;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            block_size,
            block_count,
        })
    }

    fn lock(file: &File) -> DeviceResult<()> {
        if file.try_lock_exclusive().is_err() {
            return Err(DeviceError::Locked);
        }
        Ok(())
    }

    /// Returns the path to the image file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset(&self, blocknr: BlockNr) -> u64 {
        blocknr * self.block_size as u64
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, blocknr: BlockNr, buf: &mut [u8]) -> DeviceResult<()> {
        self.check_request(blocknr, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.offset(blocknr)))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&self, blocknr: BlockNr, buf: &[u8]) -> DeviceResult<()> {
        self.check_request(blocknr, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.offset(blocknr)))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn flush(&self) -> DeviceResult<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&*self.file.lock());
    }
}

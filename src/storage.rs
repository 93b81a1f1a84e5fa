use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::allocators::{AllocError, Result};
use crate::bitmap::image_len;
use crate::transaction::Write;

//-------------------------------------------------------------------------

/// Durable home of a bitmap.  Supplies the last committed state when an
/// allocator is created and persists batches of writes atomically.
pub trait BitmapStorage: Send + Sync {
    /// Element count as of the last commit.
    fn nr_elements(&self) -> u64;

    /// Bitmap image as of the last commit, `image_len(nr_elements())` bytes.
    fn read_bitmap(&self) -> Result<Vec<u8>>;

    /// Hard limit on the extent size.
    fn max_elements(&self) -> u64;

    /// Growth happens in multiples of this many elements.
    fn grow_increment(&self) -> u64;

    /// Persist all the writes, or none of them.
    fn apply(&self, writes: &[Write]) -> Result<()>;
}

//-------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
struct Image {
    nr_elements: u64,
    bytes: Vec<u8>,
}

impl Image {
    fn new(nr_elements: u64, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() as u64 != image_len(nr_elements) {
            return Err(AllocError::Corrupt(format!(
                "bitmap image of {} bytes doesn't match {} elements",
                bytes.len(),
                nr_elements
            )));
        }
        Ok(Self { nr_elements, bytes })
    }

    /// Extends the image to hold `nr_elements`; never shrinks it.
    fn extend_to(&mut self, nr_elements: u64, max_elements: u64) -> Result<()> {
        if nr_elements <= self.nr_elements {
            return Ok(());
        }
        if nr_elements > max_elements {
            return Err(AllocError::NoSpace);
        }

        let len = image_len(nr_elements) as usize;
        self.bytes
            .try_reserve(len - self.bytes.len())
            .map_err(|_| AllocError::NoMemory)?;
        self.bytes.resize(len, 0);
        self.nr_elements = nr_elements;
        Ok(())
    }

    fn update_range(&mut self, b: u64, e: u64, set: bool) -> Result<()> {
        if b >= e {
            return Err(AllocError::Corrupt(format!("empty bitmap range [{}, {})", b, e)));
        }
        for bit in b..e {
            let byte = &mut self.bytes[(bit / 8) as usize];
            let mask = 1u8 << (bit % 8);
            if set {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
        Ok(())
    }

    // Applies to a copy so a bad write leaves us untouched.  Every write
    // commutes with writes from other batches, so batches may land in any
    // order.
    fn with_writes(&self, writes: &[Write], max_elements: u64) -> Result<Self> {
        let mut new = self.clone();
        for w in writes {
            new.extend_to(w.min_elements(), max_elements)?;
            match w {
                Write::Set { begin, end } => new.update_range(*begin, *end, true)?,
                Write::Clear { begin, end } => new.update_range(*begin, *end, false)?,
                Write::Grow { .. } => {}
            }
        }
        Ok(new)
    }
}

//-------------------------------------------------------------------------

/// Keeps the committed bitmap in memory.
pub struct MemStorage {
    max_elements: u64,
    grow_increment: u64,
    image: Mutex<Image>,
}

impl MemStorage {
    pub fn new(max_elements: u64) -> Self {
        Self {
            max_elements,
            grow_increment: 1,
            image: Mutex::new(Image::default()),
        }
    }

    /// Starts from an existing bitmap image.
    pub fn from_image(nr_elements: u64, bytes: Vec<u8>, max_elements: u64) -> Result<Self> {
        if nr_elements > max_elements {
            return Err(AllocError::Corrupt(format!(
                "bitmap has {} elements, limit is {}",
                nr_elements, max_elements
            )));
        }
        Ok(Self {
            max_elements,
            grow_increment: 1,
            image: Mutex::new(Image::new(nr_elements, bytes)?),
        })
    }

    pub fn with_grow_increment(mut self, grow_increment: u64) -> Self {
        assert!(grow_increment > 0);
        self.grow_increment = grow_increment;
        self
    }
}

impl BitmapStorage for MemStorage {
    fn nr_elements(&self) -> u64 {
        self.image.lock().unwrap().nr_elements
    }

    fn read_bitmap(&self) -> Result<Vec<u8>> {
        Ok(self.image.lock().unwrap().bytes.clone())
    }

    fn max_elements(&self) -> u64 {
        self.max_elements
    }

    fn grow_increment(&self) -> u64 {
        self.grow_increment
    }

    fn apply(&self, writes: &[Write]) -> Result<()> {
        let mut image = self.image.lock().unwrap();
        *image = image.with_writes(writes, self.max_elements)?;
        Ok(())
    }
}

//-------------------------------------------------------------------------

const MAGIC: u64 = 0x6269746d61703031; // "bitmap01"
const HEADER_LEN: usize = 24;

pub struct FileStorageBuilder {
    path: PathBuf,
    create: bool,
    max_elements: u64,
    grow_increment: u64,
}

impl FileStorageBuilder {
    pub fn create<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            create: true,
            max_elements: u64::MAX,
            grow_increment: 1,
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Self {
            create: false,
            ..Self::create(path)
        }
    }

    pub fn max_elements(mut self, max_elements: u64) -> Self {
        self.max_elements = max_elements;
        self
    }

    pub fn grow_increment(mut self, grow_increment: u64) -> Self {
        assert!(grow_increment > 0);
        self.grow_increment = grow_increment;
        self
    }

    pub fn build(self) -> Result<FileStorage> {
        let image = if self.create {
            let image = Image::default();
            write_image(&self.path, &image)?;
            image
        } else {
            read_image(&self.path)?
        };

        if image.nr_elements > self.max_elements {
            return Err(AllocError::Corrupt(format!(
                "bitmap has {} elements, limit is {}",
                image.nr_elements, self.max_elements
            )));
        }

        debug!(path = ?self.path, nr_elements = image.nr_elements, "opened bitmap file");
        Ok(FileStorage {
            path: self.path,
            max_elements: self.max_elements,
            grow_increment: self.grow_increment,
            image: Mutex::new(image),
        })
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_image(path: &Path, image: &Image) -> Result<()> {
    let mut buf = Vec::with_capacity(HEADER_LEN + image.bytes.len());
    buf.write_u64::<LittleEndian>(MAGIC)?;
    buf.write_u64::<LittleEndian>(image.nr_elements)?;
    buf.write_u32::<LittleEndian>(crc32c::crc32c(&image.bytes))?;
    buf.write_u32::<LittleEndian>(0)?;
    buf.extend_from_slice(&image.bytes);

    // Write aside then rename so a crash leaves either the old or the new image.
    let tmp = tmp_path(path);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_image(path: &Path) -> Result<Image> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    if buf.len() < HEADER_LEN {
        return Err(AllocError::Corrupt("bitmap file too short".to_string()));
    }

    let mut header = &buf[..HEADER_LEN];
    let magic = header.read_u64::<LittleEndian>()?;
    let nr_elements = header.read_u64::<LittleEndian>()?;
    let csum = header.read_u32::<LittleEndian>()?;
    if magic != MAGIC {
        return Err(AllocError::Corrupt(format!("bad magic {:#x}", magic)));
    }

    let bytes = buf.split_off(HEADER_LEN);
    if crc32c::crc32c(&bytes) != csum {
        return Err(AllocError::Corrupt("bitmap checksum mismatch".to_string()));
    }
    Image::new(nr_elements, bytes)
}

/// Keeps the committed bitmap in a single file.
pub struct FileStorage {
    path: PathBuf,
    max_elements: u64,
    grow_increment: u64,
    image: Mutex<Image>,
}

impl FileStorage {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BitmapStorage for FileStorage {
    fn nr_elements(&self) -> u64 {
        self.image.lock().unwrap().nr_elements
    }

    fn read_bitmap(&self) -> Result<Vec<u8>> {
        Ok(self.image.lock().unwrap().bytes.clone())
    }

    fn max_elements(&self) -> u64 {
        self.max_elements
    }

    fn grow_increment(&self) -> u64 {
        self.grow_increment
    }

    fn apply(&self, writes: &[Write]) -> Result<()> {
        let mut image = self.image.lock().unwrap();
        let new = image.with_writes(writes, self.max_elements)?;
        write_image(&self.path, &new)?;
        *image = new;
        Ok(())
    }
}

//-------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_log::test;

    #[test]
    fn test_mem_apply_is_atomic() -> anyhow::Result<()> {
        let storage = MemStorage::new(128);
        storage.apply(&[Write::Grow { nr_elements: 64 }, Write::Set { begin: 0, end: 1 }])?;

        // Second write is an empty range, so the first mustn't land either.
        let r = storage.apply(&[
            Write::Set { begin: 1, end: 2 },
            Write::Clear { begin: 3, end: 3 },
        ]);
        assert!(matches!(r, Err(AllocError::Corrupt(_))));
        assert_eq!(storage.read_bitmap()?, 1u64.to_le_bytes().to_vec());
        Ok(())
    }

    #[test]
    fn test_mem_grow_limits() -> anyhow::Result<()> {
        let storage = MemStorage::new(100);
        storage.apply(&[Write::Grow { nr_elements: 70 }])?;
        assert_eq!(storage.read_bitmap()?.len(), 16);

        assert!(matches!(
            storage.apply(&[Write::Grow { nr_elements: 101 }]),
            Err(AllocError::NoSpace)
        ));
        assert!(matches!(
            storage.apply(&[Write::Set { begin: 100, end: 101 }]),
            Err(AllocError::NoSpace)
        ));

        // A smaller grow, arriving after a larger one, leaves the size alone.
        storage.apply(&[Write::Grow { nr_elements: 10 }])?;
        assert_eq!(storage.nr_elements(), 70);
        Ok(())
    }

    #[test]
    fn test_mem_set_extends() -> anyhow::Result<()> {
        let storage = MemStorage::new(1000);
        storage.apply(&[Write::Set { begin: 99, end: 100 }])?;
        assert_eq!(storage.nr_elements(), 100);
        assert_eq!(storage.read_bitmap()?[12], 0x08);

        storage.apply(&[Write::Clear { begin: 99, end: 100 }])?;
        assert!(storage.read_bitmap()?.iter().all(|b| *b == 0));
        Ok(())
    }

    #[test]
    fn test_mem_from_image_checks_len() {
        assert!(MemStorage::from_image(64, vec![0; 8], 64).is_ok());
        assert!(MemStorage::from_image(65, vec![0; 8], 100).is_err());
        assert!(matches!(
            MemStorage::from_image(100, vec![0; 16], 64),
            Err(AllocError::Corrupt(_))
        ));
    }

    #[test]
    fn test_file_reopen() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("bitmap");

        let storage = FileStorageBuilder::create(&path)
            .max_elements(1000)
            .grow_increment(64)
            .build()?;
        assert_eq!(storage.grow_increment(), 64);
        storage.apply(&[
            Write::Grow { nr_elements: 128 },
            Write::Set { begin: 68, end: 72 },
        ])?;
        drop(storage);

        let storage = FileStorageBuilder::open(&path).max_elements(1000).build()?;
        assert_eq!(storage.nr_elements(), 128);
        let bytes = storage.read_bitmap()?;
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[8], 0xF0);
        assert!(!tmp_path(&path).exists());
        Ok(())
    }

    #[test]
    fn test_file_detects_corruption() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("bitmap");

        let storage = FileStorageBuilder::create(&path).build()?;
        storage.apply(&[Write::Set { begin: 0, end: 8 }])?;
        drop(storage);

        let mut raw = fs::read(&path)?;
        raw[HEADER_LEN] ^= 1;
        fs::write(&path, &raw)?;

        assert!(matches!(
            FileStorageBuilder::open(&path).build(),
            Err(AllocError::Corrupt(_))
        ));
        Ok(())
    }

    #[test]
    fn test_file_open_missing() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            FileStorageBuilder::open(dir.path().join("nope")).build(),
            Err(AllocError::Io(_))
        ));
    }
}

//-------------------------------------------------------------------------

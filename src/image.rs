// Image header parsing and read-only views
//
// An installed image is larger on disk than it is meaningful: partitions
// are fixed-size and files may carry padding. The delta dictionary and the
// hash verification both need the header-derived length, so the reader
// parses the first bytes of the image and refuses anything whose claimed
// size exceeds the underlying file or block device.

use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use thiserror::Error;
use tracing::warn;

const SQUASHFS_MAGIC: u32 = 0x7371_7368;
const SQUASHFS_BLOCK_ALIGN: u64 = 4096;

const ANDROID_BOOT_MAGIC_1: u32 = 0x5244_4e41;
const ANDROID_BOOT_MAGIC_2: u32 = 0x2144_494f;
// Effective header size for the A/B layout, independent of the page size.
const ANDROID_BOOT_HEADER_SIZE: u64 = 608;

// BLKGETSIZE64, byte length of a block device.
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("unable to open image: {0}")]
    OpenFailed(std::io::Error),
    #[error("unable to stat image: {0}")]
    StatFailed(std::io::Error),
    #[error("short read while parsing image header")]
    ShortRead,
    #[error("wrong magic in image header")]
    WrongMagic,
    #[error("unsupported image or file kind")]
    UnsupportedKind,
    #[error("image size {image} exceeds underlying size {underlying}")]
    SizeExceedsDevice { image: u64, underlying: u64 },
    #[error("unable to map image")]
    MapFailed,
}

/// The two partition images managed by the A/B scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Boot,
    Rootfs,
}

impl ImageKind {
    pub fn name(&self) -> &'static str {
        match self {
            ImageKind::Boot => "boot",
            ImageKind::Rootfs => "rootfs",
        }
    }
}

fn align_to(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64_le(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// Parse a SquashFS superblock and return the meaningful image length:
/// `bytes_used`, rounded up to the next 4096-byte boundary.
fn squashfs_image_size(header: &[u8]) -> Result<u64, ImageError> {
    if header.len() < 48 {
        return Err(ImageError::ShortRead);
    }
    if read_u32_le(header, 0) != SQUASHFS_MAGIC {
        return Err(ImageError::WrongMagic);
    }

    let bytes_used = read_u64_le(header, 40);
    Ok(align_to(bytes_used, SQUASHFS_BLOCK_ALIGN))
}

/// Parse an Android boot image header and return the sum of the
/// page-aligned header, kernel, initrd, second stage and dtb lengths.
fn android_boot_image_size(header: &[u8]) -> Result<u64, ImageError> {
    if header.len() < 44 {
        return Err(ImageError::ShortRead);
    }
    if read_u32_le(header, 0) != ANDROID_BOOT_MAGIC_1
        || read_u32_le(header, 4) != ANDROID_BOOT_MAGIC_2
    {
        return Err(ImageError::WrongMagic);
    }

    let kernel_size = read_u32_le(header, 8) as u64;
    let initrd_size = read_u32_le(header, 16) as u64;
    let second_size = read_u32_le(header, 24) as u64;
    let page_size = read_u32_le(header, 36) as u64;
    let dtb_size = read_u32_le(header, 40) as u64;

    if page_size == 0 || !page_size.is_power_of_two() {
        return Err(ImageError::WrongMagic);
    }

    Ok(align_to(ANDROID_BOOT_HEADER_SIZE, page_size)
        + align_to(kernel_size, page_size)
        + align_to(initrd_size, page_size)
        + align_to(second_size, page_size)
        + align_to(dtb_size, page_size))
}

/// Read-only view over an installed image on a partition or regular file.
///
/// `image_size` is derived from the image header, never from the file
/// length; mapping exposes exactly that many bytes. Dropping the reader
/// releases the mapping and the descriptor.
#[derive(Debug)]
pub struct ImageReader {
    file: File,
    path: PathBuf,
    kind: ImageKind,
    image_size: u64,
    mapped: Option<Mmap>,
}

impl ImageReader {
    /// Open `path` read-only, parse its header and validate the derived
    /// size against the underlying file or block device length.
    pub fn open(kind: ImageKind, path: &Path) -> Result<Self, ImageError> {
        let mut file = File::open(path).map_err(ImageError::OpenFailed)?;

        let mut header = [0u8; 96];
        let mut filled = 0;
        while filled < header.len() {
            match file.read(&mut header[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return Err(ImageError::ShortRead),
            }
        }

        let image_size = match kind {
            ImageKind::Rootfs => squashfs_image_size(&header[..filled])?,
            ImageKind::Boot => android_boot_image_size(&header[..filled])?,
        };

        let metadata = file.metadata().map_err(ImageError::StatFailed)?;
        let file_type = metadata.file_type();
        let underlying = if file_type.is_file() {
            metadata.len()
        } else if file_type.is_block_device() {
            let mut size: u64 = 0;
            // A failing ioctl reports zero length, which the size check
            // below turns into a hard error.
            match unsafe { blkgetsize64(file.as_raw_fd(), &mut size) } {
                Ok(_) => size,
                Err(_) => 0,
            }
        } else {
            return Err(ImageError::UnsupportedKind);
        };

        if image_size > underlying {
            warn!(
                "image size {} in {} exceeds underlying size {}",
                image_size,
                path.display(),
                underlying
            );
            return Err(ImageError::SizeExceedsDevice {
                image: image_size,
                underlying,
            });
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            kind,
            image_size,
            mapped: None,
        })
    }

    /// Header-derived image length in bytes.
    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    /// Map `image_size` bytes read-only. Mapping twice returns the same view.
    pub fn map(&mut self) -> Result<&[u8], ImageError> {
        if self.mapped.is_none() {
            let mapped = unsafe {
                MmapOptions::new()
                    .len(self.image_size as usize)
                    .map(&self.file)
            }
            .map_err(|e| {
                warn!(
                    "unable to map {} image at {}: {}",
                    self.kind.name(),
                    self.path.display(),
                    e
                );
                ImageError::MapFailed
            })?;
            self.mapped = Some(mapped);
        }

        Ok(self.mapped.as_ref().unwrap())
    }
}

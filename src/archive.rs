//! Random-access reading of image bundles
//!
//! A bundle is a zip file in one of two layouts:
//! - factory bundles carry a nested `image-*.zip` whose `.img` entries are
//!   flashed partition by partition
//! - OTA bundles carry a `payload.bin` (top level or nested) and are installed
//!   by the device itself over sideload
//!
//! The leading `PK` signature is checked before the central directory is
//! trusted. Entries are only decompressed when individually read. All methods
//! block; async callers go through [`run_blocking`].

use crate::error::{Error, Result, ValidationError};
use crate::types::ArchiveEntry;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::ZipArchive;

/// Local file header signature
const ZIP_SIGNATURE: [u8; 2] = [0x50, 0x4b];

const OTA_PAYLOAD: &str = "payload.bin";

/// Partition images never flashed from a bundle
const PROTECTED_PREFIXES: [&str; 2] = ["bootloader", "radio"];

/// Upper bound on memory reserved up front for one entry
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// One partition image and the entry holding it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionImage {
    /// Target partition (file name without `.img`)
    pub partition: String,
    /// Entry to read the image from
    pub entry: ArchiveEntry,
}

/// How a bundle gets onto the device
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImagePolicy {
    /// Install the whole bundle over sideload
    Ota {
        /// The `payload.bin` entry that selected this policy
        payload: ArchiveEntry,
    },
    /// Flash these images in order
    Partitions {
        /// Images in archive order
        images: Vec<PartitionImage>,
    },
}

/// Reader over a bundle and, once opened, its nested image archive
pub struct BundleReader {
    path: PathBuf,
    outer: ZipArchive<File>,
    nested: Option<ZipArchive<File>>,
}

impl std::fmt::Debug for BundleReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleReader")
            .field("path", &self.path)
            .field("entries", &self.outer.len())
            .field("nested", &self.nested.is_some())
            .finish()
    }
}

impl BundleReader {
    /// Open `path`, rejecting anything that does not start with the zip signature
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        check_signature(&mut file, path)?;
        let outer = ZipArchive::new(file)?;
        debug!(?path, entries = outer.len(), "opened bundle");
        Ok(Self {
            path: path.to_path_buf(),
            outer,
            nested: None,
        })
    }

    /// Bundle path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Top-level entries, directories excluded
    pub fn list_entries(&mut self) -> Result<Vec<ArchiveEntry>> {
        list(&mut self.outer, false)
    }

    /// Entries of the nested image archive, if it has been opened
    pub fn list_nested_entries(&mut self) -> Result<Vec<ArchiveEntry>> {
        match self.nested.as_mut() {
            Some(nested) => list(nested, true),
            None => Ok(Vec::new()),
        }
    }

    /// Decompress one entry into memory
    pub fn read_entry(&mut self, entry: &ArchiveEntry) -> Result<Vec<u8>> {
        let archive = if entry.in_nested {
            self.nested.as_mut().ok_or_else(|| {
                Error::Other(format!("nested archive not open for {}", entry.path))
            })?
        } else {
            &mut self.outer
        };
        let mut file = archive.by_name(&entry.path)?;
        let mut data = Vec::with_capacity(capacity_hint(file.size()));
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Copy the nested archive to an anonymous file in `scratch_dir` and open it.
    ///
    /// The copy is unlinked on creation, so it disappears when the reader is dropped.
    pub fn open_nested(
        &mut self,
        entry: &ArchiveEntry,
        scratch_dir: &Path,
    ) -> Result<Vec<ArchiveEntry>> {
        std::fs::create_dir_all(scratch_dir)?;
        let mut scratch = tempfile::tempfile_in(scratch_dir)?;
        {
            let mut source = self.outer.by_name(&entry.path)?;
            let copied = std::io::copy(&mut source, &mut scratch)?;
            debug!(entry = %entry.path, bytes = copied, "copied nested archive");
        }
        scratch.seek(SeekFrom::Start(0))?;

        let label = self.path.join(&entry.path);
        check_signature(&mut scratch, &label)?;
        let mut nested = ZipArchive::new(scratch)?;
        let entries = list(&mut nested, true)?;
        self.nested = Some(nested);
        Ok(entries)
    }

    /// Decide between sideload and partition flashing.
    ///
    /// `payload.bin` anywhere (top level or nested) selects the OTA policy.
    /// Otherwise the `.img` entries of the nested `image-*.zip` are flashed; a
    /// bundle without a nested archive falls back to its own top-level images.
    pub fn plan(&mut self, scratch_dir: &Path) -> Result<ImagePolicy> {
        let top = self.list_entries()?;

        if let Some(payload) = top.iter().find(|e| e.is_ota_payload) {
            info!(bundle = ?self.path, "bundle carries an OTA payload");
            return Ok(ImagePolicy::Ota {
                payload: payload.clone(),
            });
        }

        let candidates = match top.iter().find(|e| e.is_nested_archive) {
            Some(nested) => {
                info!(nested = %nested.path, "opening nested image archive");
                let inner = self.open_nested(nested, scratch_dir)?;
                if let Some(payload) = inner.iter().find(|e| e.is_ota_payload) {
                    return Ok(ImagePolicy::Ota {
                        payload: payload.clone(),
                    });
                }
                inner
            }
            None => {
                debug!(bundle = ?self.path, "no nested image archive, using top-level images");
                top
            }
        };

        let images: Vec<PartitionImage> = candidates
            .into_iter()
            .filter(|e| e.is_partition_image)
            .filter_map(|entry| {
                let partition = partition_name(&entry)?;
                if PROTECTED_PREFIXES.iter().any(|p| partition.starts_with(p)) {
                    debug!(%partition, "skipping protected partition image");
                    return None;
                }
                Some(PartitionImage { partition, entry })
            })
            .collect();

        if images.is_empty() {
            return Err(ValidationError::NoFlashableContent {
                archive: self.path.clone(),
                reason: "no payload.bin and no flashable .img entries".to_string(),
            }
            .into());
        }

        info!(count = images.len(), "partition images selected");
        Ok(ImagePolicy::Partitions { images })
    }
}

/// Run blocking archive work on the blocking pool
pub async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Other(format!("archive task panicked: {e}")))?
}

fn check_signature(file: &mut File, path: &Path) -> Result<()> {
    let mut lead = [0u8; 2];
    let mut read = 0;
    while read < lead.len() {
        let n = file.read(&mut lead[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    if read < lead.len() || lead != ZIP_SIGNATURE {
        return Err(ValidationError::NotAnArchive {
            path: path.to_path_buf(),
            found: lead[..read].to_vec(),
        }
        .into());
    }
    file.seek(SeekFrom::Start(0))?;
    Ok(())
}

fn list(archive: &mut ZipArchive<File>, in_nested: bool) -> Result<Vec<ArchiveEntry>> {
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let file = archive.by_index_raw(index)?;
        if file.is_dir() {
            continue;
        }
        entries.push(classify(file.name(), file.size(), in_nested));
    }
    Ok(entries)
}

fn classify(path: &str, size: u64, in_nested: bool) -> ArchiveEntry {
    let name = path.rsplit('/').next().unwrap_or(path);
    ArchiveEntry {
        path: path.to_string(),
        size,
        is_nested_archive: !in_nested && name.starts_with("image-") && name.ends_with(".zip"),
        is_partition_image: name.ends_with(".img"),
        is_ota_payload: name == OTA_PAYLOAD,
        in_nested,
    }
}

/// Declared entry sizes come from the archive itself and may be bogus
fn capacity_hint(declared: u64) -> usize {
    usize::try_from(declared.min(MAX_PREALLOC)).unwrap_or(0)
}

fn partition_name(entry: &ArchiveEntry) -> Option<String> {
    entry
        .file_name()
        .strip_suffix(".img")
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

//! Backing memory for shared regions.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use memmap2::MmapMut;
use memmap2::MmapOptions;
use thiserror::Error;

/// Raw memory a [`SharedRegion`](super::SharedRegion) reads and writes.
///
/// # Safety
///
/// Implementors guarantee that `as_ptr()` is 8-byte aligned, stays valid for
/// reads and writes of `len()` bytes for as long as the value lives, and does
/// not move.
pub unsafe trait RegionMemory {
    fn as_ptr(&self) -> *mut u8;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Error, Debug)]
pub enum MapError {
    #[error("failed to open `{path}`")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("`{path}` is empty")]
    Empty { path: PathBuf },

    #[error("mmap of `{path}` failed")]
    Mmap {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A cache file mapped shared for reading and writing.
///
/// Writes go straight to the page cache and are visible to every other
/// process mapping the same file. Dropping it unmaps the file.
#[derive(Debug)]
pub struct MappedFile {
    map: MmapMut,
}

impl MappedFile {
    /// Maps the whole file at `path`.
    pub fn open(path: &Path) -> Result<Self, MapError> {
        let open_failed = |source| MapError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(open_failed)?;
        let len = file.metadata().map_err(open_failed)?.len();
        if len == 0 {
            return Err(MapError::Empty {
                path: path.to_path_buf(),
            });
        }

        // SAFETY: the agent inside the container writes this file
        // concurrently. Every access goes through volatile reads and writes
        // at checked offsets, never through references into the mapping.
        let map = unsafe { MmapOptions::new().map_mut(&file) }.map_err(|source| MapError::Mmap {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self { map })
    }
}

// SAFETY: mmap returns page-aligned memory valid for `len` bytes until the
// MmapMut is dropped. The pointer comes from the mapping itself, not from a
// slice reference.
unsafe impl RegionMemory for MappedFile {
    fn as_ptr(&self) -> *mut u8 {
        <[u8]>::as_ptr(&self.map).cast_mut()
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

// SAFETY: same as for `MappedFile`; an anonymous mapping is page-aligned.
unsafe impl RegionMemory for MmapMut {
    fn as_ptr(&self) -> *mut u8 {
        <[u8]>::as_ptr(self).cast_mut()
    }

    fn len(&self) -> usize {
        <[u8]>::len(self)
    }
}

/// Anonymous memory holding a copy of `bytes`.
///
/// Used to build regions in process, e.g. fixtures or detached copies.
pub fn anonymous_copy(bytes: &[u8]) -> io::Result<MmapMut> {
    let mut map = MmapMut::map_anon(bytes.len())?;
    map.copy_from_slice(bytes);
    Ok(map)
}

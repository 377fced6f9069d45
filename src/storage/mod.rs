use memmap2::{Mmap, MmapMut};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::entity::{EntityKind, Location};
use crate::error::ClipError;

// 8 bytes per slot: 4 bytes lon, 4 bytes lat
// Stored as fixed precision integers (deg * 10^7) with the sign bit flipped,
// so a zeroed slot never decodes to a valid location.
const SLOT_SIZE: usize = 8;
// 16 bytes per entry: 8 bytes node id (u64), 8 bytes packed location (u64)
const SPARSE_ENTRY_SIZE: usize = 16;
const SCALE_FACTOR: f64 = 10_000_000.0;
const SIGN_FLIP: u32 = 0x8000_0000;
const EMPTY_SLOT: u64 = 0;

/// Write side of the location index. Populated during the node scan, then
/// turned into a read-only [`LocationIndex`] with [`LocationWriter::finalize`].
pub struct LocationWriter {
    inner: LocationWriterImpl,
}

/// Read side of the location index, addressed by node id.
pub struct LocationIndex {
    inner: LocationIndexImpl,
}

enum LocationWriterImpl {
    Sparse(SparseLocationWriter),
    Dense(DenseLocationWriter),
    Memory(MemoryLocationStore),
}

enum LocationIndexImpl {
    Sparse(SparseLocationReader),
    Dense(DenseLocationReader),
    Memory(MemoryLocationStore),
}

/// Backing file of a disk store. Temporary files are deleted on drop, kept
/// files stay for reuse by the caller.
enum Backing {
    Temp(NamedTempFile),
    Kept { file: File, path: PathBuf },
}

impl Backing {
    fn file(&self) -> &File {
        match self {
            Backing::Temp(temp) => temp.as_file(),
            Backing::Kept { file, .. } => file,
        }
    }

    fn path(&self) -> &Path {
        match self {
            Backing::Temp(temp) => temp.path(),
            Backing::Kept { path, .. } => path,
        }
    }
}

struct SparseLocationWriter {
    writer: BufWriter<NamedTempFile>,
    path: PathBuf,
    count: u64,
    last_id: Option<u64>,
    sorted: bool,
}

struct SparseLocationReader {
    mmap: Mmap,
    count: u64,
    _backing: NamedTempFile,
}

struct DenseLocationWriter {
    mmap: MmapMut,
    capacity: u64,
    backing: Backing,
}

struct DenseLocationReader {
    mmap: Mmap,
    capacity: u64,
    _backing: Backing,
}

struct MemoryLocationStore {
    locations: HashMap<u64, u64>,
}

impl LocationWriter {
    /// Create a sparse store (sorted array in a temp file, efficient for extracts).
    /// Ids arriving out of order are sorted once in [`LocationWriter::finalize`].
    pub fn new_sparse() -> Result<Self, ClipError> {
        let temp_file = NamedTempFile::new()
            .map_err(|source| ClipError::storage(std::env::temp_dir(), source))?;
        let path = temp_file.path().to_path_buf();
        Ok(Self {
            inner: LocationWriterImpl::Sparse(SparseLocationWriter {
                writer: BufWriter::new(temp_file),
                path,
                count: 0,
                last_id: None,
                sorted: true,
            }),
        })
    }

    /// Create a dense store backed by a memory-mapped file at the given path.
    /// The file is NOT deleted afterwards.
    pub fn new_dense<P: AsRef<Path>>(path: P, initial_nodes: u64) -> Result<Self, ClipError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| ClipError::storage(path, source))?;

        DenseLocationWriter::create(
            Backing::Kept {
                file,
                path: path.to_path_buf(),
            },
            initial_nodes,
        )
        .map(|store| Self {
            inner: LocationWriterImpl::Dense(store),
        })
    }

    /// Create a dense store backed by a temporary memory-mapped file, deleted
    /// when the store (and its reader) are dropped.
    pub fn new_dense_temp(initial_nodes: u64) -> Result<Self, ClipError> {
        let temp_file = NamedTempFile::new()
            .map_err(|source| ClipError::storage(std::env::temp_dir(), source))?;
        DenseLocationWriter::create(Backing::Temp(temp_file), initial_nodes).map(|store| Self {
            inner: LocationWriterImpl::Dense(store),
        })
    }

    pub fn new_memory() -> Self {
        Self {
            inner: LocationWriterImpl::Memory(MemoryLocationStore {
                locations: HashMap::new(),
            }),
        }
    }

    /// Store a location. The first write for an id wins; later writes are ignored.
    pub fn set(&mut self, id: u64, location: Location) -> Result<(), ClipError> {
        if !location.is_valid() {
            return Err(ClipError::malformed(
                EntityKind::Node,
                id as i64,
                format!("location ({}, {}) is out of range", location.lon, location.lat),
            ));
        }
        let packed = encode_location(location);
        match &mut self.inner {
            LocationWriterImpl::Sparse(store) => store.set(id, packed),
            LocationWriterImpl::Dense(store) => store.set(id, packed),
            LocationWriterImpl::Memory(store) => {
                store.set(id, packed);
                Ok(())
            }
        }
    }

    pub fn finalize(self) -> Result<LocationIndex, ClipError> {
        match self.inner {
            LocationWriterImpl::Sparse(store) => store.finalize(),
            LocationWriterImpl::Dense(store) => store.finalize(),
            LocationWriterImpl::Memory(store) => Ok(LocationIndex {
                inner: LocationIndexImpl::Memory(store),
            }),
        }
    }
}

impl LocationIndex {
    /// Location of a node, or `None` if it was never written.
    pub fn get(&self, id: u64) -> Option<Location> {
        let packed = match &self.inner {
            LocationIndexImpl::Sparse(store) => store.get(id),
            LocationIndexImpl::Dense(store) => store.get(id),
            LocationIndexImpl::Memory(store) => store.locations.get(&id).copied(),
        }?;
        decode_location(packed)
    }
}

fn encode_coordinate(degrees: f64) -> u32 {
    let fixed = (degrees * SCALE_FACTOR).round() as i32;
    (fixed as u32) ^ SIGN_FLIP
}

fn decode_coordinate(stored: u32) -> f64 {
    ((stored ^ SIGN_FLIP) as i32) as f64 / SCALE_FACTOR
}

/// Pack lon/lat into a u64, lon in the high half
fn encode_location(location: Location) -> u64 {
    ((encode_coordinate(location.lon) as u64) << 32) | encode_coordinate(location.lat) as u64
}

/// Unpack a stored u64, `None` for an empty slot
fn decode_location(packed: u64) -> Option<Location> {
    if packed == EMPTY_SLOT {
        return None;
    }
    Some(Location::new(
        decode_coordinate((packed >> 32) as u32),
        decode_coordinate(packed as u32),
    ))
}

fn read_u64(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[..8]);
    u64::from_le_bytes(bytes)
}

fn size_overflow() -> io::Error {
    io::Error::other("location index size overflows u64")
}

impl SparseLocationWriter {
    fn set(&mut self, id: u64, packed: u64) -> Result<(), ClipError> {
        if let Some(last_id) = self.last_id {
            if id == last_id {
                tracing::debug!("LocationIndex: ignoring repeated location for node {}", id);
                return Ok(());
            }
            if id < last_id && self.sorted {
                tracing::debug!(
                    "LocationIndex: node {} arrived after {}, sparse store will be sorted on finalize",
                    id,
                    last_id
                );
                self.sorted = false;
            }
        }
        self.last_id = Some(id);
        self.count = self.count.saturating_add(1);
        self.writer
            .write_all(&id.to_le_bytes())
            .and_then(|_| self.writer.write_all(&packed.to_le_bytes()))
            .map_err(|source| ClipError::storage(&self.path, source))
    }

    fn finalize(mut self) -> Result<LocationIndex, ClipError> {
        let path = self.path.clone();
        self.writer
            .flush()
            .map_err(|source| ClipError::storage(&path, source))?;
        let mut temp_file = self
            .writer
            .into_inner()
            .map_err(|err| ClipError::storage(&path, err.into_error()))?;

        let file_len = temp_file
            .as_file()
            .metadata()
            .map_err(|source| ClipError::storage(&path, source))?
            .len();
        let expected = self
            .count
            .checked_mul(SPARSE_ENTRY_SIZE as u64)
            .ok_or_else(|| ClipError::storage(&path, size_overflow()))?;
        if file_len != expected {
            return Err(ClipError::storage(
                &path,
                io::Error::other(format!(
                    "sparse index holds {} bytes, expected {} for {} entries",
                    file_len, expected, self.count
                )),
            ));
        }

        let mut count = self.count;
        if !self.sorted {
            count = sort_entries(temp_file.as_file_mut(), &path)?;
        }

        // SAFETY: The file is exclusively owned by this store and is no longer
        // written; the mapping lives as long as the NamedTempFile it came from.
        let mmap = unsafe { Mmap::map(temp_file.as_file()) }
            .map_err(|source| ClipError::storage(&path, source))?;

        Ok(LocationIndex {
            inner: LocationIndexImpl::Sparse(SparseLocationReader {
                mmap,
                count,
                _backing: temp_file,
            }),
        })
    }
}

/// Rewrite an unsorted sparse store in id order. The sort is stable, so the
/// first write for an id survives the dedup. Returns the remaining entry count.
fn sort_entries(file: &mut File, path: &Path) -> Result<u64, ClipError> {
    let storage = |source: io::Error| ClipError::storage(path, source);

    let mut data = Vec::new();
    file.seek(SeekFrom::Start(0)).map_err(storage)?;
    file.read_to_end(&mut data).map_err(storage)?;
    let mut entries: Vec<(u64, u64)> = data
        .chunks_exact(SPARSE_ENTRY_SIZE)
        .map(|entry| (read_u64(&entry[0..8]), read_u64(&entry[8..16])))
        .collect();
    drop(data);

    entries.sort_by_key(|&(id, _)| id);
    entries.dedup_by_key(|(id, _)| *id);

    file.seek(SeekFrom::Start(0)).map_err(storage)?;
    let mut writer = BufWriter::new(&mut *file);
    for (id, packed) in &entries {
        writer
            .write_all(&id.to_le_bytes())
            .and_then(|_| writer.write_all(&packed.to_le_bytes()))
            .map_err(storage)?;
    }
    writer.flush().map_err(storage)?;
    drop(writer);

    let len = (entries.len() as u64)
        .checked_mul(SPARSE_ENTRY_SIZE as u64)
        .ok_or_else(|| storage(size_overflow()))?;
    file.set_len(len).map_err(storage)?;
    Ok(entries.len() as u64)
}

impl SparseLocationReader {
    fn get(&self, id: u64) -> Option<u64> {
        let mut low = 0u64;
        let mut high = self.count;

        while low < high {
            let mid = low + (high - low) / 2;
            let offset = (mid as usize) * SPARSE_ENTRY_SIZE;
            let entry = &self.mmap[offset..offset + SPARSE_ENTRY_SIZE];
            let mid_id = read_u64(&entry[0..8]);

            match mid_id.cmp(&id) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Some(read_u64(&entry[8..16])),
            }
        }

        None
    }
}

impl DenseLocationWriter {
    fn create(backing: Backing, initial_nodes: u64) -> Result<Self, ClipError> {
        let capacity = initial_nodes.max(1);
        let mmap = Self::map(&backing, capacity)?;
        tracing::debug!(
            "LocationIndex: dense store at {:?} with {} slots",
            backing.path(),
            capacity
        );
        Ok(Self {
            mmap,
            capacity,
            backing,
        })
    }

    /// Size the backing file to `capacity` slots (relying on sparse files) and map it.
    fn map(backing: &Backing, capacity: u64) -> Result<MmapMut, ClipError> {
        let path = backing.path();
        let file_size = capacity
            .checked_mul(SLOT_SIZE as u64)
            .ok_or_else(|| ClipError::storage(path, size_overflow()))?;
        backing
            .file()
            .set_len(file_size)
            .map_err(|source| ClipError::storage(path, source))?;

        // SAFETY: The file handle is exclusively owned by this store. Nothing
        // else maps or truncates it while the mapping is alive, and the write
        // phase ends before the mapping is converted to read-only and shared.
        unsafe { MmapMut::map_mut(backing.file()) }.map_err(|source| ClipError::storage(path, source))
    }

    fn grow(&mut self, id: u64) -> Result<(), ClipError> {
        let needed = id
            .checked_add(1)
            .ok_or_else(|| ClipError::storage(self.backing.path(), size_overflow()))?;
        let capacity = needed.max(self.capacity.saturating_mul(2));
        tracing::debug!(
            "LocationIndex: growing dense store from {} to {} slots",
            self.capacity,
            capacity
        );
        self.mmap = Self::map(&self.backing, capacity)?;
        self.capacity = capacity;
        Ok(())
    }

    fn set(&mut self, id: u64, packed: u64) -> Result<(), ClipError> {
        if id >= self.capacity {
            self.grow(id)?;
        }

        let offset = (id as usize) * SLOT_SIZE;
        let slot = &mut self.mmap[offset..offset + SLOT_SIZE];
        let existing = read_u64(slot);
        if existing != EMPTY_SLOT {
            if existing != packed {
                tracing::debug!("LocationIndex: keeping first location for node {}", id);
            }
            return Ok(());
        }
        slot.copy_from_slice(&packed.to_le_bytes());
        Ok(())
    }

    fn finalize(self) -> Result<LocationIndex, ClipError> {
        let path = self.backing.path().to_path_buf();
        self.mmap
            .flush()
            .map_err(|source| ClipError::storage(&path, source))?;
        let mmap = self
            .mmap
            .make_read_only()
            .map_err(|source| ClipError::storage(&path, source))?;
        Ok(LocationIndex {
            inner: LocationIndexImpl::Dense(DenseLocationReader {
                mmap,
                capacity: self.capacity,
                _backing: self.backing,
            }),
        })
    }
}

impl DenseLocationReader {
    fn get(&self, id: u64) -> Option<u64> {
        if id >= self.capacity {
            return None;
        }
        let offset = (id as usize) * SLOT_SIZE;
        Some(read_u64(&self.mmap[offset..offset + SLOT_SIZE]))
    }
}

impl MemoryLocationStore {
    fn set(&mut self, id: u64, packed: u64) {
        if let Entry::Vacant(slot) = self.locations.entry(id) {
            slot.insert(packed);
        } else {
            tracing::debug!("LocationIndex: keeping first location for node {}", id);
        }
    }
}

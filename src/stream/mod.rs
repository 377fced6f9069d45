//! Entity stream input.
//!
//! [`EntityReader`] hands out raw batches in stream order. PBF batches are
//! still-encoded blobs so the caller decides which thread pays for decoding;
//! OSM JSON batches arrive decoded.

pub mod osmjson;
mod pbf;

use osmpbf::{Blob, BlobReader};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use crate::entity::{Entity, KindFilter};
use crate::error::ClipError;
use crate::utils::CountingReader;

pub use self::osmjson::StreamHeader;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamFormat {
    Pbf,
    OsmJson,
}

impl StreamFormat {
    pub fn detect(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        match ext.to_lowercase().as_str() {
            "pbf" => Some(StreamFormat::Pbf),
            "json" | "jsonl" | "osmjson" => Some(StreamFormat::OsmJson),
            _ => None,
        }
    }
}

type FileSource = CountingReader<BufReader<File>>;

enum Source {
    Pbf(BlobReader<FileSource>),
    OsmJson(osmjson::OsmJsonReader<BufReader<FileSource>>),
}

/// Forward-only reader over an entity file, restricted to a set of kinds.
pub struct EntityReader {
    path: Arc<Path>,
    kinds: KindFilter,
    total: u64,
    offset: Arc<AtomicU64>,
    source: Source,
}

/// One batch of entities in stream order.
pub enum RawBatch {
    Pbf {
        blob: Blob,
        kinds: KindFilter,
        path: Arc<Path>,
    },
    Decoded(Vec<Entity>),
}

impl RawBatch {
    pub fn decode(self) -> Result<Vec<Entity>, ClipError> {
        match self {
            RawBatch::Pbf { blob, kinds, path } => pbf::decode_blob(blob, kinds, &path),
            RawBatch::Decoded(entities) => Ok(entities),
        }
    }
}

impl EntityReader {
    /// Open `path`, choosing the decoder from its extension.
    pub fn open(path: &Path, kinds: KindFilter) -> Result<Self, ClipError> {
        let format = StreamFormat::detect(path).ok_or_else(|| ClipError::Decode {
            path: path.to_path_buf(),
            reason: "unsupported input format (expected .osm.pbf or .jsonl)".to_string(),
        })?;
        Self::open_as(path, format, kinds)
    }

    pub fn open_as(path: &Path, format: StreamFormat, kinds: KindFilter) -> Result<Self, ClipError> {
        let file = File::open(path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => ClipError::NotFound {
                path: path.to_path_buf(),
            },
            _ => ClipError::Read {
                path: path.to_path_buf(),
                source,
            },
        })?;
        let total = file
            .metadata()
            .map_err(|source| ClipError::Read {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        let counting = CountingReader::new(BufReader::new(file));
        let offset = counting.offset_handle();
        let source = match format {
            StreamFormat::Pbf => Source::Pbf(BlobReader::new(counting)),
            StreamFormat::OsmJson => Source::OsmJson(osmjson::OsmJsonReader::new(
                BufReader::new(counting),
                kinds,
                path,
            )),
        };
        tracing::debug!("Reader: opened {:?} as {:?} ({} bytes)", path, format, total);

        Ok(Self {
            path: Arc::from(path),
            kinds,
            total,
            offset,
            source,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.total
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header of an OSM JSON stream, once its first line has been read.
    pub fn header(&self) -> Option<&StreamHeader> {
        match &self.source {
            Source::OsmJson(reader) => reader.header(),
            Source::Pbf(_) => None,
        }
    }

    /// Shared view of the read offset, usable after the reader moved into an iterator adaptor.
    pub fn offset_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.offset)
    }
}

impl Iterator for EntityReader {
    type Item = Result<RawBatch, ClipError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            Source::Pbf(reader) => {
                let blob = reader.next()?;
                Some(
                    blob.map(|blob| RawBatch::Pbf {
                        blob,
                        kinds: self.kinds,
                        path: Arc::clone(&self.path),
                    })
                    .map_err(|err| pbf::read_error(&self.path, err)),
                )
            }
            Source::OsmJson(reader) => reader
                .next_batch()
                .transpose()
                .map(|batch| batch.map(RawBatch::Decoded)),
        }
    }
}

/// Decode every batch of a reader on the current thread.
#[cfg(test)]
pub fn read_all(reader: EntityReader) -> Result<Vec<Entity>, ClipError> {
    let mut entities = Vec::new();
    for batch in reader {
        entities.extend(batch?.decode()?);
    }
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;
    use std::io::Write;
    use std::sync::atomic::Ordering;

    fn write_stream(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn detects_format_from_extension() {
        assert_eq!(
            StreamFormat::detect(Path::new("colorado.osm.pbf")),
            Some(StreamFormat::Pbf)
        );
        assert_eq!(
            StreamFormat::detect(Path::new("ways.JSONL")),
            Some(StreamFormat::OsmJson)
        );
        assert_eq!(StreamFormat::detect(Path::new("roads.shp")), None);
        assert_eq!(StreamFormat::detect(Path::new("noext")), None);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = EntityReader::open(Path::new("/nonexistent/input.jsonl"), KindFilter::ALL)
            .err()
            .unwrap();
        assert!(matches!(err, ClipError::NotFound { .. }));
    }

    #[test]
    fn unsupported_extension_is_decode_error() {
        let file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        let err = EntityReader::open(file.path(), KindFilter::ALL).err().unwrap();
        assert!(matches!(err, ClipError::Decode { .. }));
    }

    #[test]
    fn restricts_to_requested_kinds_and_tracks_offset() {
        let file = write_stream(&[
            r#"{"version":"0.6","generator":"test"}"#,
            r#"{"type":"node","id":1,"lat":1.0,"lon":2.0}"#,
            r#"{"type":"way","id":10,"nodes":[1,2]}"#,
            r#"{"type":"relation","id":100,"members":[{"type":"way","ref":10,"role":"outer"}]}"#,
        ]);
        let reader = EntityReader::open(file.path(), KindFilter::WAYS).unwrap();
        let total = reader.file_size();
        let offset = reader.offset_handle();

        let entities = read_all(reader).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].kind(), EntityKind::Way);
        assert_eq!(entities[0].id(), 10);
        assert_eq!(offset.load(Ordering::Relaxed), total);
    }
}

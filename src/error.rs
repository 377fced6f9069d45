use std::io;
use std::path::PathBuf;

use crate::entity::EntityKind;

/// Fatal conditions of a clipping run. Every variant names the file or entity
/// involved so a failed run can be diagnosed from the log alone.
#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    /// Input or boundary file does not exist
    #[error("File not found: {}", .path.display())]
    NotFound { path: PathBuf },

    /// Reading an input stream failed (including a stream closed mid-pass)
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Input stream content could not be decoded
    #[error("Failed to decode {}: {reason}", .path.display())]
    Decode { path: PathBuf, reason: String },

    /// Location index backing store could not be created, sized or mapped
    #[error("Location index storage unavailable at {}: {source}", .path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Output or export file could not be created, written or replaced
    #[error("Can not write {}: {source}", .path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Boundary feature lacks every candidate name field
    #[error(
        "Boundary feature {index} in {} has none of the name fields [{}]",
        .path.display(),
        .candidates.join(", ")
    )]
    MissingAttribute {
        path: PathBuf,
        index: usize,
        candidates: Vec<String>,
    },

    /// Boundary dataset is not a usable polygon dataset
    #[error("Invalid boundary data in {}: {reason}", .path.display())]
    InvalidBoundary { path: PathBuf, reason: String },

    /// Entity violates a structural assumption of the pipeline
    #[error("Malformed {kind} {id}: {reason}")]
    MalformedEntity {
        kind: EntityKind,
        id: i64,
        reason: String,
    },

    #[error("{stage} worker panicked: {message}")]
    WorkerPanicked {
        stage: &'static str,
        message: String,
    },
}

impl ClipError {
    pub fn malformed(kind: EntityKind, id: i64, reason: impl Into<String>) -> Self {
        ClipError::MalformedEntity {
            kind,
            id,
            reason: reason.into(),
        }
    }

    pub fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ClipError::WriteError {
            path: path.into(),
            source,
        }
    }

    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ClipError::StorageUnavailable {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_path_and_entity() {
        let err = ClipError::NotFound {
            path: PathBuf::from("missing.osm.pbf"),
        };
        assert_eq!(err.to_string(), "File not found: missing.osm.pbf");

        let err = ClipError::malformed(EntityKind::Way, 42, "way references no nodes");
        assert_eq!(err.to_string(), "Malformed way 42: way references no nodes");

        let err = ClipError::MissingAttribute {
            path: PathBuf::from("forests.geojson"),
            index: 3,
            candidates: vec!["name".to_string(), "forestname".to_string()],
        };
        assert!(err.to_string().contains("feature 3"));
        assert!(err.to_string().contains("name, forestname"));
    }
}

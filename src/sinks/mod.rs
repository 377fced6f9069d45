use clap::ValueEnum;
use geo_types::{Geometry, LineString};
use ::geojson::Feature;
use ::geojson::feature::Id;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::entity::{Node, Way};
use crate::error::ClipError;
use crate::stream::StreamHeader;

pub mod geojson;
pub mod geojsonl;
pub mod osmjson;

pub use self::geojson::GeoJsonSink;
pub use self::geojsonl::GeoJsonlSink;
pub use self::osmjson::OsmJsonSink;

pub type OutputWriter = Box<dyn Write + Send>;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum OutputFormat {
    #[value(name = "osmjson")]
    OsmJson,
    #[value(name = "geojson")]
    GeoJson,
    #[value(name = "geojsonl")]
    GeoJsonl,
}

impl OutputFormat {
    pub fn detect(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        match ext.to_lowercase().as_str() {
            "geojson" => Some(OutputFormat::GeoJson),
            "geojsonl" => Some(OutputFormat::GeoJsonl),
            "jsonl" | "json" | "osmjson" => Some(OutputFormat::OsmJson),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OutputFormat::OsmJson => "osmjson",
            OutputFormat::GeoJson => "geojson",
            OutputFormat::GeoJsonl => "geojsonl",
        }
    }
}

/// Receives the final entity stream: referenced nodes first, then ways.
pub trait DataSink: Send {
    fn add_node(&mut self, node: &Node) -> io::Result<()>;
    fn add_way(&mut self, way: &Way) -> io::Result<()>;
    fn finish(&mut self) -> io::Result<()>;
}

pub fn open_sink(
    format: OutputFormat,
    writer: OutputWriter,
    header: &StreamHeader,
) -> io::Result<Box<dyn DataSink>> {
    Ok(match format {
        OutputFormat::OsmJson => Box::new(OsmJsonSink::new(writer, header)?),
        OutputFormat::GeoJson => Box::new(GeoJsonSink::new(writer)?),
        OutputFormat::GeoJsonl => Box::new(GeoJsonlSink::new(writer)),
    })
}

/// LineString feature for a resolved way. Ways with fewer than two known
/// locations get a `null` geometry.
pub fn way_feature(way: &Way) -> Feature {
    let coords: Vec<(f64, f64)> = way
        .resolved_locations()
        .map(|loc| (loc.lon, loc.lat))
        .collect();
    let geometry = (coords.len() >= 2)
        .then(|| ::geojson::Geometry::from(&Geometry::LineString(LineString::from(coords))));

    let properties: Map<String, Value> = way
        .tags
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    Feature {
        bbox: None,
        geometry,
        id: Some(Id::Number(way.id.into())),
        properties: Some(properties),
        foreign_members: None,
    }
}

/// Output written to a temporary file next to its destination and moved into
/// place by [`StagedOutput::commit`]. Dropping it uncommitted removes the
/// temporary file, so a failed run leaves nothing behind.
pub struct StagedOutput {
    dest: PathBuf,
    overwrite: bool,
    temp: NamedTempFile,
}

impl StagedOutput {
    pub fn create(dest: &Path, overwrite: bool) -> Result<Self, ClipError> {
        if !overwrite && dest.exists() {
            return Err(ClipError::write(
                dest,
                io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "output exists, pass --overwrite to replace it",
                ),
            ));
        }
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let temp = tempfile::Builder::new()
            .prefix(".highclip-")
            .tempfile_in(dir)
            .map_err(|source| ClipError::write(dest, source))?;
        Ok(Self {
            dest: dest.to_path_buf(),
            overwrite,
            temp,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dest
    }

    pub fn writer(&self) -> Result<OutputWriter, ClipError> {
        let file: File = self
            .temp
            .as_file()
            .try_clone()
            .map_err(|source| ClipError::write(&self.dest, source))?;
        Ok(Box::new(file))
    }

    pub fn commit(self) -> Result<(), ClipError> {
        let persisted = if self.overwrite {
            self.temp.persist(&self.dest)
        } else {
            self.temp.persist_noclobber(&self.dest)
        };
        persisted.map_err(|err| ClipError::write(&self.dest, err.error))?;
        tracing::debug!("Sink: committed {:?}", self.dest);
        Ok(())
    }
}

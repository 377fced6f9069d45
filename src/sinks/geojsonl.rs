use super::{DataSink, OutputWriter, way_feature};
use geojson::GeoJson;
use std::io::{self, BufWriter, Write};

use crate::entity::{Node, Way};

/// One GeoJSON feature per line.
pub struct GeoJsonlSink {
    writer: BufWriter<OutputWriter>,
}

impl GeoJsonlSink {
    pub fn new(writer: OutputWriter) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }
}

impl DataSink for GeoJsonlSink {
    fn add_node(&mut self, _node: &Node) -> io::Result<()> {
        Ok(())
    }

    fn add_way(&mut self, way: &Way) -> io::Result<()> {
        let geojson = GeoJson::Feature(way_feature(way));
        serde_json::to_writer(&mut self.writer, &geojson)?;
        writeln!(self.writer)?;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

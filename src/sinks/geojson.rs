use super::{DataSink, OutputWriter, way_feature};
use geojson::GeoJson;
use std::io::{self, BufWriter, Write};

use crate::entity::{Node, Way};

/// A single FeatureCollection, streamed feature by feature.
pub struct GeoJsonSink {
    writer: BufWriter<OutputWriter>,
    first_feature: bool,
}

impl GeoJsonSink {
    pub fn new(writer: OutputWriter) -> io::Result<Self> {
        let mut writer = BufWriter::new(writer);

        // Write the header of the FeatureCollection
        writeln!(writer, "{{")?;
        writeln!(writer, "  \"type\": \"FeatureCollection\",")?;
        writeln!(writer, "  \"features\": [")?;

        Ok(Self {
            writer,
            first_feature: true,
        })
    }
}

impl DataSink for GeoJsonSink {
    fn add_node(&mut self, _node: &Node) -> io::Result<()> {
        Ok(())
    }

    fn add_way(&mut self, way: &Way) -> io::Result<()> {
        if !self.first_feature {
            writeln!(self.writer, ",")?;
        }
        self.first_feature = false;

        let geojson = GeoJson::Feature(way_feature(way));
        serde_json::to_writer(&mut self.writer, &geojson)?;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        // Close the array and object
        writeln!(self.writer)?;
        writeln!(self.writer, "  ]")?;
        writeln!(self.writer, "}}")?;
        self.writer.flush()
    }
}

use super::{DataSink, OutputWriter};
use std::io::{self, BufWriter, Write};

use crate::entity::{Entity, Node, Way};
use crate::stream::StreamHeader;
use crate::stream::osmjson::{write_entity, write_header};

/// OSM JSON line stream with a header line written before any entity.
pub struct OsmJsonSink {
    writer: BufWriter<OutputWriter>,
}

impl OsmJsonSink {
    pub fn new(writer: OutputWriter, header: &StreamHeader) -> io::Result<Self> {
        let mut writer = BufWriter::new(writer);
        write_header(&mut writer, header)?;
        Ok(Self { writer })
    }

    /// Write any entity, used for the intermediate way streams.
    pub fn add_entity(&mut self, entity: &Entity) -> io::Result<()> {
        write_entity(&mut self.writer, entity)
    }
}

impl DataSink for OsmJsonSink {
    fn add_node(&mut self, node: &Node) -> io::Result<()> {
        self.add_entity(&Entity::Node(node.clone()))
    }

    fn add_way(&mut self, way: &Way) -> io::Result<()> {
        self.add_entity(&Entity::Way(way.clone()))
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

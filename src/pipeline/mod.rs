//! Two-pass filter and clip.
//!
//! Pass 1 selects ways by tag, writes them to an intermediate stream and
//! collects the node ids they reference. Pass 2 indexes the locations of
//! those nodes, resolves the intermediate ways against the index, applies the
//! boundary clip and writes referenced nodes plus retained ways to the output.
//! The output only appears at its destination once the whole run succeeded.

use crossbeam_channel::{Sender, bounded};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tempfile::NamedTempFile;

use crate::boundary::BoundaryStore;
use crate::collector::IdCollector;
use crate::config::{ClipPolicy, NodeCacheMode, RuntimeConfig};
use crate::entity::{Entity, EntityKind, KindFilter, Location, Node, Tags, Way};
use crate::error::ClipError;
use crate::filter::TagPredicate;
use crate::sinks::{DataSink, OsmJsonSink, OutputFormat, OutputWriter, StagedOutput, open_sink};
use crate::storage::{LocationIndex, LocationWriter};
use crate::stream::{EntityReader, RawBatch, StreamFormat, StreamHeader};
use crate::utils::{Diagnostics, ProgressCounter};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    ScanningWays,
    ScanningNodes,
    Done,
    Failed,
}

#[derive(Clone, Debug)]
pub struct OutputSpec {
    pub path: PathBuf,
    pub format: OutputFormat,
    pub overwrite: bool,
}

/// Boundary gate applied to resolved ways.
#[derive(Clone, Debug)]
pub struct Clip {
    store: Arc<BoundaryStore>,
    region: Option<String>,
    policy: ClipPolicy,
}

impl Clip {
    pub fn new(store: Arc<BoundaryStore>, region: Option<String>, policy: ClipPolicy) -> Self {
        Self {
            store,
            region,
            policy,
        }
    }

    /// A node without a known location is never inside.
    pub fn retains(&self, way: &Way) -> bool {
        let mut inside = way.locations.iter().map(|location| {
            location.is_some_and(|location| self.store.contains(location, self.region.as_deref()))
        });
        match self.policy {
            ClipPolicy::Any => inside.any(|inside| inside),
            ClipPolicy::All => !way.locations.is_empty() && inside.all(|inside| inside),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub ways_selected: u64,
    pub node_refs: u64,
    pub nodes_indexed: u64,
    pub ways_clipped: u64,
    pub ways_emitted: u64,
    pub nodes_emitted: u64,
    /// Node references whose location was not found in the input
    pub missing_locations: u64,
}

pub struct FilterPipeline {
    predicate: Arc<TagPredicate>,
    clip: Option<Clip>,
    runtime: Arc<RuntimeConfig>,
    diagnostics: Diagnostics,
    state: PipelineState,
    collector: IdCollector,
}

impl FilterPipeline {
    pub fn new(
        predicate: Arc<TagPredicate>,
        runtime: Arc<RuntimeConfig>,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            predicate,
            clip: None,
            runtime,
            diagnostics,
            state: PipelineState::Idle,
            collector: IdCollector::new(),
        }
    }

    pub fn with_clip(mut self, clip: Clip) -> Self {
        self.clip = Some(clip);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Ids recorded by the last way scan.
    #[cfg(test)]
    pub fn collector(&self) -> &IdCollector {
        &self.collector
    }

    /// Filter `input` into `output`. On error nothing is written to the
    /// output path and the pipeline ends in [`PipelineState::Failed`].
    pub fn run(&mut self, input: &Path, output: &OutputSpec) -> Result<PipelineSummary, ClipError> {
        let diagnostics = self.diagnostics.clone();
        diagnostics.in_scope(|| {
            self.state = PipelineState::Idle;
            self.collector = IdCollector::new();
            let start = std::time::Instant::now();

            match self.execute(input, output) {
                Ok(summary) => {
                    self.transition(PipelineState::Done);
                    tracing::info!(
                        "Done! Written {} ways and {} nodes to {:?} in {:.2}s",
                        summary.ways_emitted,
                        summary.nodes_emitted,
                        output.path,
                        start.elapsed().as_secs_f64()
                    );
                    Ok(summary)
                }
                Err(err) => {
                    tracing::debug!("Pipeline: failed while {:?}: {}", self.state, err);
                    self.transition(PipelineState::Failed);
                    Err(err)
                }
            }
        })
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::debug!("Pipeline: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn execute(&mut self, input: &Path, output: &OutputSpec) -> Result<PipelineSummary, ClipError> {
        let mut summary = PipelineSummary::default();
        let staged = StagedOutput::create(&output.path, output.overwrite)?;
        let header = StreamHeader::new(self.runtime.generator.clone());

        self.transition(PipelineState::ScanningWays);
        tracing::info!("Pass 1/2: Selecting ways from {:?}...", input);
        let ways = scratch_file()?;
        self.collector = self.scan_ways(input, &ways, &header)?;
        summary.ways_selected = self.collector.len(EntityKind::Way);
        summary.node_refs = self.collector.len(EntityKind::Node);
        if self.collector.is_empty(EntityKind::Way) {
            tracing::warn!("No ways matched the filter in {:?}", input);
        }
        tracing::info!(
            "Selected {} ways referencing {} nodes.",
            summary.ways_selected,
            summary.node_refs
        );

        self.transition(PipelineState::ScanningNodes);
        let (index, nodes_indexed) = self.index_nodes(input)?;
        summary.nodes_indexed = nodes_indexed;
        tracing::info!("Indexed {} node locations.", nodes_indexed);

        let resolved = scratch_file()?;
        let emitted_nodes =
            self.resolve_ways(ways.path(), &resolved, &index, &header, &mut summary)?;
        drop(ways);

        self.emit(
            &staged,
            output.format,
            &header,
            &index,
            &emitted_nodes,
            resolved.path(),
            &mut summary,
        )?;
        staged.commit()?;
        Ok(summary)
    }

    /// Pass 1: select ways in stream order and write them to `scratch`.
    fn scan_ways(
        &self,
        input: &Path,
        scratch: &NamedTempFile,
        header: &StreamHeader,
    ) -> Result<IdCollector, ClipError> {
        let reader = EntityReader::open(input, KindFilter::WAYS)?;
        let progress = self.diagnostics.progress("Pass 1/2: ways", reader.file_size());
        let offset = reader.offset_handle();

        let scratch_path = scratch.path().to_path_buf();
        let mut sink = OsmJsonSink::new(scratch_writer(scratch)?, header)
            .map_err(|source| ClipError::write(&scratch_path, source))?;

        let (tx, rx) = bounded::<Vec<Way>>(CHANNEL_CAPACITY);
        let diagnostics = self.diagnostics.clone();
        let writer = std::thread::spawn(move || {
            diagnostics.in_scope(|| -> Result<IdCollector, ClipError> {
                let mut collector = IdCollector::new();
                for batch in rx {
                    for way in batch {
                        collector.record(&way);
                        collector.insert(EntityKind::Way, way.id as u64);
                        sink.add_entity(&Entity::Way(way))
                            .map_err(|source| ClipError::write(&scratch_path, source))?;
                    }
                }
                sink.finish()
                    .map_err(|source| ClipError::write(&scratch_path, source))?;
                Ok(collector)
            })
        });

        let scan_result = select_ways(reader, &self.predicate, &tx, &progress, &offset);
        drop(tx);

        let collector = join_worker("Way writer", writer, scan_result)?;
        progress.finish();
        Ok(collector)
    }

    /// Pass 2, first half: store the location of every node a selected way needs.
    fn index_nodes(&self, input: &Path) -> Result<(LocationIndex, u64), ClipError> {
        let reader = EntityReader::open(input, KindFilter::NODES)?;
        let total = reader.file_size();
        let mode = self.runtime.node_cache_mode.resolve(total);
        let store = self.create_location_writer(mode, total)?;

        // Sorted input reaches a sparse store in order, sparing it the final sort
        let parallel = mode != NodeCacheMode::Sparse;
        tracing::info!(
            "Pass 2/2: Indexing node locations from {:?} ({})...",
            input,
            if parallel { "parallel" } else { "sequential" }
        );

        let progress = self.diagnostics.progress("Pass 2/2: nodes", total);
        let offset = reader.offset_handle();
        let (tx, rx) = bounded::<Vec<(u64, Location)>>(CHANNEL_CAPACITY);

        let diagnostics = self.diagnostics.clone();
        let writer = std::thread::spawn(move || {
            diagnostics.in_scope(|| -> Result<(LocationWriter, u64), ClipError> {
                let mut store = store;
                let mut count = 0u64;
                for batch in rx {
                    for (id, location) in batch {
                        store.set(id, location)?;
                        count += 1;
                    }
                }
                Ok((store, count))
            })
        });

        let needed = &self.collector;
        let diagnostics = &self.diagnostics;
        let decode = |batch: Result<RawBatch, ClipError>| {
            diagnostics.in_scope(|| -> Result<(), ClipError> {
                let located = needed_locations(batch?.decode()?, needed)?;
                progress.update(offset.load(Ordering::Relaxed));
                if !located.is_empty() {
                    tx.send(located).map_err(|_| disconnected("Node writer"))?;
                }
                Ok(())
            })
        };
        let decode_result = if parallel {
            reader.par_bridge().try_for_each(decode)
        } else {
            reader.into_iter().try_for_each(decode)
        };
        drop(tx);

        let (store, count) = join_worker("Node writer", writer, decode_result)?;
        progress.finish();

        tracing::debug!("Finalizing node location index ({})", mode.label());
        Ok((store.finalize()?, count))
    }

    fn create_location_writer(
        &self,
        mode: NodeCacheMode,
        input_size: u64,
    ) -> Result<LocationWriter, ClipError> {
        let initial = self.runtime.node_cache_initial_nodes;
        match mode {
            NodeCacheMode::Dense => match &self.runtime.node_cache_path {
                Some(path) => {
                    tracing::info!("Node cache: dense at {:?} ({} initial slots)", path, initial);
                    LocationWriter::new_dense(path, initial)
                }
                None => {
                    tracing::info!("Node cache: dense (temp file, {} initial slots)", initial);
                    LocationWriter::new_dense_temp(initial)
                }
            },
            NodeCacheMode::Memory => {
                tracing::info!("Node cache: memory");
                Ok(LocationWriter::new_memory())
            }
            // `resolve` never yields auto
            NodeCacheMode::Sparse | NodeCacheMode::Auto => {
                tracing::info!(
                    "Node cache: sparse (temp file, {:.1} GB input)",
                    input_size as f64 / (1024.0 * 1024.0 * 1024.0)
                );
                LocationWriter::new_sparse()
            }
        }
    }

    /// Pass 2, second half: attach locations to the intermediate ways, apply
    /// the clip and write retained ways to `resolved`. Returns the node ids
    /// the retained ways reference.
    fn resolve_ways(
        &self,
        ways: &Path,
        resolved: &NamedTempFile,
        index: &LocationIndex,
        header: &StreamHeader,
        summary: &mut PipelineSummary,
    ) -> Result<IdCollector, ClipError> {
        let reader = EntityReader::open_as(ways, StreamFormat::OsmJson, KindFilter::WAYS)?;
        let resolved_path = resolved.path();
        let write_err = |source| ClipError::write(resolved_path, source);
        let mut sink = OsmJsonSink::new(scratch_writer(resolved)?, header).map_err(write_err)?;
        let mut emitted = IdCollector::new();

        for batch in reader {
            for entity in batch?.decode()? {
                let Entity::Way(mut way) = entity else {
                    continue;
                };
                way.locations = way.refs.iter().map(|&id| index.get(id as u64)).collect();

                let missing = way.missing_locations();
                if missing > 0 {
                    tracing::debug!("Way {}: {} node location(s) not found", way.id, missing);
                    summary.missing_locations += missing as u64;
                }

                if let Some(clip) = &self.clip
                    && !clip.retains(&way)
                {
                    summary.ways_clipped += 1;
                    continue;
                }

                emitted.record(&way);
                sink.add_entity(&Entity::Way(way)).map_err(write_err)?;
                summary.ways_emitted += 1;
            }
        }
        sink.finish().map_err(write_err)?;

        if self.clip.is_some() {
            tracing::info!(
                "Clip: kept {} ways, dropped {}.",
                summary.ways_emitted,
                summary.ways_clipped
            );
        }
        Ok(emitted)
    }

    /// Write nodes in ascending id order, then the retained ways.
    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        staged: &StagedOutput,
        format: OutputFormat,
        header: &StreamHeader,
        index: &LocationIndex,
        nodes: &IdCollector,
        resolved: &Path,
        summary: &mut PipelineSummary,
    ) -> Result<(), ClipError> {
        let dest = staged.path();
        let write_err = |source| ClipError::write(dest, source);
        tracing::info!("Sink: {} -> {:?}", format.label(), dest);
        let mut sink = open_sink(format, staged.writer()?, header).map_err(write_err)?;

        for id in nodes.all(EntityKind::Node) {
            let Some(location) = index.get(id) else {
                continue;
            };
            let node = Node {
                id: id as i64,
                location: Some(location),
                tags: Tags::new(),
            };
            sink.add_node(&node).map_err(write_err)?;
            summary.nodes_emitted += 1;
        }

        let reader = EntityReader::open_as(resolved, StreamFormat::OsmJson, KindFilter::WAYS)?;
        for batch in reader {
            for entity in batch?.decode()? {
                if let Entity::Way(way) = entity {
                    sink.add_way(&way).map_err(write_err)?;
                }
            }
        }
        sink.finish().map_err(write_err)
    }
}

fn select_ways(
    mut reader: EntityReader,
    predicate: &TagPredicate,
    tx: &Sender<Vec<Way>>,
    progress: &ProgressCounter,
    offset: &AtomicU64,
) -> Result<(), ClipError> {
    for batch in reader.by_ref() {
        let mut selected = Vec::new();
        for entity in batch?.decode()? {
            let Entity::Way(way) = entity else {
                continue;
            };
            if !predicate.matches(&way.tags) {
                continue;
            }
            validate_way(&way)?;
            selected.push(way);
        }
        progress.update(offset.load(Ordering::Relaxed));
        if !selected.is_empty() {
            tx.send(selected).map_err(|_| disconnected("Way writer"))?;
        }
    }
    if let Some(header) = reader.header() {
        tracing::debug!(
            "Reader: {:?} is OSM JSON {} from {:?}",
            reader.path(),
            header.version,
            header.generator
        );
    }
    Ok(())
}

fn validate_way(way: &Way) -> Result<(), ClipError> {
    if way.refs.is_empty() {
        return Err(ClipError::malformed(
            EntityKind::Way,
            way.id,
            "way references no nodes",
        ));
    }
    if let Some(bad) = way.refs.iter().find(|&&id| id <= 0) {
        return Err(ClipError::malformed(
            EntityKind::Way,
            way.id,
            format!("invalid node reference {}", bad),
        ));
    }
    Ok(())
}

/// Locations of the nodes in `entities` that some selected way references.
fn needed_locations(
    entities: Vec<Entity>,
    needed: &IdCollector,
) -> Result<Vec<(u64, Location)>, ClipError> {
    let mut located = Vec::new();
    for entity in entities {
        let Entity::Node(node) = entity else {
            continue;
        };
        if node.id <= 0 || !needed.contains(EntityKind::Node, node.id as u64) {
            continue;
        }
        let Some(location) = node.location else {
            return Err(ClipError::malformed(
                EntityKind::Node,
                node.id,
                "referenced node has no location",
            ));
        };
        located.push((node.id as u64, location));
    }
    Ok(located)
}

fn scratch_file() -> Result<NamedTempFile, ClipError> {
    tempfile::Builder::new()
        .prefix("highclip-")
        .suffix(".jsonl")
        .tempfile()
        .map_err(|source| ClipError::write(std::env::temp_dir(), source))
}

fn scratch_writer(scratch: &NamedTempFile) -> Result<OutputWriter, ClipError> {
    let file = scratch
        .as_file()
        .try_clone()
        .map_err(|source| ClipError::write(scratch.path(), source))?;
    Ok(Box::new(file))
}

fn disconnected(stage: &'static str) -> ClipError {
    ClipError::WorkerPanicked {
        stage,
        message: "receiver disconnected".to_string(),
    }
}

/// Join a writer thread. Its error is the root cause when the producer failed
/// on a disconnected channel, so it is reported first.
fn join_worker<T>(
    stage: &'static str,
    handle: JoinHandle<Result<T, ClipError>>,
    producer: Result<(), ClipError>,
) -> Result<T, ClipError> {
    let value = match handle.join() {
        Ok(Ok(value)) => value,
        Ok(Err(writer_err)) => {
            if let Err(producer_err) = &producer {
                tracing::debug!("{} failed, producer stopped with: {}", stage, producer_err);
            }
            return Err(writer_err);
        }
        Err(panic_payload) => {
            let message = panic_payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            return Err(ClipError::WorkerPanicked { stage, message });
        }
    };

    // Only check the producer if the writer succeeded
    producer?;
    Ok(value)
}

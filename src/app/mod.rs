use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::boundary::BoundaryStore;
use crate::config::{
    BoundaryConfig, ClipPolicy, DEFAULT_INITIAL_NODES, DefaultAction, FiltersConfig, NodeCacheMode,
    RuntimeConfig,
};
use crate::filter::{TagPredicate, parse_rule};
use crate::pipeline::{Clip, FilterPipeline, OutputSpec, PipelineSummary};
use crate::sinks::OutputFormat;
use crate::utils::Diagnostics;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run the filter pipeline; without it the boundary dataset is exported to --output
    #[arg(long)]
    pub filter: bool,

    /// Input entity stream (.osm.pbf or OSM JSON lines)
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Output file (.jsonl, .geojson, .geojsonl)
    #[arg(short, long)]
    pub output: PathBuf,

    /// Boundary dataset (GeoJSON) used for clipping
    #[arg(short, long)]
    pub boundary: Option<PathBuf>,

    /// Filter configuration file (YAML)
    #[arg(long)]
    pub filters: Option<PathBuf>,

    /// Tag rule such as `highway=path|track` (repeatable, replaces configured rules)
    #[arg(long = "tag", value_name = "RULE")]
    pub tags: Vec<String>,

    /// Only keep ways inside this boundary region
    #[arg(long)]
    pub region: Option<String>,

    /// Keep ways with any node inside, or only with all nodes inside
    #[arg(long, value_enum)]
    pub clip_policy: Option<ClipPolicy>,

    /// Also write the outer rings of the boundary regions here
    #[arg(long)]
    pub export_boundaries: Option<PathBuf>,

    /// Output format (auto-detected if omitted)
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Force specific node cache mode
    #[arg(long, value_enum)]
    pub node_cache_mode: Option<NodeCacheMode>,

    /// Keep the dense node cache at this path
    #[arg(long)]
    pub node_cache: Option<PathBuf>,

    /// Initial slot count of the dense node cache (grows as needed)
    #[arg(long)]
    pub node_cache_initial_nodes: Option<u64>,

    /// Replace an existing output file
    #[arg(long)]
    pub overwrite: bool,

    /// Number of threads (default: all cores)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Log file, always written at debug level
    #[arg(long, default_value = "highclip.log")]
    pub log_file: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

pub fn run(cli: &Cli, diagnostics: &Diagnostics) -> Result<()> {
    let filters = match &cli.filters {
        Some(path) => FiltersConfig::load(path)
            .with_context(|| format!("CLI: Failed to load filter config {:?}", path))?,
        None => FiltersConfig::default(),
    };

    if !cli.filter {
        let boundary = cli
            .boundary
            .as_ref()
            .context("CLI: --boundary is required to export boundaries (or pass --filter)")?;
        let store = BoundaryStore::load(boundary, &filters.boundary)?;
        store.export_regions(&cli.output)?;
        return Ok(());
    }

    let input = cli
        .input
        .as_ref()
        .context("CLI: --input is required with --filter")?;
    let predicate = Arc::new(build_predicate(&cli.tags, &filters)?);
    tracing::info!(
        "Filter: {} rule(s), default {}, invert {}",
        predicate.rules().len(),
        if predicate.default_deny() { "deny" } else { "accept" },
        predicate.inverted()
    );

    let format = cli
        .format
        .or_else(|| OutputFormat::detect(&cli.output))
        .context("CLI: Could not detect output format from extension; use --format")?;

    let runtime = Arc::new(RuntimeConfig {
        node_cache_mode: cli.node_cache_mode.unwrap_or(NodeCacheMode::Auto),
        node_cache_path: cli.node_cache.clone(),
        node_cache_initial_nodes: cli
            .node_cache_initial_nodes
            .unwrap_or(DEFAULT_INITIAL_NODES),
        ..RuntimeConfig::default()
    });

    let mut pipeline = FilterPipeline::new(predicate, runtime, diagnostics.clone());
    let mut export = None;
    if let Some(boundary) = &cli.boundary {
        let region = cli.region.clone().or_else(|| filters.clip.region.clone());
        let policy = cli.clip_policy.unwrap_or(filters.clip.policy);
        let store = load_clip_boundaries(boundary, &filters.boundary, region.as_deref())?;
        if let Some(path) = &cli.export_boundaries {
            export = Some((Arc::clone(&store), path));
        }
        tracing::info!(
            "Clip: {} region(s), policy {:?}, region {}",
            store.len(),
            policy,
            region.as_deref().unwrap_or("<any>")
        );
        pipeline = pipeline.with_clip(Clip::new(store, region, policy));
    } else if cli.region.is_some() || cli.export_boundaries.is_some() {
        bail!("CLI: --region and --export-boundaries need --boundary");
    }

    let output = OutputSpec {
        path: cli.output.clone(),
        format,
        overwrite: cli.overwrite,
    };
    let result = pipeline.run(input, &output);
    tracing::debug!("Pipeline finished in state {:?}", pipeline.state());
    let summary = result?;
    log_summary(&summary);

    // Only a successful run leaves the boundary export behind
    if let Some((store, path)) = export {
        store.export_regions(path)?;
    }
    Ok(())
}

/// CLI rules replace the configured ones; default and invert still come from the config.
pub fn build_predicate(tags: &[String], filters: &FiltersConfig) -> Result<TagPredicate> {
    if tags.is_empty() {
        return Ok(filters.filter.build());
    }
    let mut predicate = TagPredicate::new(filters.filter.default == DefaultAction::Deny)
        .with_invert(filters.filter.invert);
    for spec in tags {
        for rule in parse_rule(spec).map_err(|err| anyhow::anyhow!("CLI: {}", err))? {
            predicate.add_rule(rule);
        }
    }
    Ok(predicate)
}

fn load_clip_boundaries(
    path: &Path,
    config: &BoundaryConfig,
    region: Option<&str>,
) -> Result<Arc<BoundaryStore>> {
    let store = BoundaryStore::load(path, config)?;
    if let Some(region) = region
        && store.region(region).is_none()
    {
        let known: Vec<&str> = store.names().collect();
        bail!(
            "CLI: region {:?} not found in {:?} (known: {})",
            region,
            path,
            known.join(", ")
        );
    }
    if store.is_empty() {
        tracing::warn!("Boundary dataset {:?} has no regions; every way will be clipped", path);
    }
    Ok(Arc::new(store))
}

fn log_summary(summary: &PipelineSummary) {
    tracing::info!(
        "Summary: {} ways selected, {} node refs, {} nodes indexed, {} ways clipped, {} ways and {} nodes written, {} missing locations",
        summary.ways_selected,
        summary.node_refs,
        summary.nodes_indexed,
        summary.ways_clipped,
        summary.ways_emitted,
        summary.nodes_emitted,
        summary.missing_locations
    );
    if summary.missing_locations > 0 {
        tracing::warn!(
            "{} node reference(s) had no location in the input",
            summary.missing_locations
        );
    }
}

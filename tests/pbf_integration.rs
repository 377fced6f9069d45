use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Command;

const FOREST: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {
      "type": "Feature",
      "properties": { "name": "Forest A" },
      "geometry": {
        "type": "Polygon",
        "coordinates": [[[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]]]
      }
    }
  ]
}"#;

/// Plain nodes 1-2, dense nodes 3-5, ways 10 (path), 11 (track), 12 (building),
/// 13 (footway) and one route relation.
fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("fixture")
        .join("forest_roads.osm.pbf")
}

fn run_highclip(dir: &Path, args: &[&str]) {
    let output = Command::new(env!("CARGO_BIN_EXE_highclip"))
        .current_dir(dir)
        .arg("--filter")
        .arg("--input")
        .arg(fixture_path())
        .arg("--log-file")
        .arg(dir.join("highclip.log"))
        .args(args)
        .output()
        .expect("run highclip");

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!("highclip failed: {}", stderr);
    }
}

fn read_lines(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .expect("read output")
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect()
}

fn ids_of(lines: &[Value], kind: &str) -> Vec<i64> {
    lines
        .iter()
        .filter(|line| line["type"] == kind)
        .map(|line| line["id"].as_i64().expect("id"))
        .collect()
}

#[test]
fn clips_pbf_ways_with_parallel_node_pass() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("forest.geojson"), FOREST).unwrap();

    run_highclip(
        dir.path(),
        &[
            "--output",
            "out.jsonl",
            "--boundary",
            "forest.geojson",
            "--node-cache-mode",
            "memory",
            "--threads",
            "2",
        ],
    );

    let lines = read_lines(&dir.path().join("out.jsonl"));
    assert_eq!(ids_of(&lines, "way"), vec![10, 13]);
    assert_eq!(ids_of(&lines, "node"), vec![1, 2, 3]);

    // node 3 comes from the dense group
    let far = lines.iter().find(|line| line["type"] == "node" && line["id"] == 3).unwrap();
    assert_eq!(far["lat"], 20.0);
    assert_eq!(far["lon"], 20.0);
}

#[test]
fn default_cache_mode_reads_pbf_in_order() {
    let dir = tempfile::tempdir().unwrap();

    run_highclip(dir.path(), &["--output", "out.jsonl", "--tag", "building"]);

    let lines = read_lines(&dir.path().join("out.jsonl"));
    assert_eq!(ids_of(&lines, "way"), vec![12]);
    assert_eq!(ids_of(&lines, "node"), vec![1, 5]);

    let way = lines.iter().find(|line| line["type"] == "way").unwrap();
    assert_eq!(way["tags"]["building"], "yes");
    assert_eq!(way["geometry"][0]["lat"], 5.0);
    assert_eq!(way["geometry"][1]["lon"], 1.0);
}

#[test]
fn dense_cache_writes_geojsonl() {
    let dir = tempfile::tempdir().unwrap();

    run_highclip(
        dir.path(),
        &["--output", "roads.geojsonl", "--node-cache-mode", "dense"],
    );

    let features = read_lines(&dir.path().join("roads.geojsonl"));
    let ids: Vec<i64> = features
        .iter()
        .map(|feature| feature["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![10, 11, 13]);
    assert_eq!(
        features[1]["geometry"]["coordinates"],
        serde_json::json!([[20.0, 20.0], [21.0, 21.0]])
    );
}

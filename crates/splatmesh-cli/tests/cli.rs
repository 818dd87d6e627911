use std::io::Write;
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use clap::Parser;
use splatmesh_cli::{Cli, execute, expand_response_file};
use splatmesh_ply::read_triangle_mesh;

fn write_ply(path: &Path, records: &[[f32; 7]]) {
    let mut bytes = Vec::new();
    write!(
        bytes,
        "ply\nformat binary_little_endian 1.0\nelement vertex {}\n\
         property float x\nproperty float y\nproperty float z\n\
         property float nx\nproperty float ny\nproperty float nz\n\
         property float radius\nend_header\n",
        records.len()
    )
    .unwrap();
    for record in records {
        for &v in record {
            bytes.write_f32::<LittleEndian>(v).unwrap();
        }
    }
    std::fs::write(path, bytes).unwrap();
}

#[test]
fn defaults_match_the_documented_table() {
    let cli = Cli::parse_from(["splatmesh", "-o", "out.ply", "in.ply"]);
    assert_eq!(cli.fit.smooth, 4.0);
    assert_eq!(cli.fit.spacing, 0.01);
    assert_eq!(cli.fit.prune, 0.02);
    assert!(!cli.fit.keep_boundary);
    assert_eq!(cli.fit.boundary_limit, 1.5);
    assert_eq!(cli.advanced.levels, 7);
    assert_eq!(cli.advanced.subsampling, 2);
    assert_eq!(cli.advanced.max_device_splats, 1_000_000);
    assert_eq!(cli.advanced.max_host_splats, 50_000_000);
    assert_eq!(cli.advanced.max_split, 2_097_152);
    assert_eq!(cli.advanced.bucket_threads, 4);
    assert_eq!(cli.advanced.device_threads, 1);
    assert_eq!(cli.advanced.chunk_cells, 0);
    assert!(!cli.statistics);
}

#[test]
fn rejects_unknown_variants_and_missing_output() {
    assert!(Cli::try_parse_from(["splatmesh", "-o", "o.ply", "--writer", "weld", "in.ply"]).is_err());
    assert!(Cli::try_parse_from(["splatmesh", "-o", "o.ply", "--mesher", "simple", "in.ply"]).is_err());
    assert!(Cli::try_parse_from(["splatmesh", "in.ply"]).is_err());
    assert!(Cli::try_parse_from(["splatmesh", "-o", "o.ply"]).is_err());
}

#[test]
fn canonical_options_are_ordered_and_complete() {
    let cli = Cli::parse_from([
        "splatmesh",
        "-o",
        "out.ply",
        "--fit-keep-boundary",
        "--levels",
        "5",
        "a.ply",
        "b.ply",
    ]);
    let options = cli.canonical_options();
    assert!(options.contains(" --fit-keep-boundary"));
    assert!(options.contains(" --levels=5"));
    assert!(options.contains(" --output-file=out.ply"));
    assert!(options.contains(" --writer=stream"));
    assert!(options.contains(" --mesher=stxxl"));
    // Inputs and response files never appear.
    assert!(!options.contains("a.ply"));
    assert!(!options.contains("response-file"));
    // Name-ordered, like the original option dump.
    let bucket = options.find("--bucket-threads").unwrap();
    let writer = options.find("--writer").unwrap();
    assert!(bucket < writer);
}

#[test]
fn response_files_extend_the_command_line() {
    let dir = tempfile::tempdir().unwrap();
    let rsp = dir.path().join("extra.rsp");
    std::fs::write(&rsp, "--fit-grid 0.5\n--levels 4 --subsampling 1\n").unwrap();

    let args = vec![
        "splatmesh".to_owned(),
        "-o".to_owned(),
        "out.ply".to_owned(),
        format!("--response-file={}", rsp.display()),
        "in.ply".to_owned(),
    ];
    let (expanded, warning) = expand_response_file(args);
    assert!(warning.is_none());
    let cli = Cli::parse_from(&expanded);
    assert_eq!(cli.fit.spacing, 0.5);
    assert_eq!(cli.advanced.levels, 4);
    assert_eq!(cli.advanced.subsampling, 1);
}

#[test]
fn missing_response_file_is_only_a_warning() {
    let args = vec![
        "splatmesh".to_owned(),
        "-o".to_owned(),
        "out.ply".to_owned(),
        "--response-file".to_owned(),
        "/nonexistent/options.rsp".to_owned(),
        "in.ply".to_owned(),
    ];
    let (expanded, warning) = expand_response_file(args.clone());
    assert_eq!(expanded, args);
    assert!(warning.unwrap().contains("ignoring"));
}

#[test]
fn end_to_end_execute_writes_mesh_and_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.ply");
    let output = dir.path().join("out.ply");
    let stats = dir.path().join("stats.txt");
    write_ply(&input, &[[0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0]]);

    let cli = Cli::parse_from([
        "splatmesh".to_owned(),
        "-o".to_owned(),
        output.display().to_string(),
        "--quiet".to_owned(),
        "--fit-grid".to_owned(),
        "0.5".to_owned(),
        "--levels".to_owned(),
        "4".to_owned(),
        "--subsampling".to_owned(),
        "1".to_owned(),
        format!("--statistics-file={}", stats.display()),
        input.display().to_string(),
    ]);
    execute(&cli).unwrap();

    let (vertices, triangles, comments) = read_triangle_mesh(&output).unwrap();
    assert!(!vertices.is_empty());
    assert!(!triangles.is_empty());
    assert!(comments.iter().any(|c| c.starts_with("splatmesh version:")));
    assert!(comments.iter().any(|c| c.starts_with("splatmesh options:")));
    assert!(
        comments
            .iter()
            .any(|c| *c == format!("splatmesh input: {}", input.display()))
    );

    let stats_text = std::fs::read_to_string(&stats).unwrap();
    assert!(stats_text.contains("host.block.splats"));
    assert!(stats_text.contains("components.kept"));
    assert!(stats_text.contains("output.files"));
}

#[test]
fn invalid_configuration_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.ply");
    write_ply(&input, &[[0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0]]);

    let cli = Cli::parse_from([
        "splatmesh".to_owned(),
        "-o".to_owned(),
        dir.path().join("out.ply").display().to_string(),
        "--quiet".to_owned(),
        "--max-split".to_owned(),
        "4".to_owned(),
        input.display().to_string(),
    ]);
    let err = execute(&cli).unwrap_err().to_string();
    assert!(err.contains("--max-split"), "{err}");
}

#[test]
fn truncated_input_is_a_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("short.ply");
    let mut bytes = Vec::new();
    write!(
        bytes,
        "ply\nformat binary_little_endian 1.0\nelement vertex 5\n\
         property float x\nproperty float y\nproperty float z\n\
         property float nx\nproperty float ny\nproperty float nz\n\
         property float radius\nend_header\n"
    )
    .unwrap();
    std::fs::write(&input, bytes).unwrap();

    let cli = Cli::parse_from([
        "splatmesh".to_owned(),
        "-o".to_owned(),
        dir.path().join("out.ply").display().to_string(),
        "--quiet".to_owned(),
        input.display().to_string(),
    ]);
    let err = execute(&cli).unwrap_err().to_string();
    assert!(err.contains("too small"), "{err}");
}

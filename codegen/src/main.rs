//! Regenerates `crates/proto/src/v1beta1/proto.rs` from `proto/v1beta1.proto`.
//!
//! Run with `--check` to only verify that the checked in file is current.

use std::{
  env, fs,
  path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use duct::cmd;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, Copy, Hash, PartialEq, Eq)]
struct LocateProject<'a> {
  root: &'a str,
}

pub fn find_workspace() -> Result<PathBuf> {
  let json = cmd!("cargo", "locate-project", "--workspace").read()?;

  let parsed = serde_json::from_str::<LocateProject>(&json)?;
  let manifest: &Path = parsed.root.as_ref();
  manifest
    .parent()
    .map(Path::to_owned)
    .context("workspace manifest has no parent directory")
}

fn main() -> Result<()> {
  let check = env::args().skip(1).any(|arg| arg == "--check");

  let root = find_workspace()?;
  let proto_dir = root.join("proto");
  let target_dir = root.join("target").join("proto");
  let proto_file = proto_dir.join("v1beta1.proto");

  fs::create_dir_all(&target_dir)?;

  let mut config = prost_build::Config::default();
  config.protoc_arg(format!("-I={}", proto_dir.display()));

  tonic_build::configure()
    .out_dir(&target_dir)
    .build_client(true)
    .build_server(true)
    .compile_with_config(config, &[proto_file], &[&proto_dir])?;

  let generated = target_dir.join("v1beta1.rs");
  let target_file = root
    .join("crates")
    .join("proto")
    .join("src")
    .join("v1beta1")
    .join("proto.rs");

  if check {
    let fresh = fs::read_to_string(&generated)?;
    let current = fs::read_to_string(&target_file)
      .with_context(|| format!("failed to read {}", target_file.display()))?;
    if fresh != current {
      bail!("{} is out of date, rerun codegen", target_file.display());
    }

    return Ok(());
  }

  fs::copy(&generated, &target_file)?;

  Ok(())
}

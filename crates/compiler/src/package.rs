//! Packaged artifact format
//!
//! A package is a tar archive with three entries:
//!
//! - `manifest.json`: format version, target, contract and checksums
//! - `program.json`: the compiled program
//! - `weights.bin`: parameters as little-endian f32, in program order
//!
//! Packages are written to a temporary file in the destination directory and
//! renamed into place, so readers never observe a partial package.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use common::error::{Error, IncompatibilityReason, Result};
use common::types::AcceleratorTarget;
use device_runtime::{ArgKey, TensorSpec};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::computation::ParameterStore;
use crate::program::Program;

/// Package format understood by this runtime
pub const FORMAT_VERSION: u32 = 1;

pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const PROGRAM_ENTRY: &str = "program.json";
pub const WEIGHTS_ENTRY: &str = "weights.bin";

/// Package manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Package format version
    pub format_version: u32,

    /// Name of the compiled computation
    pub name: String,

    /// Accelerator the package was compiled for
    pub target: AcceleratorTarget,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Tensor arguments in canonical order
    pub inputs: Vec<(ArgKey, TensorSpec)>,

    /// Output specs
    pub outputs: Vec<TensorSpec>,

    /// Number of kernel launches per call
    pub instructions: usize,

    /// Number of parameters
    pub parameters: usize,

    /// Non-tensor options specialized at export time
    #[serde(default)]
    pub options: BTreeMap<String, Option<f64>>,

    /// Kernels removed by fusion
    #[serde(default)]
    pub fused_kernels: usize,

    /// Whether matmul tiles were autotuned
    #[serde(default)]
    pub autotuned: bool,

    /// sha256 of every other entry, hex encoded
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

/// Decoded package contents
#[derive(Debug, Clone)]
pub struct Package {
    pub manifest: Manifest,
    pub program: Program,
    /// Parameter data in program order
    pub weights: Vec<Vec<f32>>,
}

/// Writes a package atomically and returns its size in bytes
pub fn write_package(path: &Path, mut manifest: Manifest, program: &Program, parameters: &ParameterStore) -> Result<(Manifest, u64)> {
    let program_bytes = serde_json::to_vec_pretty(program)?;

    let mut weights_bytes = Vec::with_capacity(program.parameter_elements() * 4);
    for (name, spec) in &program.parameters {
        let host = parameters
            .get(name)
            .ok_or_else(|| Error::Internal(format!("parameter {} missing from trace", name)))?;
        if &host.spec != spec {
            return Err(Error::Internal(format!(
                "parameter {} is {}, program expects {}",
                name, host.spec, spec
            )));
        }
        for value in &host.data {
            weights_bytes.extend_from_slice(&value.to_le_bytes());
        }
    }

    manifest.checksums.insert(PROGRAM_ENTRY.to_string(), sha256_hex(&program_bytes));
    manifest.checksums.insert(WEIGHTS_ENTRY.to_string(), sha256_hex(&weights_bytes));
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut temp = NamedTempFile::new_in(&dir)?;
    {
        let mut builder = tar::Builder::new(temp.as_file_mut());
        let mtime = manifest.created_at.timestamp().max(0) as u64;
        append_entry(&mut builder, MANIFEST_ENTRY, &manifest_bytes, mtime)?;
        append_entry(&mut builder, PROGRAM_ENTRY, &program_bytes, mtime)?;
        append_entry(&mut builder, WEIGHTS_ENTRY, &weights_bytes, mtime)?;
        builder.finish()?;
    }
    temp.as_file_mut().flush()?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;

    let size = fs::metadata(path)?.len();
    debug!("Wrote package {} ({} bytes)", path.display(), size);
    Ok((manifest, size))
}

fn append_entry<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8], mtime: u64) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_cksum();
    builder.append_data(&mut header, name, data)
}

/// Reads and verifies a package
pub fn read_package(path: &Path) -> Result<Package> {
    let mut entries = read_entries(path)?;
    let manifest = parse_manifest(path, &entries)?;

    if manifest.format_version != FORMAT_VERSION {
        return Err(Error::ArtifactIncompatible {
            path: path.to_path_buf(),
            reason: IncompatibilityReason::FormatVersion {
                supported: FORMAT_VERSION,
                found: manifest.format_version,
            },
        });
    }

    let program_bytes = take_entry(path, &mut entries, PROGRAM_ENTRY)?;
    let weights_bytes = take_entry(path, &mut entries, WEIGHTS_ENTRY)?;
    verify_checksum(path, &manifest, PROGRAM_ENTRY, &program_bytes)?;
    verify_checksum(path, &manifest, WEIGHTS_ENTRY, &weights_bytes)?;

    let program: Program = serde_json::from_slice(&program_bytes)
        .map_err(|e| corrupt(path, format!("invalid {}: {}", PROGRAM_ENTRY, e)))?;

    if weights_bytes.len() != program.parameter_elements() * 4 {
        return Err(corrupt(
            path,
            format!(
                "{} holds {} bytes, program needs {}",
                WEIGHTS_ENTRY,
                weights_bytes.len(),
                program.parameter_elements() * 4
            ),
        ));
    }
    let mut values = weights_bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]));
    let weights = program
        .parameters
        .iter()
        .map(|(_, spec)| values.by_ref().take(spec.numel()).collect())
        .collect();

    Ok(Package {
        manifest,
        program,
        weights,
    })
}

/// Reads only the manifest of a package
pub fn read_manifest(path: &Path) -> Result<Manifest> {
    let entries = read_entries(path)?;
    parse_manifest(path, &entries)
}

fn read_entries(path: &Path) -> Result<HashMap<String, Vec<u8>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::ArtifactNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    let mut archive = tar::Archive::new(file);
    let mut entries = HashMap::new();
    let iter = archive
        .entries()
        .map_err(|e| corrupt(path, format!("unreadable archive: {}", e)))?;
    for entry in iter {
        let mut entry = entry.map_err(|e| corrupt(path, format!("unreadable archive: {}", e)))?;
        let name = entry
            .path()
            .map_err(|e| corrupt(path, format!("invalid entry name: {}", e)))?
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| corrupt(path, format!("truncated entry {}: {}", name, e)))?;
        entries.insert(name, data);
    }
    Ok(entries)
}

fn parse_manifest(path: &Path, entries: &HashMap<String, Vec<u8>>) -> Result<Manifest> {
    let bytes = entries
        .get(MANIFEST_ENTRY)
        .ok_or_else(|| corrupt(path, format!("missing {}", MANIFEST_ENTRY)))?;
    serde_json::from_slice(bytes).map_err(|e| corrupt(path, format!("invalid {}: {}", MANIFEST_ENTRY, e)))
}

fn take_entry(path: &Path, entries: &mut HashMap<String, Vec<u8>>, name: &str) -> Result<Vec<u8>> {
    entries
        .remove(name)
        .ok_or_else(|| corrupt(path, format!("missing {}", name)))
}

fn verify_checksum(path: &Path, manifest: &Manifest, name: &str, data: &[u8]) -> Result<()> {
    let expected = manifest
        .checksums
        .get(name)
        .ok_or_else(|| corrupt(path, format!("no checksum recorded for {}", name)))?;
    let actual = sha256_hex(data);
    if &actual != expected {
        return Err(corrupt(
            path,
            format!("checksum mismatch for {}: expected {}, got {}", name, expected, actual),
        ));
    }
    Ok(())
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn corrupt(path: &Path, reason: String) -> Error {
    Error::ArtifactCorrupt {
        path: path.to_path_buf(),
        reason,
    }
}

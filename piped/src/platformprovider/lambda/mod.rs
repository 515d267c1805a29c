//! AWS Lambda adapter

mod client;
mod manifest;
mod traffic;

pub use client::{AwsCliClient, Client, TagChanges, DEFAULT_ALIAS_NAME};
pub use manifest::{
    Architecture, EphemeralStorage, FunctionManifest, FunctionManifestSpec, SourceCode, VpcConfig,
    FUNCTION_MANIFEST_KIND, VERSION_V1BETA1,
};
pub use traffic::{percent_to_weight, weight_to_percent, RoutingTrafficConfig, VersionTraffic};

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::errors::PipedError;

/// Zip every file under `src_dir` into `dest` with paths relative to `src_dir`.
/// The `.git` directory is left out.
pub async fn package_source(src_dir: &Path, dest: &Path) -> Result<(), PipedError> {
    let src_dir = src_dir.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || zip_dir(&src_dir, &dest))
        .await
        .map_err(|e| PipedError::Internal(format!("zip task failed: {}", e)))?
}

fn zip_dir(src_dir: &Path, dest: &Path) -> Result<(), PipedError> {
    let mut writer = ZipWriter::new(File::create(dest)?);
    let options = SimpleFileOptions::default().unix_permissions(0o755);
    let entries = WalkDir::new(src_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");

    let mut buffer = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PipedError::Internal(format!("failed to walk source: {}", e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|e| PipedError::Internal(e.to_string()))?
            .to_string_lossy()
            .replace('\\', "/");
        writer
            .start_file(relative, options)
            .map_err(|e| PipedError::Internal(format!("failed to add file to zip: {}", e)))?;
        buffer.clear();
        File::open(entry.path())?.read_to_end(&mut buffer)?;
        writer.write_all(&buffer)?;
    }
    writer
        .finish()
        .map_err(|e| PipedError::Internal(format!("failed to finish zip: {}", e)))?;
    Ok(())
}

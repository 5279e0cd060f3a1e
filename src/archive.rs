// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Source tree archives.
//!
//! Source trees are stored as gzip compressed tarballs whose entries all live
//! under a `src/` prefix. Extracting an archive into its artifact directory
//! therefore recreates the `src/` directory it was made from.

use crate::store::SRC_DIR_NAME;

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::{
    fs::{remove_file, File},
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Compress directory into a tarball at archive path.
///
/// Symlinks are stored as links, never followed. A partially written archive
/// is removed on failure.
///
/// # Errors
///
/// - Return [`ArchiveError::Compress`] if the archive cannot be written.
#[instrument(level = "debug")]
pub fn compress_dir(dir: &Path, archive: &Path) -> Result<()> {
    let result = write_archive(dir, archive);
    if result.is_err() {
        match remove_file(archive) {
            Err(err) if err.kind() != ErrorKind::NotFound => {
                debug!("failed to remove partial archive {:?}: {err}", archive.display())
            }
            _ => {}
        }
    }

    result.map_err(|err| ArchiveError::Compress {
        source: err,
        path: archive.to_path_buf(),
    })
}

fn write_archive(dir: &Path, archive: &Path) -> std::io::Result<()> {
    let encoder = GzEncoder::new(File::create(archive)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(SRC_DIR_NAME, dir)?;
    builder.into_inner()?.finish()?.sync_all()
}

/// Extract tarball into destination directory.
///
/// # Errors
///
/// - Return [`ArchiveError::Extract`] if the archive cannot be unpacked.
#[instrument(level = "debug")]
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    File::open(archive)
        .and_then(|file| tar::Archive::new(GzDecoder::new(file)).unpack(dest))
        .map_err(|err| ArchiveError::Extract {
            source: err,
            path: archive.to_path_buf(),
        })
}

/// Archive error types.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("failed to compress source into {:?}", path.display())]
    Compress {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to extract {:?}", path.display())]
    Extract {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

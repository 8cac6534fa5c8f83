//! On-disk generations.
//!
//! ```text
//! generations/
//!   CURRENT                 active generation number
//!   gen_000003/
//!     meta.json             IndexMeta
//!     records.bin           framed Organizations in EIN order
//! ```
//!
//! A generation directory is written under a `.tmp` name and renamed into
//! place when complete, so a directory named `gen_NNNNNN` is always whole.
//! Only normalized records are stored; postings and maps are rebuilt on load.

use crate::error::IndexBuildError;
use crate::index::build::IndexBuilder;
use crate::index::search_index::SearchIndex;
use crate::index::types::*;
use crate::utils::{FrameReader, remove_dir_if_exists, write_atomic, write_frame};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CURRENT_FILE: &str = "CURRENT";
pub const META_FILE: &str = "meta.json";
pub const RECORDS_FILE: &str = "records.bin";
const TMP_SUFFIX: &str = ".tmp";

pub fn generation_dir(generations: &Path, generation: Generation) -> PathBuf {
    generations.join(format!("gen_{:06}", generation))
}

fn tmp_dir(generations: &Path, generation: Generation) -> PathBuf {
    generations.join(format!("gen_{:06}{}", generation, TMP_SUFFIX))
}

/// Persist a generation. Returns its final directory.
pub fn write_generation(generations: &Path, index: &SearchIndex) -> Result<PathBuf, IndexBuildError> {
    let generation = index.generation();
    let tmp = tmp_dir(generations, generation);
    let dest = generation_dir(generations, generation);

    remove_dir_if_exists(&tmp).map_err(|e| IndexBuildError::storage(&tmp, e))?;
    fs::create_dir_all(&tmp).map_err(|e| IndexBuildError::storage(&tmp, e))?;

    let records_path = tmp.join(RECORDS_FILE);
    let bytes = write_records(&records_path, index.documents())
        .map_err(|e| IndexBuildError::storage(&records_path, e))?;

    let meta_path = tmp.join(META_FILE);
    let meta = serde_json::to_vec_pretty(index.meta()).map_err(|e| IndexBuildError::Corrupt {
        path: meta_path.clone(),
        reason: e.to_string(),
    })?;
    write_atomic(&meta_path, &meta).map_err(|e| IndexBuildError::storage(&meta_path, e))?;

    remove_dir_if_exists(&dest).map_err(|e| IndexBuildError::storage(&dest, e))?;
    fs::rename(&tmp, &dest).map_err(|e| IndexBuildError::storage(&dest, e))?;

    info!(generation, docs = index.len(), bytes, path = %dest.display(), "Generation written");
    Ok(dest)
}

fn write_records(path: &Path, docs: &[Organization]) -> io::Result<u64> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let mut bytes = 0;
    for org in docs {
        bytes += write_frame(&mut writer, org)?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(bytes)
}

pub fn read_meta(dir: &Path) -> Result<IndexMeta, IndexBuildError> {
    let path = dir.join(META_FILE);
    let content = fs::read(&path).map_err(|e| IndexBuildError::storage(&path, e))?;
    let meta: IndexMeta = serde_json::from_slice(&content).map_err(|e| IndexBuildError::Corrupt {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    if meta.version != IndexMeta::VERSION {
        return Err(IndexBuildError::Corrupt {
            path,
            reason: format!("unsupported index version {}", meta.version),
        });
    }
    Ok(meta)
}

/// Stream a generation's records as staged records (pass position = file position)
pub fn read_records(
    dir: &Path,
) -> Result<impl Iterator<Item = Result<StagedRecord, IndexBuildError>> + use<>, IndexBuildError> {
    let path = dir.join(RECORDS_FILE);
    let file = File::open(&path).map_err(|e| IndexBuildError::storage(&path, e))?;
    let frames = FrameReader::<_, Organization>::new(BufReader::new(file));
    Ok(frames.enumerate().map(move |(seq, frame)| {
        frame
            .map(|org| StagedRecord {
                seq: seq as u64,
                org,
            })
            .map_err(|e| IndexBuildError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })
    }))
}

/// Rebuild a persisted generation in memory
pub fn load_generation(
    generations: &Path,
    generation: Generation,
    builder: &IndexBuilder,
) -> Result<SearchIndex, IndexBuildError> {
    let dir = generation_dir(generations, generation);
    let meta = read_meta(&dir)?;
    if meta.generation != generation {
        return Err(IndexBuildError::Corrupt {
            path: dir,
            reason: format!("meta names generation {}", meta.generation),
        });
    }

    let built = builder.build(read_records(&dir)?, generation, meta.source_job.clone())?;
    if built.index.len() as u32 != meta.doc_count || built.duplicates > 0 {
        return Err(IndexBuildError::Corrupt {
            path: dir,
            reason: format!(
                "expected {} organizations, found {} ({} duplicates)",
                meta.doc_count,
                built.index.len(),
                built.duplicates
            ),
        });
    }

    let mut index = built.index;
    index.meta.built_at = meta.built_at;
    debug!(generation, docs = index.len(), "Generation loaded");
    Ok(index)
}

/// Generation named by `CURRENT`, if any
pub fn read_current(generations: &Path) -> Result<Option<Generation>, IndexBuildError> {
    let path = generations.join(CURRENT_FILE);
    match fs::read_to_string(&path) {
        Ok(content) => content
            .trim()
            .parse::<Generation>()
            .map(Some)
            .map_err(|e| IndexBuildError::Corrupt {
                path,
                reason: e.to_string(),
            }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(IndexBuildError::storage(path, e)),
    }
}

/// Point `CURRENT` at a generation (atomic rename)
pub fn write_current(generations: &Path, generation: Generation) -> Result<(), IndexBuildError> {
    let path = generations.join(CURRENT_FILE);
    write_atomic(&path, generation.to_string().as_bytes())
        .map_err(|e| IndexBuildError::storage(path, e))
}

/// Generation directories on disk, with `None` for temporary ones
pub fn list_generation_dirs(generations: &Path) -> io::Result<Vec<(Option<Generation>, PathBuf)>> {
    let mut dirs = Vec::new();
    let entries = match fs::read_dir(generations) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(rest) = name.strip_prefix("gen_") else {
            continue;
        };
        let generation = if rest.ends_with(TMP_SUFFIX) {
            None
        } else {
            rest.parse::<Generation>().ok()
        };
        dirs.push((generation, entry.path()));
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::build::BuildOptions;
    use crate::utils::CancelToken;

    fn builder() -> IndexBuilder {
        IndexBuilder::new(
            BuildOptions {
                shard_workers: 2,
                ..Default::default()
            },
            CancelToken::new(),
        )
    }

    fn sample(generation: Generation) -> SearchIndex {
        let records = ["300000000", "100000000", "200000000"]
            .iter()
            .enumerate()
            .map(|(i, ein)| {
                Ok(StagedRecord {
                    seq: i as u64,
                    org: Organization::new(Ein::parse(ein).unwrap(), format!("Org {}", ein)),
                })
            });
        builder()
            .build(records, generation, Some("job-1".to_string()))
            .unwrap()
            .index
    }

    #[test]
    fn test_write_and_load_generation() {
        let dir = tempfile::tempdir().unwrap();
        let index = sample(3);
        let path = write_generation(dir.path(), &index).unwrap();
        assert!(path.ends_with("gen_000003"));
        assert!(path.join(RECORDS_FILE).exists());

        let loaded = load_generation(dir.path(), 3, &builder()).unwrap();
        assert_eq!(loaded.documents(), index.documents());
        assert_eq!(loaded.meta(), index.meta());
        assert_eq!(loaded.postings("org").len(), 3);
    }

    #[test]
    fn test_current_pointer() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_current(dir.path()).unwrap(), None);
        write_current(dir.path(), 12).unwrap();
        assert_eq!(read_current(dir.path()).unwrap(), Some(12));
    }

    #[test]
    fn test_truncated_records_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_generation(dir.path(), &sample(1)).unwrap();
        let records = path.join(RECORDS_FILE);
        let len = fs::metadata(&records).unwrap().len();
        let file = fs::OpenOptions::new().write(true).open(&records).unwrap();
        file.set_len(len - 3).unwrap();

        let err = load_generation(dir.path(), 1, &builder()).unwrap_err();
        assert!(matches!(err, IndexBuildError::Corrupt { .. }));
    }

    #[test]
    fn test_list_generation_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("gen_000002")).unwrap();
        fs::create_dir_all(dir.path().join("gen_000003.tmp")).unwrap();
        fs::create_dir_all(dir.path().join("unrelated")).unwrap();

        let dirs = list_generation_dirs(dir.path()).unwrap();
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[0].0, None);
        assert_eq!(dirs[1].0, Some(2));
    }
}

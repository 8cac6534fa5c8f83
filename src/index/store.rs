//! Active/shadow generation ownership.
//!
//! The active generation sits behind an [`ArcSwap`]: readers load an
//! `Arc<SearchIndex>` without taking a lock and keep using it for as long as
//! they hold it. A commit replaces the pointer in one atomic store. Replaced generations
//! are parked as retired until the last reader drops them.

use crate::error::IndexBuildError;
use crate::index::build::IndexBuilder;
use crate::index::search_index::SearchIndex;
use crate::index::types::Generation;
use crate::index::writer::{
    generation_dir, list_generation_dirs, load_generation, read_current, write_current,
    write_generation,
};
use crate::utils::remove_dir_if_exists;
use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub struct IndexStore {
    generations: PathBuf,
    active: ArcSwap<SearchIndex>,
    /// Generation number reserved by `begin_shadow`
    shadow: Mutex<Option<Generation>>,
    /// Highest generation number handed out so far
    last_generation: Mutex<Generation>,
    retired: Mutex<Vec<Arc<SearchIndex>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl IndexStore {
    /// Open the store under `generations`, loading the generation named by
    /// `CURRENT` and removing leftovers of unfinished builds.
    pub fn open(generations: &Path, builder: &IndexBuilder) -> Result<Self, IndexBuildError> {
        std::fs::create_dir_all(generations)
            .map_err(|e| IndexBuildError::storage(generations, e))?;

        let current = read_current(generations)?;
        let active = match current {
            Some(generation) => {
                let index = load_generation(generations, generation, builder)?;
                info!(generation, docs = index.len(), "Loaded active generation");
                index
            }
            None => SearchIndex::empty(builder.options().tokenizer),
        };

        let active_gen = active.generation();
        let dirs = list_generation_dirs(generations)
            .map_err(|e| IndexBuildError::storage(generations, e))?;
        for (generation, path) in dirs {
            if generation == Some(active_gen) {
                continue;
            }
            debug!(path = %path.display(), "Removing stale generation directory");
            remove_dir_if_exists(&path).map_err(|e| IndexBuildError::storage(&path, e))?;
        }

        Ok(Self {
            generations: generations.to_path_buf(),
            active: ArcSwap::from_pointee(active),
            shadow: Mutex::new(None),
            last_generation: Mutex::new(active_gen),
            retired: Mutex::new(Vec::new()),
        })
    }

    pub fn generations_dir(&self) -> &Path {
        &self.generations
    }

    /// The active generation. Never partial; generation 0 before the first import.
    pub fn get_active(&self) -> Arc<SearchIndex> {
        self.active.load_full()
    }

    pub fn active_generation(&self) -> Generation {
        self.active.load().generation()
    }

    /// Generation currently reserved for a build, if any
    pub fn shadow(&self) -> Option<Generation> {
        *lock(&self.shadow)
    }

    /// Reserve the next generation number for a build
    pub fn begin_shadow(&self) -> Result<Generation, IndexBuildError> {
        let mut shadow = lock(&self.shadow);
        if let Some(existing) = *shadow {
            return Err(IndexBuildError::ShadowInProgress(existing));
        }
        let mut last = lock(&self.last_generation);
        let next = (*last).max(self.active_generation()) + 1;
        *last = next;
        *shadow = Some(next);
        debug!(generation = next, "Shadow generation reserved");
        Ok(next)
    }

    fn check_shadow(&self, generation: Generation) -> Result<(), IndexBuildError> {
        let shadow = *lock(&self.shadow);
        if shadow != Some(generation) {
            return Err(IndexBuildError::GenerationMismatch {
                expected: shadow,
                got: generation,
            });
        }
        Ok(())
    }

    /// Persist the shadow generation without making it visible
    pub fn write_shadow(&self, index: &SearchIndex) -> Result<(), IndexBuildError> {
        self.check_shadow(index.generation())?;
        write_generation(&self.generations, index)?;
        Ok(())
    }

    /// Make a persisted shadow generation the active one.
    ///
    /// `CURRENT` is rewritten first, then the in-memory pointer is swapped. The
    /// previous generation is retired and released once unreferenced.
    pub fn commit_shadow(&self, index: SearchIndex) -> Result<Arc<SearchIndex>, IndexBuildError> {
        let generation = index.generation();
        self.check_shadow(generation)?;
        if !generation_dir(&self.generations, generation).is_dir() {
            return Err(IndexBuildError::Corrupt {
                path: generation_dir(&self.generations, generation),
                reason: "shadow generation was not written".to_string(),
            });
        }

        write_current(&self.generations, generation)?;
        let next = Arc::new(index);
        let previous = self.active.swap(Arc::clone(&next));
        *lock(&self.shadow) = None;

        info!(
            generation,
            previous = previous.generation(),
            docs = next.len(),
            "Generation committed"
        );
        lock(&self.retired).push(previous);
        self.reap();
        Ok(next)
    }

    /// Drop the reserved shadow generation and anything written for it
    pub fn discard_shadow(&self) {
        let Some(generation) = lock(&self.shadow).take() else {
            return;
        };
        let dir = generation_dir(&self.generations, generation);
        let tmp = self.generations.join(format!("gen_{:06}.tmp", generation));
        for path in [dir, tmp] {
            if let Err(e) = remove_dir_if_exists(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove discarded generation");
            }
        }
        info!(generation, "Shadow generation discarded");
    }

    /// Release retired generations no reader still holds. Returns how many were released.
    pub fn reap(&self) -> usize {
        let mut retired = lock(&self.retired);
        let before = retired.len();
        let active = self.active_generation();

        retired.retain(|index| {
            if Arc::strong_count(index) > 1 {
                return true;
            }
            let generation = index.generation();
            if generation != 0 && generation != active {
                let dir = generation_dir(&self.generations, generation);
                if let Err(e) = remove_dir_if_exists(&dir) {
                    warn!(path = %dir.display(), error = %e, "Failed to remove retired generation");
                }
            }
            debug!(generation, "Retired generation released");
            false
        });

        before - retired.len()
    }

    /// Retired generations still pinned by readers
    pub fn retired_count(&self) -> usize {
        lock(&self.retired).len()
    }
}

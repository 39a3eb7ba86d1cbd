//! Locating the latest commit.
//!
//! Two sources are consulted for the newest generation: the highest
//! `segments_N` in a directory listing and the `segments.gen` hint. Either
//! may lag behind on storage whose listings are eventually consistent, so
//! the loop below re-lists when opening the chosen file fails transiently,
//! tries the previous generation once, and finally probes a bounded number
//! of generations past the last one seen. If nothing works the first error
//! is returned.
//!
//! A commit that is corrupt (typically a prepared commit whose footer was
//! never written) is never retried: the previous generation is tried once
//! and otherwise the corruption is surfaced.

use crate::error::{GalleyError, Result};
use crate::index::catalog::read_segments_gen;
use crate::index::file_names::{
    generation_from_segments_file_name, is_segments_file, max_segments_generation,
    segments_file_name,
};
use crate::index::info_stream::{InfoStream, SIS};
use crate::storage::Storage;

/// Generations probed past the last known one before giving up.
pub const DEFAULT_GEN_LOOKAHEAD_COUNT: u32 = 10;

/// Runs a read of the newest commit file with retries.
pub struct CommitFinder<'a> {
    storage: &'a dyn Storage,
    info_stream: &'a dyn InfoStream,
    lookahead: u32,
}

impl<'a> CommitFinder<'a> {
    pub fn new(storage: &'a dyn Storage, info_stream: &'a dyn InfoStream) -> Self {
        CommitFinder {
            storage,
            info_stream,
            lookahead: DEFAULT_GEN_LOOKAHEAD_COUNT,
        }
    }

    pub fn with_lookahead(mut self, lookahead: u32) -> Self {
        self.lookahead = lookahead;
        self
    }

    fn message(&self, message: impl FnOnce() -> String) {
        if self.info_stream.is_enabled(SIS) {
            self.info_stream.message(SIS, &message());
        }
    }

    /// Newest generation according to the listing and the hint, or -1.
    fn latest_generation(&self) -> Result<(i64, Vec<String>)> {
        let files = self.storage.list_files()?;
        let gen_a = max_segments_generation(&files);
        self.message(|| format!("directory listing genA={gen_a}"));

        let gen_b = read_segments_gen(self.storage, self.info_stream).unwrap_or(-1);
        self.message(|| format!("segments.gen check: genB={gen_b}"));

        Ok((gen_a.max(gen_b), files))
    }

    /// Call `body` with the name of the newest readable commit file.
    pub fn run<T, F>(&self, mut body: F) -> Result<T>
    where
        F: FnMut(&str) -> Result<T>,
    {
        let mut last_gen = -1i64;
        let mut generation = -1i64;
        let mut retry_count = 0u32;
        let mut lookahead_count = 0u32;
        let mut use_first_method = true;
        let mut first_error: Option<GalleyError> = None;

        loop {
            if use_first_method {
                let (latest, files) = self.latest_generation()?;
                generation = latest;
                if generation == -1 {
                    return Err(GalleyError::not_found(format!(
                        "no segments* file found in {:?}: files: {files:?}",
                        self.storage
                    )));
                }
            }

            if use_first_method && last_gen == generation && retry_count >= 2 {
                // The listing keeps pointing at a file we cannot open: stop
                // trusting it and probe forward instead.
                use_first_method = false;
            }

            if !use_first_method {
                if lookahead_count < self.lookahead {
                    generation += 1;
                    lookahead_count += 1;
                    self.message(|| format!("look ahead increment gen to {generation}"));
                } else {
                    return Err(first_error.unwrap_or_else(|| {
                        GalleyError::not_found("no readable segments file found")
                    }));
                }
            } else if last_gen == generation {
                retry_count += 1;
            } else {
                retry_count = 0;
            }

            last_gen = generation;

            let Some(file_name) = segments_file_name(generation) else {
                return Err(GalleyError::not_found(format!(
                    "invalid commit generation {generation}"
                )));
            };

            match body(&file_name) {
                Ok(value) => {
                    self.message(|| format!("success on {file_name}"));
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    self.message(|| {
                        format!(
                            "primary error on '{file_name}': {err}; will retry: retryCount={retry_count}; gen={generation}"
                        )
                    });
                    if first_error.is_none() {
                        first_error = Some(err);
                    }

                    if generation > 1 && use_first_method && retry_count == 1 {
                        if let Some(value) = self.try_older(generation, &mut body) {
                            return Ok(value);
                        }
                    }
                }
                Err(err @ GalleyError::CorruptState(_)) => {
                    self.message(|| format!("corrupt commit '{file_name}': {err}"));
                    if generation > 1 && use_first_method {
                        if let Some(value) = self.try_older(generation, &mut body) {
                            return Ok(value);
                        }
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Generations below `generation` that may hold a commit, newest first:
    /// everything listed, the hint, and `generation - 1` even if unlisted.
    fn older_generations(&self, generation: i64) -> Vec<i64> {
        let mut generations: Vec<i64> = self
            .storage
            .list_files()
            .unwrap_or_default()
            .iter()
            .filter(|f| is_segments_file(f))
            .filter_map(|f| generation_from_segments_file_name(f).ok())
            .collect();
        if let Some(hint) = read_segments_gen(self.storage, self.info_stream) {
            generations.push(hint);
        }
        generations.push(generation - 1);
        generations.retain(|g| *g > 0 && *g < generation);
        generations.sort_unstable_by(|a, b| b.cmp(a));
        generations.dedup();
        generations
    }

    /// Run `body` on the older commits that exist until one succeeds.
    fn try_older<T, F>(&self, generation: i64, body: &mut F) -> Option<T>
    where
        F: FnMut(&str) -> Result<T>,
    {
        for older in self.older_generations(generation) {
            let Some(previous) = segments_file_name(older) else {
                continue;
            };
            if self.storage.open_input(&previous).is_err() {
                continue;
            }

            self.message(|| format!("fallback to prior segment file '{previous}'"));
            match body(&previous) {
                Ok(value) => {
                    self.message(|| format!("success on fallback {previous}"));
                    return Some(value);
                }
                Err(err) => {
                    self.message(|| format!("secondary error on '{previous}': {err}; will retry"));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Write;

    use super::*;
    use crate::index::catalog::write_segments_gen;
    use crate::index::info_stream::{NoInfoStream, RecordingInfoStream};
    use crate::storage::memory::MemoryStorage;

    fn touch(storage: &MemoryStorage, name: &str) {
        let mut output = storage.create_output(name).unwrap();
        output.write_all(b"x").unwrap();
        output.close().unwrap();
    }

    #[test]
    fn test_empty_location_is_not_found() {
        let storage = MemoryStorage::new_default();
        let result = CommitFinder::new(&storage, &NoInfoStream).run(|_| Ok(()));
        assert!(matches!(result, Err(GalleyError::NotFound(_))));
    }

    #[test]
    fn test_hint_beats_stale_listing() {
        let storage = MemoryStorage::new_default();
        touch(&storage, "segments_2");
        touch(&storage, "segments_3");
        storage.hide_from_listing("segments_3");
        write_segments_gen(&storage, 3);

        let opened = CommitFinder::new(&storage, &NoInfoStream)
            .run(|name| Ok(name.to_string()))
            .unwrap();
        assert_eq!(opened, "segments_3");
    }

    #[test]
    fn test_lookahead_finds_unlisted_commit() {
        let storage = MemoryStorage::new_default();
        touch(&storage, "segments_2");
        touch(&storage, "segments_3");
        storage.hide_from_listing("segments_3");
        storage.fail_open("segments_2", 100);

        let attempts = RefCell::new(Vec::new());
        let stream = RecordingInfoStream::new();
        let opened = CommitFinder::new(&storage, &stream)
            .run(|name| {
                attempts.borrow_mut().push(name.to_string());
                storage.open_input(name)?;
                Ok(name.to_string())
            })
            .unwrap();

        assert_eq!(opened, "segments_3");
        assert_eq!(
            attempts.into_inner(),
            vec!["segments_2", "segments_2", "segments_2", "segments_3"]
        );
        assert_eq!(stream.matching(SIS, "look ahead").len(), 1);
    }

    #[test]
    fn test_first_error_surfaces_after_lookahead() {
        let storage = MemoryStorage::new_default();
        touch(&storage, "segments_1");
        storage.fail_open("segments_1", 100);

        let err = CommitFinder::new(&storage, &NoInfoStream)
            .with_lookahead(2)
            .run(|name| {
                storage.open_input(name)?;
                Ok(())
            })
            .unwrap_err();
        // the simulated open failure, not the missing segments_2/3
        assert!(matches!(err, GalleyError::Io(_)), "{err}");
    }

    #[test]
    fn test_corrupt_commit_falls_back_once() {
        let storage = MemoryStorage::new_default();
        touch(&storage, "segments_1");
        touch(&storage, "segments_2");

        let opened = CommitFinder::new(&storage, &NoInfoStream)
            .run(|name| {
                if name == "segments_2" {
                    Err(GalleyError::corrupt("misplaced codec footer"))
                } else {
                    Ok(name.to_string())
                }
            })
            .unwrap();
        assert_eq!(opened, "segments_1");

        let calls = RefCell::new(0);
        let err = CommitFinder::new(&storage, &NoInfoStream)
            .run(|_| -> Result<()> {
                *calls.borrow_mut() += 1;
                Err(GalleyError::corrupt("checksum failed"))
            })
            .unwrap_err();
        assert!(matches!(err, GalleyError::CorruptState(_)));
        assert_eq!(calls.into_inner(), 2);
    }

    #[test]
    fn test_corrupt_commit_falls_back_across_generation_gap() {
        let storage = MemoryStorage::new_default();
        touch(&storage, "segments_1");
        touch(&storage, "segments_4");
        write_segments_gen(&storage, 1);

        let attempts = RefCell::new(Vec::new());
        let opened = CommitFinder::new(&storage, &NoInfoStream)
            .run(|name| {
                attempts.borrow_mut().push(name.to_string());
                if name == "segments_4" {
                    Err(GalleyError::corrupt("incomplete varint"))
                } else {
                    Ok(name.to_string())
                }
            })
            .unwrap();
        assert_eq!(opened, "segments_1");
        // segments_3 and segments_2 do not exist and are never read
        assert_eq!(attempts.into_inner(), vec!["segments_4", "segments_1"]);
    }
}

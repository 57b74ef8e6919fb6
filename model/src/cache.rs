use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    io::{BufReader, BufWriter, ErrorKind},
    mem,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use log::debug;

use crate::{ModelErr, ParameterDict, Result};

/// A bounded store of parameter snapshots keyed by round number.
///
/// Snapshots live in memory until the cache grows over its capacity. At that
/// point the oldest rounds are either written to `{save_dir}/{round}.cache`
/// (when a save directory is configured) or evicted.
#[derive(Debug, Default)]
pub struct ModelCache {
    snapshots: BTreeMap<u64, ParameterDict>,
    offloaded: BTreeSet<u64>,
    capacity: Option<NonZeroUsize>,
    save_dir: Option<PathBuf>,
}

impl ModelCache {
    /// Creates a new `ModelCache`.
    ///
    /// # Arguments
    /// * `capacity` - The maximum amount of snapshots kept in memory, unbounded if `None`.
    /// * `save_dir` - Where to offload snapshots, evicted instead if `None`.
    pub fn new(capacity: Option<NonZeroUsize>, save_dir: Option<PathBuf>) -> Self {
        Self {
            snapshots: BTreeMap::new(),
            offloaded: BTreeSet::new(),
            capacity,
            save_dir,
        }
    }

    /// Caches the parameters of `round`, replacing any previous snapshot of it.
    ///
    /// # Returns
    /// An io error if the cache went over capacity and offloading failed.
    pub fn insert(&mut self, round: u64, params: ParameterDict) -> Result<()> {
        self.offloaded.remove(&round);
        self.snapshots.insert(round, params);
        self.enforce_capacity(round)
    }

    /// Returns the snapshot of `round`, reading it back from disk if it was offloaded.
    ///
    /// A reloaded snapshot counts against the capacity like an inserted one.
    pub fn get(&mut self, round: u64) -> Result<Option<&ParameterDict>> {
        if self.offloaded.contains(&round) {
            let params = self.load(round)?;
            self.offloaded.remove(&round);
            self.snapshots.insert(round, params);
            self.enforce_capacity(round)?;
        }

        Ok(self.snapshots.get(&round))
    }

    /// Drops every snapshot older than `round`, in memory and on disk.
    ///
    /// # Returns
    /// The amount of dropped snapshots.
    pub fn discard_before(&mut self, round: u64) -> Result<usize> {
        let kept = self.snapshots.split_off(&round);
        let mut stale: BTreeSet<u64> = mem::replace(&mut self.snapshots, kept).into_keys().collect();

        let kept = self.offloaded.split_off(&round);
        stale.append(&mut mem::replace(&mut self.offloaded, kept));

        // Reloaded snapshots may still have a file.
        if let Some(dir) = &self.save_dir {
            for round in &stale {
                Self::remove(dir, *round)?;
            }
        }

        Ok(stale.len())
    }

    /// Computes `updated - cached[round]`.
    ///
    /// # Returns
    /// The difference, or `MissingRound` if nothing is cached for `round`.
    pub fn diff(&mut self, round: u64, updated: &ParameterDict) -> Result<ParameterDict> {
        match self.get(round)? {
            Some(base) => base.diff(updated),
            None => Err(ModelErr::MissingRound { round }),
        }
    }

    /// Moves every in-memory snapshot to the save directory.
    ///
    /// Does nothing when no save directory is configured.
    pub fn offload(&mut self) -> Result<()> {
        let Some(dir) = self.save_dir.clone() else {
            return Ok(());
        };

        while let Some((round, params)) = self.snapshots.pop_first() {
            Self::store(&dir, round, &params)?;
            self.offloaded.insert(round);
        }

        debug!(offloaded = self.offloaded.len(); "offloaded parameter snapshots");
        Ok(())
    }

    /// Amount of snapshots kept, in memory or on disk.
    pub fn len(&self) -> usize {
        self.snapshots.len() + self.offloaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Amount of snapshots currently held in memory.
    pub fn in_memory(&self) -> usize {
        self.snapshots.len()
    }

    /// Drops every snapshot, removing the offloaded files as well.
    pub fn clear(&mut self) -> Result<()> {
        let in_memory = mem::take(&mut self.snapshots).into_keys();
        let rounds: BTreeSet<u64> = in_memory.chain(mem::take(&mut self.offloaded)).collect();

        if let Some(dir) = &self.save_dir {
            for round in rounds {
                Self::remove(dir, round)?;
            }
        }

        Ok(())
    }

    /// Moves the oldest snapshots out of memory until it fits `capacity`,
    /// `keep` stays in memory.
    fn enforce_capacity(&mut self, keep: u64) -> Result<()> {
        let Some(capacity) = self.capacity else {
            return Ok(());
        };

        while self.snapshots.len() > capacity.get() {
            let Some(round) = self.snapshots.keys().copied().find(|round| *round != keep) else {
                break;
            };
            let Some(params) = self.snapshots.remove(&round) else {
                break;
            };

            match &self.save_dir {
                Some(dir) => {
                    Self::store(dir, round, &params)?;
                    self.offloaded.insert(round);
                }
                None => debug!(round = round; "evicted cached parameters"),
            }
        }

        Ok(())
    }

    fn path(dir: &Path, round: u64) -> PathBuf {
        dir.join(format!("{round}.cache"))
    }

    fn remove(dir: &Path, round: u64) -> Result<()> {
        match fs::remove_file(Self::path(dir, round)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn store(dir: &Path, round: u64, params: &ParameterDict) -> Result<()> {
        fs::create_dir_all(dir)?;
        let file = File::create(Self::path(dir, round))?;
        serde_json::to_writer(BufWriter::new(file), params)?;
        Ok(())
    }

    fn load(&self, round: u64) -> Result<ParameterDict> {
        let dir = self
            .save_dir
            .as_deref()
            .ok_or(ModelErr::MissingRound { round })?;

        let file = File::open(Self::path(dir, round))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

//! The stencil: a deterministic, weight-based partitioning of the uid space
//! into labeled intervals.
//!
//! A stencil acts as a view over a hashring: each distributor name maps to a
//! non-overlapping subset of the ring's resources, and the mapping is a pure
//! function of a resource's uid, so it is reproducible across processes and
//! stable under content changes.

use crate::hashring::Hashring;
use crate::resource::{Hashkey, Resource};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StencilError {
    #[error("cannot determine upper end of empty stencil")]
    EmptyStencil,
    #[error("no interval contains value `{0}`")]
    NoInterval(u64),
}

/// A numerical interval labeled with a distributor name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interval {
    pub begin: u64,
    pub end: u64,
    pub name: String,
}

impl Interval {
    pub fn new(begin: u64, end: u64, name: impl Into<String>) -> Self {
        Self {
            begin,
            end,
            name: name.into(),
        }
    }

    /// True if begin <= n <= end.
    pub fn contains(&self, n: u64) -> bool {
        self.begin <= n && n <= self.end
    }
}

/// A list of contiguous, non-overlapping intervals.
#[derive(Clone, Debug, Default)]
pub struct Stencil {
    intervals: Vec<Interval>,
}

impl Stencil {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lays the given weights end-to-end, in ascending order of distributor
    /// name.  The sort fixes the layout so that every process computes the
    /// same partition.
    pub fn from_proportions(proportions: &BTreeMap<String, u64>) -> Self {
        let mut stencil = Stencil::new();
        let mut cursor = 0;
        for (name, weight) in proportions {
            if *weight == 0 {
                continue;
            }
            stencil.add_interval(Interval::new(cursor, cursor + weight - 1, name.clone()));
            cursor += weight;
        }
        stencil
    }

    pub fn add_interval(&mut self, interval: Interval) {
        self.intervals.push(interval);
    }

    /// The interval that the given value falls into.
    pub fn find_by_value(&self, n: u64) -> Result<&Interval, StencilError> {
        self.intervals
            .iter()
            .find(|i| i.contains(n))
            .ok_or(StencilError::NoInterval(n))
    }

    /// The maximum interval end across the stencil.
    pub fn upper_end(&self) -> Result<u64, StencilError> {
        self.intervals
            .iter()
            .map(|i| i.end)
            .max()
            .ok_or(StencilError::EmptyStencil)
    }

    /// True if the given resource maps to the given distributor.  The draw
    /// is seeded by the resource's uid alone, so repeated calls agree and a
    /// changed oid never moves a resource between distributors.
    pub fn owns(&self, dist_name: &str, r: &dyn Resource) -> bool {
        match self.interval_of(r.uid()) {
            Ok(interval) => interval.name == dist_name,
            Err(err) => {
                tracing::warn!(resource = %r, %err, "bug: resource falls in no interval");
                false
            }
        }
    }

    fn interval_of(&self, uid: Hashkey) -> Result<&Interval, StencilError> {
        let upper_end = self.upper_end()?;
        let n = Lcg::new(uid as i64).draw(upper_end);
        self.find_by_value(n)
    }

    /// A predicate admitting exactly the resources that belong to the given
    /// distributor; suitable for [`Hashring::filter`].
    pub fn filter_func(
        &self,
        dist_name: &str,
    ) -> Result<impl Fn(&dyn Resource) -> bool + Send + Sync + 'static, StencilError> {
        // Fail early on an empty stencil.
        self.upper_end()?;
        let stencil = self.clone();
        let dist_name = dist_name.to_string();
        Ok(move |r: &dyn Resource| stencil.owns(&dist_name, r))
    }
}

/// A minimal linear congruential generator (Knuth's MMIX parameters).
///
/// Each resource gets its own generator, seeded by its uid.  The point is
/// not statistical quality but a draw that is deterministic across processes
/// and releases; library generators guarantee neither.
struct Lcg(u64);

impl Lcg {
    const MULTIPLIER: u64 = 6364136223846793005;
    const INCREMENT: u64 = 1442695040888963407;

    fn new(seed: i64) -> Self {
        Self(seed as u64)
    }

    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(Self::MULTIPLIER)
            .wrapping_add(Self::INCREMENT);
        self.0
    }

    /// A value in [0, upper_end], inclusive.  Low LCG bits have short
    /// periods, so the draw uses the upper half of the state.
    fn draw(mut self, upper_end: u64) -> u64 {
        self.next();
        (self.next() >> 32) % (upper_end + 1)
    }
}

/// A hashring coupled with the stencil that partitions it among
/// distributors.  The backend keeps one per resource type.
#[derive(Clone)]
pub struct SplitHashring {
    pub ring: Hashring,
    pub stencil: Arc<Stencil>,
}

impl SplitHashring {
    pub fn new(ring: Hashring, stencil: Arc<Stencil>) -> Self {
        Self { ring, stencil }
    }

    /// The resources that are allocated to the given distributor.
    pub fn get_for_dist(&self, dist_name: &str) -> Result<Vec<Box<dyn Resource>>, StencilError> {
        let filter = self.stencil.filter_func(dist_name)?;
        Ok(self.ring.filter(filter).get_all())
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

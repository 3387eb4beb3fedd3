//! `ResourceVector`: the five-dimensional resource quantity shared by
//! workers' reported capacity, tasks' requested/committed resources, and
//! the category engine's allocations (spec.md §3, §4.4).

use serde::{Deserialize, Serialize};

/// A resource quantity where each dimension may be "auto" (`None`).
///
/// Workers report fully concrete vectors (`reported_resources`); tasks may
/// leave any field unset to mean "let the category engine decide".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVector {
    pub cores: Option<u64>,
    pub memory_mb: Option<u64>,
    pub disk_mb: Option<u64>,
    pub gpus: Option<u64>,
    pub wall_time_s: Option<u64>,
}

impl ResourceVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn full(cores: u64, memory_mb: u64, disk_mb: u64, gpus: u64) -> Self {
        ResourceVector {
            cores: Some(cores),
            memory_mb: Some(memory_mb),
            disk_mb: Some(disk_mb),
            gpus: Some(gpus),
            wall_time_s: None,
        }
    }

    /// True if every concrete field of `self` fits within the corresponding
    /// field of `capacity` (unset fields in `self` are treated as zero
    /// demand; unset fields in `capacity` are treated as unbounded).
    pub fn fits_within(&self, capacity: &ResourceVector) -> bool {
        fn fits(need: Option<u64>, have: Option<u64>) -> bool {
            match (need, have) {
                (Some(n), Some(h)) => n <= h,
                (Some(_), None) => true,
                (None, _) => true,
            }
        }
        fits(self.cores, capacity.cores)
            && fits(self.memory_mb, capacity.memory_mb)
            && fits(self.disk_mb, capacity.disk_mb)
            && fits(self.gpus, capacity.gpus)
    }

    /// Componentwise sum, treating unset fields as zero.
    pub fn saturating_add(&self, other: &ResourceVector) -> ResourceVector {
        fn add(a: Option<u64>, b: Option<u64>) -> Option<u64> {
            Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0)))
        }
        ResourceVector {
            cores: add(self.cores, other.cores),
            memory_mb: add(self.memory_mb, other.memory_mb),
            disk_mb: add(self.disk_mb, other.disk_mb),
            gpus: add(self.gpus, other.gpus),
            wall_time_s: None,
        }
    }

    /// Componentwise difference, treating unset fields as zero and never
    /// going below zero.
    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        fn sub(a: Option<u64>, b: Option<u64>) -> Option<u64> {
            Some(a.unwrap_or(0).saturating_sub(b.unwrap_or(0)))
        }
        ResourceVector {
            cores: sub(self.cores, other.cores),
            memory_mb: sub(self.memory_mb, other.memory_mb),
            disk_mb: sub(self.disk_mb, other.disk_mb),
            gpus: sub(self.gpus, other.gpus),
            wall_time_s: None,
        }
    }

    /// True if every field of `self` is >= the corresponding field of
    /// `other` (unset treated as zero). Used by Property 5 (monotonicity).
    pub fn dominates(&self, other: &ResourceVector) -> bool {
        self.cores.unwrap_or(0) >= other.cores.unwrap_or(0)
            && self.memory_mb.unwrap_or(0) >= other.memory_mb.unwrap_or(0)
            && self.disk_mb.unwrap_or(0) >= other.disk_mb.unwrap_or(0)
            && self.gpus.unwrap_or(0) >= other.gpus.unwrap_or(0)
    }

    /// Fill any unset field in `self` from the corresponding field in
    /// `fallback`.
    pub fn or(&self, fallback: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cores: self.cores.or(fallback.cores),
            memory_mb: self.memory_mb.or(fallback.memory_mb),
            disk_mb: self.disk_mb.or(fallback.disk_mb),
            gpus: self.gpus.or(fallback.gpus),
            wall_time_s: self.wall_time_s.or(fallback.wall_time_s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_within_unset_is_unbounded() {
        let task = ResourceVector { cores: Some(4), ..Default::default() };
        let worker = ResourceVector { cores: Some(8), ..Default::default() };
        assert!(task.fits_within(&worker));
        let worker_small = ResourceVector { cores: Some(2), ..Default::default() };
        assert!(!task.fits_within(&worker_small));
    }

    #[test]
    fn add_then_sub_is_identity() {
        let a = ResourceVector::full(2, 512, 1024, 0);
        let b = ResourceVector::full(1, 256, 512, 0);
        let sum = a.saturating_add(&b);
        let back = sum.saturating_sub(&b);
        assert_eq!(back.cores, a.cores);
        assert_eq!(back.memory_mb, a.memory_mb);
    }

    #[test]
    fn dominates_is_reflexive() {
        let a = ResourceVector::full(2, 512, 1024, 0);
        assert!(a.dominates(&a));
    }
}

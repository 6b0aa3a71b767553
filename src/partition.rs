//! Byte-range partitioning of one container.
//!
//! Partitions are computed on raw byte offsets and know nothing about record
//! boundaries.  Each consumer aligns itself by resynchronizing from its
//! partition start, and stops once its cursor reaches or passes the
//! partition end.  In an uncorrupted container this hands every record to
//! exactly one partition: the one whose range contains the record's first
//! byte.

/// One contiguous byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    pub start: u64,
    pub end:   u64,
}

impl Partition {
    pub fn len(&self) -> u64 { self.end - self.start }
    pub fn is_empty(&self) -> bool { self.start >= self.end }
}

/// Split `[offset, end)` into at most `workers` contiguous partitions of
/// `ceil(len / workers)` bytes.  Empty trailing partitions are dropped.
pub fn partitions(offset: u64, end: u64, workers: usize) -> Vec<Partition> {
    if end <= offset {
        return Vec::new();
    }
    let workers = workers.max(1) as u64;
    let step = (end - offset).div_ceil(workers);
    (0..workers)
        .map(|i| Partition {
            index: i as usize,
            start: (offset + i * step).min(end),
            end:   (offset + (i + 1) * step).min(end),
        })
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_range_without_gaps() {
        for workers in [1, 2, 3, 4, 7, 8] {
            let parts = partitions(10, 1013, workers);
            assert!(parts.len() <= workers);
            assert_eq!(parts[0].start, 10);
            assert_eq!(parts.last().unwrap().end, 1013);
            for pair in parts.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
        }
    }

    #[test]
    fn tiny_ranges_drop_empty_partitions() {
        let parts = partitions(0, 3, 8);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.len() == 1));
        assert!(partitions(5, 5, 4).is_empty());
    }
}

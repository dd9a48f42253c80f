use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::types::{
    CoordinationMode, InitialAllRangesAnnouncement, MarkRange, ParallelReadRequest,
    ParallelReadResponse, PartInfo, RangesInDataPartsDescription,
};
use crate::errors::ExecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Ranges are cut into segments aligned to this many marks. Segments are
    /// the unit of assignment.
    pub mark_segment_size: u64,
    /// Upper bound on segments handed out by a single response.
    pub max_ranges_per_request: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            mark_segment_size: 128,
            max_ranges_per_request: 4,
        }
    }
}

/// Part and index of an aligned segment, `begin / mark_segment_size`.
type SegmentKey = (PartInfo, u64);

#[derive(Debug, Default)]
struct Segment {
    /// Sorted, disjoint marks of the segment still to be read.
    ranges: Vec<MarkRange>,
    /// Replicas that announced they can read this segment.
    owners: BTreeSet<u64>,
}

impl Segment {
    fn num_marks(&self) -> u64 {
        self.ranges.iter().map(|r| r.num_marks()).sum()
    }

    fn merge(&mut self, other: Segment) {
        for range in other.ranges {
            insert_range(&mut self.ranges, range);
        }
        self.owners.extend(other.owners);
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    mode: Option<CoordinationMode>,
    announced: BTreeSet<u64>,
    /// Segments not handed out yet.
    pool: BTreeMap<SegmentKey, Segment>,
    /// Segments handed out per replica, returned to the pool on failure.
    assigned: HashMap<u64, Vec<(SegmentKey, Segment)>>,
    /// Every mark registered so far per segment, pooled or assigned.
    covered: HashMap<SegmentKey, Vec<MarkRange>>,
}

/// Hands out the ranges announced by reading replicas, each segment to
/// exactly one replica.
#[derive(Debug, Default)]
pub struct ParallelReadCoordinator {
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
}

impl ParallelReadCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        ParallelReadCoordinator {
            config: CoordinatorConfig {
                mark_segment_size: config.mark_segment_size.max(1),
                max_ranges_per_request: config.max_ranges_per_request.max(1),
            },
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Register the ranges a replica can read. Accepted once per replica.
    pub fn handle_announcement(&self, ann: InitialAllRangesAnnouncement) -> Result<(), ExecError> {
        let mut state = self.state.lock();
        if !state.announced.insert(ann.replica_num) {
            return Err(ExecError::logical(format!(
                "Replica {} announced its ranges twice",
                ann.replica_num
            )));
        }
        match state.mode {
            Some(mode) if mode != ann.mode => {
                return Err(ExecError::logical(format!(
                    "Replica {} uses coordination mode {:?}, expected {:?}",
                    ann.replica_num, ann.mode, mode
                )));
            }
            _ => state.mode = Some(ann.mode),
        }

        let size = self.config.mark_segment_size;
        let mut added = 0;
        for part in &ann.description.parts {
            for range in &part.ranges {
                let mut begin = range.begin;
                while begin < range.end {
                    let index = begin / size;
                    let end = ((index + 1) * size).min(range.end);
                    let key = (part.part.clone(), index);

                    let covered = state.covered.entry(key.clone()).or_insert_with(|| {
                        added += 1;
                        Vec::new()
                    });
                    let fresh = subtract_covered(MarkRange::new(begin, end), covered);
                    for range in &fresh {
                        insert_range(covered, *range);
                    }

                    // Marks already handed out stay with their replica, only
                    // new ones and unassigned ones are offered.
                    match state.pool.get_mut(&key) {
                        Some(segment) => {
                            for range in fresh {
                                insert_range(&mut segment.ranges, range);
                            }
                            segment.owners.insert(ann.replica_num);
                        }
                        None if !fresh.is_empty() => {
                            state.pool.insert(
                                key,
                                Segment {
                                    ranges: fresh,
                                    owners: BTreeSet::from([ann.replica_num]),
                                },
                            );
                        }
                        None => (),
                    }
                    begin = end;
                }
            }
        }

        debug!(replica = ann.replica_num, new_segments = added, "registered range announcement");
        Ok(())
    }

    /// Assign the next batch of segments to the requesting replica.
    pub fn handle_request(&self, req: ParallelReadRequest) -> Result<ParallelReadResponse, ExecError> {
        let mut state = self.state.lock();
        if !state.announced.contains(&req.replica_num) {
            return Err(ExecError::logical(format!(
                "Replica {} requested ranges before announcing",
                req.replica_num
            )));
        }

        let limit = self.config.max_ranges_per_request;
        let keys = Self::pick_segments(&state, &req, limit);
        if keys.is_empty() {
            trace!(replica = req.replica_num, "no ranges left");
            return Ok(ParallelReadResponse::finished());
        }

        let mut description = RangesInDataPartsDescription::default();
        let mut handed_out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(segment) = state.pool.remove(&key) {
                for range in &segment.ranges {
                    push_merged(&mut description, &key.0, *range);
                }
                handed_out.push((key, segment));
            }
        }
        state
            .assigned
            .entry(req.replica_num)
            .or_default()
            .extend(handed_out);

        trace!(replica = req.replica_num, marks = description.num_marks(), "assigned ranges");
        Ok(ParallelReadResponse {
            finish: false,
            description,
        })
    }

    fn pick_segments(
        state: &CoordinatorState,
        req: &ParallelReadRequest,
        limit: usize,
    ) -> Vec<SegmentKey> {
        let mut picked = Vec::new();
        let mut marks = 0;
        let enough = |picked: &Vec<SegmentKey>, marks: u64| {
            picked.len() >= limit || (marks >= req.min_number_of_marks && !picked.is_empty())
        };

        match req.mode {
            CoordinationMode::WithOrder | CoordinationMode::ReverseOrder => {
                let iter: Box<dyn Iterator<Item = (&SegmentKey, &Segment)>> =
                    if req.mode == CoordinationMode::WithOrder {
                        Box::new(state.pool.iter())
                    } else {
                        Box::new(state.pool.iter().rev())
                    };
                for (key, segment) in iter {
                    if enough(&picked, marks) {
                        break;
                    }
                    marks += segment.num_marks();
                    picked.push(key.clone());
                }
            }
            CoordinationMode::Default => {
                // Segments the replica announced first, then anything left.
                let own = state
                    .pool
                    .iter()
                    .filter(|(_, s)| s.owners.contains(&req.replica_num));
                let other = state
                    .pool
                    .iter()
                    .filter(|(_, s)| !s.owners.contains(&req.replica_num));
                for (key, segment) in own.chain(other) {
                    if enough(&picked, marks) {
                        break;
                    }
                    marks += segment.num_marks();
                    picked.push(key.clone());
                }
            }
        }
        picked
    }

    /// Return everything handed to `replica` back to the pool.
    pub fn report_failure(&self, replica: u64) {
        let mut state = self.state.lock();
        let Some(segments) = state.assigned.remove(&replica) else {
            return;
        };
        debug!(replica, segments = segments.len(), "returning ranges of failed replica");
        for (key, mut segment) in segments {
            segment.owners.remove(&replica);
            state.pool.entry(key).or_default().merge(segment);
        }
    }

    /// Number of segments not handed out yet.
    pub fn pending_segments(&self) -> usize {
        self.state.lock().pool.len()
    }

    pub fn total_segments(&self) -> usize {
        self.state.lock().covered.len()
    }
}

/// Push a range, extending the previous range of the same part when they
/// touch.
fn push_merged(description: &mut RangesInDataPartsDescription, part: &PartInfo, range: MarkRange) {
    if let Some(last) = description.parts.last_mut() {
        if &last.part == part {
            if let Some(prev) = last.ranges.last_mut() {
                if prev.end == range.begin {
                    prev.end = range.end;
                    return;
                }
            }
        }
    }
    description.push(part, range);
}

/// Insert into sorted, disjoint ranges, merging with neighbours it touches.
fn insert_range(ranges: &mut Vec<MarkRange>, range: MarkRange) {
    if range.num_marks() == 0 {
        return;
    }
    let mut merged = range;
    ranges.retain(|r| {
        if r.end < merged.begin || r.begin > merged.end {
            return true;
        }
        merged.begin = merged.begin.min(r.begin);
        merged.end = merged.end.max(r.end);
        false
    });
    let pos = ranges.partition_point(|r| r.begin < merged.begin);
    ranges.insert(pos, merged);
}

/// Parts of `range` not in `covered`, which is sorted and disjoint.
fn subtract_covered(range: MarkRange, covered: &[MarkRange]) -> Vec<MarkRange> {
    let mut out = Vec::new();
    let mut begin = range.begin;
    for r in covered {
        if r.end <= begin {
            continue;
        }
        if r.begin >= range.end {
            break;
        }
        if r.begin > begin {
            out.push(MarkRange::new(begin, r.begin));
        }
        begin = begin.max(r.end);
        if begin >= range.end {
            break;
        }
    }
    if begin < range.end {
        out.push(MarkRange::new(begin, range.end));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    fn announcement(replica: u64, parts: &[(&PartInfo, u64, u64)]) -> InitialAllRangesAnnouncement {
        let mut description = RangesInDataPartsDescription::default();
        for (part, begin, end) in parts {
            description.push(part, MarkRange::new(*begin, *end));
        }
        InitialAllRangesAnnouncement {
            mode: CoordinationMode::Default,
            description,
            replica_num: replica,
        }
    }

    fn request(replica: u64, min_marks: u64) -> ParallelReadRequest {
        ParallelReadRequest {
            mode: CoordinationMode::Default,
            replica_num: replica,
            min_number_of_marks: min_marks,
            description: RangesInDataPartsDescription::default(),
        }
    }

    fn marks_of(desc: &RangesInDataPartsDescription) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        for part in &desc.parts {
            for range in &part.ranges {
                for mark in range.begin..range.end {
                    out.push((part.part.name(), mark));
                }
            }
        }
        out
    }

    #[test]
    fn single_worker_gets_everything_once() {
        let coord = ParallelReadCoordinator::new(CoordinatorConfig {
            mark_segment_size: 4,
            max_ranges_per_request: 2,
        });
        let a = PartInfo::new("all", 1, 1, 0);
        let b = PartInfo::new("all", 2, 2, 0);
        coord
            .handle_announcement(announcement(0, &[(&a, 0, 10), (&b, 0, 6)]))
            .unwrap();
        assert_eq!(5, coord.total_segments());

        let mut seen = HashSet::new();
        loop {
            let resp = coord.handle_request(request(0, 1)).unwrap();
            if resp.finish {
                break;
            }
            assert!(resp.description.num_marks() > 0);
            for mark in marks_of(&resp.description) {
                assert!(seen.insert(mark.clone()), "mark handed out twice: {mark:?}");
            }
        }
        assert_eq!(16, seen.len());

        // Keeps answering finished.
        assert!(coord.handle_request(request(0, 1)).unwrap().finish);
    }

    #[test]
    fn batches_respect_limits() {
        let coord = ParallelReadCoordinator::new(CoordinatorConfig {
            mark_segment_size: 2,
            max_ranges_per_request: 3,
        });
        let a = PartInfo::new("all", 1, 1, 0);
        coord.handle_announcement(announcement(0, &[(&a, 0, 20)])).unwrap();

        // Stops as soon as the minimum is reached.
        let resp = coord.handle_request(request(0, 3)).unwrap();
        assert_eq!(4, resp.description.num_marks());
        // Adjacent segments are merged into one range.
        assert_eq!(vec![MarkRange::new(0, 4)], resp.description.parts[0].ranges);

        // Never more than max_ranges_per_request segments.
        let resp = coord.handle_request(request(0, 1000)).unwrap();
        assert_eq!(6, resp.description.num_marks());
    }

    #[test]
    fn requests_before_announcement_and_double_announcements_fail() {
        let coord = ParallelReadCoordinator::default();
        coord.handle_request(request(1, 1)).unwrap_err();

        let a = PartInfo::new("all", 1, 1, 0);
        coord.handle_announcement(announcement(1, &[(&a, 0, 1)])).unwrap();
        coord
            .handle_announcement(announcement(1, &[(&a, 0, 1)]))
            .unwrap_err();
    }

    #[test]
    fn replicas_prefer_their_own_segments() {
        let coord = ParallelReadCoordinator::new(CoordinatorConfig {
            mark_segment_size: 8,
            max_ranges_per_request: 1,
        });
        let a = PartInfo::new("all", 1, 1, 0);
        let b = PartInfo::new("all", 2, 2, 0);
        coord.handle_announcement(announcement(0, &[(&a, 0, 8)])).unwrap();
        coord.handle_announcement(announcement(1, &[(&b, 0, 8)])).unwrap();

        let resp = coord.handle_request(request(1, 1)).unwrap();
        assert_eq!(b, resp.description.parts[0].part);
        let resp = coord.handle_request(request(0, 1)).unwrap();
        assert_eq!(a, resp.description.parts[0].part);
    }

    #[test]
    fn failed_replica_segments_are_reassigned() {
        let coord = ParallelReadCoordinator::new(CoordinatorConfig {
            mark_segment_size: 4,
            max_ranges_per_request: 1,
        });
        let a = PartInfo::new("all", 1, 1, 0);
        coord.handle_announcement(announcement(0, &[(&a, 0, 8)])).unwrap();
        coord.handle_announcement(announcement(1, &[(&a, 0, 8)])).unwrap();
        // Overlapping announcements don't duplicate segments.
        assert_eq!(2, coord.total_segments());

        let first = coord.handle_request(request(0, 1)).unwrap();
        assert_eq!(1, coord.pending_segments());
        coord.report_failure(0);
        assert_eq!(2, coord.pending_segments());

        let mut got = Vec::new();
        got.extend(marks_of(&coord.handle_request(request(1, 1)).unwrap().description));
        got.extend(marks_of(&coord.handle_request(request(1, 1)).unwrap().description));
        for mark in marks_of(&first.description) {
            assert!(got.contains(&mark));
        }
        assert!(coord.handle_request(request(1, 1)).unwrap().finish);
    }

    fn drain(coord: &ParallelReadCoordinator, replica: u64) -> Vec<(String, u64)> {
        let mut marks = Vec::new();
        loop {
            let resp = coord.handle_request(request(replica, 1)).unwrap();
            if resp.finish {
                return marks;
            }
            marks.extend(marks_of(&resp.description));
        }
    }

    fn expected_marks(part: &PartInfo, range: std::ops::Range<u64>) -> Vec<(String, u64)> {
        range.map(|mark| (part.name(), mark)).collect()
    }

    #[test]
    fn longer_announcement_extends_segment() {
        let coord = ParallelReadCoordinator::new(CoordinatorConfig {
            mark_segment_size: 8,
            max_ranges_per_request: 4,
        });
        let a = PartInfo::new("all", 1, 1, 0);
        coord.handle_announcement(announcement(0, &[(&a, 0, 4)])).unwrap();
        coord.handle_announcement(announcement(1, &[(&a, 0, 8)])).unwrap();
        assert_eq!(1, coord.total_segments());

        let mut marks = drain(&coord, 1);
        marks.sort();
        assert_eq!(expected_marks(&a, 0..8), marks);
    }

    #[test]
    fn unaligned_overlap_is_read_once() {
        let coord = ParallelReadCoordinator::new(CoordinatorConfig {
            mark_segment_size: 8,
            max_ranges_per_request: 4,
        });
        let a = PartInfo::new("all", 1, 1, 0);
        coord.handle_announcement(announcement(0, &[(&a, 2, 8)])).unwrap();
        coord.handle_announcement(announcement(1, &[(&a, 0, 8)])).unwrap();

        let mut marks = drain(&coord, 1);
        marks.sort();
        assert_eq!(expected_marks(&a, 0..8), marks);
        assert!(drain(&coord, 0).is_empty());
    }

    #[test]
    fn late_announcement_only_adds_unassigned_marks() {
        let coord = ParallelReadCoordinator::new(CoordinatorConfig {
            mark_segment_size: 8,
            max_ranges_per_request: 4,
        });
        let a = PartInfo::new("all", 1, 1, 0);
        coord.handle_announcement(announcement(0, &[(&a, 0, 4)])).unwrap();
        let first = drain(&coord, 0);
        assert_eq!(expected_marks(&a, 0..4), first);

        coord.handle_announcement(announcement(1, &[(&a, 0, 8)])).unwrap();
        assert_eq!(expected_marks(&a, 4..8), drain(&coord, 1));

        // A failed replica's marks come back without touching the others.
        coord.report_failure(0);
        assert_eq!(expected_marks(&a, 0..4), drain(&coord, 1));
    }

    #[test]
    fn range_sets() {
        let mut ranges = Vec::new();
        insert_range(&mut ranges, MarkRange::new(4, 6));
        insert_range(&mut ranges, MarkRange::new(0, 2));
        insert_range(&mut ranges, MarkRange::new(2, 3));
        assert_eq!(vec![MarkRange::new(0, 3), MarkRange::new(4, 6)], ranges);

        assert_eq!(
            vec![MarkRange::new(3, 4), MarkRange::new(6, 8)],
            subtract_covered(MarkRange::new(1, 8), &ranges)
        );
        assert!(subtract_covered(MarkRange::new(4, 6), &ranges).is_empty());
    }

    #[test]
    fn concurrent_workers_never_share_segments() {
        let coord = Arc::new(ParallelReadCoordinator::new(CoordinatorConfig {
            mark_segment_size: 1,
            max_ranges_per_request: 1,
        }));
        let a = PartInfo::new("all", 1, 1, 0);
        coord.handle_announcement(announcement(0, &[(&a, 0, 500)])).unwrap();
        coord.handle_announcement(announcement(1, &[(&a, 0, 500)])).unwrap();

        let workers: Vec<_> = (0..2)
            .map(|replica| {
                let coord = coord.clone();
                std::thread::spawn(move || {
                    let mut marks = Vec::new();
                    loop {
                        let resp = coord.handle_request(request(replica, 1)).unwrap();
                        if resp.finish {
                            return marks;
                        }
                        marks.extend(marks_of(&resp.description));
                    }
                })
            })
            .collect();

        let mut all = HashSet::new();
        let mut count = 0;
        for worker in workers {
            for mark in worker.join().unwrap() {
                count += 1;
                all.insert(mark);
            }
        }
        assert_eq!(500, count);
        assert_eq!(500, all.len());
    }
}

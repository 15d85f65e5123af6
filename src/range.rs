//! Half-open revision intervals and the set operations used to track cache coverage.
//!
//! A [`Range`] is `[start, end)` over revision numbers. Every coverage list kept by the
//! cache is sorted by `start`, non-overlapping and coalesced: two ranges that touch
//! (`a.end == b.start`) are always stored as one.

use serde::{Deserialize, Serialize};

/// Exclusive upper bound used when a request has no maximum revision.
///
/// This is 2^53 - 1 so it survives a trip through JSON numbers and fits an SQLite INTEGER.
pub const UNBOUNDED_END: u64 = 9_007_199_254_740_991;

/// A half-open interval `[start, end)` of revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RangeDict", into = "RangeDict")]
pub struct Range {
  start: u64,
  end: u64,
}

/// Persisted shape of a range: `{"start": .., "end": ..}`.
#[derive(Serialize, Deserialize)]
struct RangeDict {
  start: u64,
  end: u64,
}

impl From<RangeDict> for Range {
  fn from(dict: RangeDict) -> Self {
    Range::new(dict.start, dict.end)
  }
}

impl From<Range> for RangeDict {
  fn from(range: Range) -> Self {
    RangeDict {
      start: range.start,
      end: range.end,
    }
  }
}

impl Range {
  /// The canonical empty range. All empty ranges compare equal to this one.
  pub const EMPTY: Range = Range { start: 0, end: 0 };

  /// Create `[start, end)`. Bounds are clamped to [`UNBOUNDED_END`]; an inverted or
  /// zero-length pair yields [`Range::EMPTY`].
  pub fn new(start: u64, end: u64) -> Self {
    let start = start.min(UNBOUNDED_END);
    let end = end.min(UNBOUNDED_END);
    if end <= start {
      return Self::EMPTY;
    }
    Self { start, end }
  }

  /// Build a range from optional inclusive bounds as they appear in query strings.
  ///
  /// A missing minimum means 0 and a missing maximum means [`UNBOUNDED_END`].
  pub fn from_inclusive(min: Option<u64>, max: Option<u64>) -> Self {
    let start = min.unwrap_or(0);
    let end = match max {
      Some(max) => max.saturating_add(1),
      None => UNBOUNDED_END,
    };
    Self::new(start, end)
  }

  /// Range covering everything from `start` onwards.
  pub fn from_start(start: u64) -> Self {
    Self::new(start, UNBOUNDED_END)
  }

  pub fn start(&self) -> u64 {
    self.start
  }

  pub fn end(&self) -> u64 {
    self.end
  }

  pub fn is_empty(&self) -> bool {
    self.end <= self.start
  }

  /// Number of revisions in the range.
  pub fn len(&self) -> u64 {
    self.end - self.start
  }

  /// Whether the range extends to the unbounded sentinel.
  pub fn is_unbounded(&self) -> bool {
    !self.is_empty() && self.end == UNBOUNDED_END
  }

  /// Largest revision inside the range, if any.
  pub fn last(&self) -> Option<u64> {
    if self.is_empty() {
      None
    } else {
      Some(self.end - 1)
    }
  }

  pub fn contains(&self, revision: u64) -> bool {
    self.start <= revision && revision < self.end
  }

  /// Whether `other` lies entirely within `self`. The empty range is contained everywhere.
  pub fn contains_range(&self, other: &Range) -> bool {
    other.is_empty() || (self.start <= other.start && other.end <= self.end)
  }

  /// Overlap of two ranges.
  pub fn intersect(&self, other: &Range) -> Range {
    Range::new(self.start.max(other.start), self.end.min(other.end))
  }
}

/// Overlap of two ranges; symmetric in its arguments.
pub fn intersect(a: &Range, b: &Range) -> Range {
  a.intersect(b)
}

/// Insert `range` into a sorted, coalesced list, merging every neighbour it overlaps or
/// touches so the list stays sorted and coalesced.
pub fn merge_into_sorted(list: &mut Vec<Range>, range: Range) {
  if range.is_empty() {
    return;
  }
  // Neighbours in [first, last) overlap or touch `range`.
  let first = list.partition_point(|r| r.end < range.start);
  let last = list.partition_point(|r| r.start <= range.end);
  if first >= last {
    list.insert(first, range);
    return;
  }
  let merged = Range::new(
    range.start.min(list[first].start),
    range.end.max(list[last - 1].end),
  );
  list.splice(first..last, std::iter::once(merged));
}

/// Coalesce an arbitrary list of ranges into sorted, non-overlapping form.
pub fn normalize<I>(ranges: I) -> Vec<Range>
where
  I: IntoIterator<Item = Range>,
{
  let mut out = Vec::new();
  for range in ranges {
    merge_into_sorted(&mut out, range);
  }
  out
}

/// Sub-ranges of `requested` that are not covered by `available`, in ascending order.
///
/// `available` need not be sorted. The result is empty when `requested` is empty or fully
/// covered, and contains several pieces when `available` covers only inner parts.
pub fn difference(requested: Range, available: &[Range]) -> Vec<Range> {
  if requested.is_empty() {
    return Vec::new();
  }
  let available = normalize(available.iter().copied());
  let mut missing = Vec::new();
  let mut cursor = requested.start;
  for range in &available {
    if range.end <= cursor {
      continue;
    }
    if range.start >= requested.end {
      break;
    }
    if range.start > cursor {
      missing.push(Range::new(cursor, range.start));
    }
    cursor = cursor.max(range.end);
    if cursor >= requested.end {
      break;
    }
  }
  if cursor < requested.end {
    missing.push(Range::new(cursor, requested.end));
  }
  missing
}

/// Intersection of two sorted, coalesced range lists.
pub fn intersect_sorted(a: &[Range], b: &[Range]) -> Vec<Range> {
  let mut out = Vec::new();
  let (mut i, mut j) = (0, 0);
  while i < a.len() && j < b.len() {
    let overlap = a[i].intersect(&b[j]);
    if !overlap.is_empty() {
      out.push(overlap);
    }
    if a[i].end < b[j].end {
      i += 1;
    } else {
      j += 1;
    }
  }
  out
}

/// Parts of a sorted range list that fall inside `window`.
pub fn clip(ranges: &[Range], window: &Range) -> Vec<Range> {
  ranges
    .iter()
    .map(|r| r.intersect(window))
    .filter(|r| !r.is_empty())
    .collect()
}

/// Whether a sorted, coalesced list fully covers `window`.
pub fn covers(ranges: &[Range], window: &Range) -> bool {
  window.is_empty() || ranges.iter().any(|r| r.contains_range(window))
}

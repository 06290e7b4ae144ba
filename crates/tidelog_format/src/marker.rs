//! Sync marker and its Knuth-Morris-Pratt search automata.

/// Resynchronization beacon written after the header and after every record.
pub const SYNC_MARKER: [u8; SYNC_MARKER_LEN] = [0xB7, 0xDB, 0xE7, 0xDB, 0x80, 0xAD, 0xD9, 0x57];

/// Length of [`SYNC_MARKER`].
pub const SYNC_MARKER_LEN: usize = 8;

/// Matches [`SYNC_MARKER`] scanning forward.
static FORWARD: MarkerSearcher = MarkerSearcher::new(SYNC_MARKER);

/// Matches [`SYNC_MARKER`] scanning backward (the pattern reversed).
static BACKWARD: MarkerSearcher = MarkerSearcher::new(reverse(SYNC_MARKER));

const fn reverse(pattern: [u8; SYNC_MARKER_LEN]) -> [u8; SYNC_MARKER_LEN] {
    let mut out = [0u8; SYNC_MARKER_LEN];
    let mut i = 0;
    while i < SYNC_MARKER_LEN {
        out[i] = pattern[SYNC_MARKER_LEN - 1 - i];
        i += 1;
    }
    out
}

/// `table[i]` is the length of the longest proper prefix of
/// `pattern[..=i]` that is also a suffix of it.
const fn partial_match_table(pattern: &[u8; SYNC_MARKER_LEN]) -> [usize; SYNC_MARKER_LEN] {
    let mut table = [0usize; SYNC_MARKER_LEN];
    let mut k = 0;
    let mut i = 1;
    while i < SYNC_MARKER_LEN {
        while k > 0 && pattern[i] != pattern[k] {
            k = table[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        table[i] = k;
        i += 1;
    }
    table
}

/// A KMP automaton for one 8-byte pattern.
///
/// The partial-match table is computed at compile time. Searching is linear
/// in the bytes scanned and never backs up, so it also works over input that
/// arrives in chunks: keep the `state` between calls to [`Self::step`].
#[derive(Debug)]
pub struct MarkerSearcher {
    pattern: [u8; SYNC_MARKER_LEN],
    table: [usize; SYNC_MARKER_LEN],
}

impl MarkerSearcher {
    /// Builds the automaton for `pattern`.
    #[must_use]
    pub const fn new(pattern: [u8; SYNC_MARKER_LEN]) -> Self {
        Self {
            table: partial_match_table(&pattern),
            pattern,
        }
    }

    /// The searcher for [`SYNC_MARKER`].
    #[must_use]
    pub fn forward() -> &'static Self {
        &FORWARD
    }

    /// Feeds one byte. Returns `true` when a full match ends at this byte.
    ///
    /// `state` starts at 0 and must be passed back unchanged on the next
    /// call.
    #[inline]
    pub fn step(&self, state: &mut usize, byte: u8) -> bool {
        let mut k = *state;
        while k > 0 && self.pattern[k] != byte {
            k = self.table[k - 1];
        }
        if self.pattern[k] == byte {
            k += 1;
        }
        if k == SYNC_MARKER_LEN {
            *state = self.table[k - 1];
            true
        } else {
            *state = k;
            false
        }
    }

    /// Returns the start of the first match in `haystack`.
    #[must_use]
    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        let mut state = 0;
        haystack
            .iter()
            .position(|byte| self.step(&mut state, *byte))
            .map(|end| end + 1 - SYNC_MARKER_LEN)
    }
}

/// Returns the absolute offset of the first sync marker starting at or after
/// `from`.
#[must_use]
pub fn find_marker(haystack: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)
        .and_then(|tail| FORWARD.find(tail))
        .map(|at| from + at)
}

/// Returns the offset of the last sync marker in `haystack`, scanning from
/// the end.
#[must_use]
pub fn rfind_marker(haystack: &[u8]) -> Option<usize> {
    let mut state = 0;
    haystack
        .iter()
        .enumerate()
        .rev()
        .find(|(_, byte)| BACKWARD.step(&mut state, **byte))
        .map(|(at, _)| at)
}

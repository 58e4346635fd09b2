//! Prefix-anchored transcript diff.
//! Speech engines revise the tail of the transcript, so the edit between
//! two snapshots is modeled as "delete N trailing characters, then append".
//! This is O(min(len)) per snapshot and intentionally not a general
//! minimal-edit diff; mid-string revisions cost a longer rewrite and that
//! trade is accepted. Counts are characters, not bytes: the peripheral
//! deletes one keystroke per count and multi-byte scripts must not skew it.

/// Edit converting the previously acknowledged text into a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditScript {
    /// Trailing characters to delete from the remote buffer.
    pub delete_count: usize,
    /// Text to append once the deletes have been applied.
    pub insert_text: String,
}

impl EditScript {
    pub fn is_empty(&self) -> bool {
        self.delete_count == 0 && self.insert_text.is_empty()
    }
}

/// Tracks what the remote buffer is believed to contain and emits the
/// trailing edit for each new snapshot.
///
/// Invariant: after `compute(snapshot)`, deleting `delete_count` trailing
/// characters from the prior acknowledged text and appending `insert_text`
/// yields exactly `snapshot`.
#[derive(Debug, Default)]
pub struct DiffEngine {
    last_acknowledged: String,
}

impl DiffEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the edit from the acknowledged text to `snapshot` and
    /// advance the acknowledged state.
    pub fn compute(&mut self, snapshot: &str) -> EditScript {
        let prefix = common_prefix_chars(&self.last_acknowledged, snapshot);
        let delete_count = self.last_acknowledged.chars().count() - prefix;
        let insert_text: String = snapshot.chars().skip(prefix).collect();

        self.last_acknowledged.clear();
        self.last_acknowledged.push_str(snapshot);

        EditScript {
            delete_count,
            insert_text,
        }
    }

    /// Forget everything; the next snapshot diffs against the empty string.
    /// Must run at session boundaries so a new session cannot inherit stale
    /// state and open with a delete-everything edit.
    pub fn reset(&mut self) {
        self.last_acknowledged.clear();
    }

    /// The text the remote buffer is believed to contain.
    pub fn acknowledged(&self) -> &str {
        &self.last_acknowledged
    }
}

/// Length in characters of the longest shared leading substring.
fn common_prefix_chars(a: &str, b: &str) -> usize {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count()
}

use tracing::info;

const UNINITIALIZED: [i64; 2] = [-1, -1];

/// The hashkey interval this mirror is responsible for.
///
/// Lower and upper bound over the 64-bit hash space; the sentinel `[-1, -1]`
/// means no interval has been assigned yet. Replacements arrive wholesale
/// over the reset channel and may jump arbitrarily.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Bounds([i64; 2]);

impl Default for Bounds {
    fn default() -> Self {
        Bounds(UNINITIALIZED)
    }
}

impl Bounds {
    pub fn is_uninitialized(&self) -> bool {
        self.0 == UNINITIALIZED
    }

    pub(crate) fn set(&mut self, signal: [i64; 2]) {
        info!(
            message = "replacing hashkey bounds",
            old_lo = self.0[0],
            old_hi = self.0[1],
            new_lo = signal[0],
            new_hi = signal[1],
        );
        self.0 = signal;
    }

    /// Renders the interval as a field selector predicate pair.
    ///
    /// With an owner kind the predicate matches the owner reference's hashkey
    /// instead of the object's own.
    pub(crate) fn field_selector(&self, owner_kind: Option<&str>) -> String {
        let [lo, hi] = self.0;
        let operator = if lo == 0 { "gte" } else { "gt" };

        match owner_kind {
            Some(kind) => format!(
                "metadata.ownerReferences.hashkey.{kind}={operator}:{lo},metadata.ownerReferences.hashkey.{kind}=lte:{hi}"
            ),
            None => format!("metadata.hashkey={operator}:{lo},metadata.hashkey=lte:{hi}"),
        }
    }
}

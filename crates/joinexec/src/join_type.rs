use std::fmt;

/// Join type, with the probe side as the left input and the build side as
/// the right input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    /// Standard INNER join.
    Inner,
    /// Standard LEFT join. Probe rows without a match are emitted padded
    /// with nulls.
    Left,
    /// Standard RIGHT join. Build rows without a match are emitted by the
    /// post-probe row table scan.
    Right,
    /// Standard full/outer join.
    Full,
    /// Left semi join: probe rows that found a match.
    LeftSemi,
    /// Left anti join: probe rows that found no match.
    LeftAnti,
}

impl JoinType {
    /// If probing can be skipped entirely when the build side is empty.
    ///
    /// Join types that emit probe rows regardless of a match (outer and
    /// anti variants on the probe side) must still stream the probe input
    /// even against an empty table.
    pub const fn can_skip_probe_on_empty_build(self) -> bool {
        match self {
            JoinType::Inner | JoinType::Right | JoinType::LeftSemi => true,
            JoinType::Left | JoinType::Full | JoinType::LeftAnti => false,
        }
    }

    /// If the row table must be scanned after probing completes to emit
    /// unmatched build-side rows.
    pub const fn needs_scan_after_probe(self) -> bool {
        matches!(self, JoinType::Right | JoinType::Full)
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inner => write!(f, "INNER"),
            Self::Left => write!(f, "LEFT"),
            Self::Right => write!(f, "RIGHT"),
            Self::Full => write!(f, "FULL"),
            Self::LeftSemi => write!(f, "LEFT SEMI"),
            Self::LeftAnti => write!(f, "LEFT ANTI"),
        }
    }
}

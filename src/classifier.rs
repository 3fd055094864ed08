//! Classifies an observed indicator against its existing table record into
//! one of nine states, and maps that state to a poll action.

use crate::record::IndicatorRecord;

/// The classifier's nine reachable states, tagged by which of
/// `{defined, in-feed, aged-out, withdrawn}` hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorState {
    /// Not defined in the table.
    Nx,
    /// Defined, not in-feed, not aged-out, not withdrawn.
    D,
    /// Defined, in-feed.
    Df,
    /// Defined, aged-out, not in-feed.
    Da,
    /// Defined, in-feed, aged-out.
    Dfa,
    /// Defined, withdrawn, not in-feed.
    Dw,
    /// Defined, in-feed, withdrawn.
    Dfw,
    /// Defined, aged-out, withdrawn, not in-feed.
    Daw,
    /// Defined, in-feed, aged-out, withdrawn.
    Dfaw,
}

/// The action the poll loop takes for a classified indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    /// Treat as fresh: reset `sources`/timestamps/age-out, upsert, emit update.
    TreatAsFresh,
    /// Merge observed attributes into the stored record; emit update only if
    /// attributes actually changed.
    MergeAndMaybeEmit,
    /// Refresh `last_run` only; no emit, no age-out change.
    RefreshLastRunOnly,
    /// Refresh `last_run` and `withdrawn`; no emit.
    RefreshLastRunAndWithdrawn,
}

impl IndicatorState {
    /// Short label used for metrics (`indicators_by_state`).
    pub fn as_str(self) -> &'static str {
        match self {
            IndicatorState::Nx => "nx",
            IndicatorState::D => "d",
            IndicatorState::Df => "df",
            IndicatorState::Da => "da",
            IndicatorState::Dfa => "dfa",
            IndicatorState::Dw => "dw",
            IndicatorState::Dfw => "dfw",
            IndicatorState::Daw => "daw",
            IndicatorState::Dfaw => "dfaw",
        }
    }

    /// Classify an existing record (`None` if undefined) against the current
    /// poll pass.
    pub fn classify(existing: Option<&IndicatorRecord>, now: i64, in_feed_threshold: i64) -> Self {
        let Some(record) = existing else {
            return IndicatorState::Nx;
        };

        let in_feed = record.last_run >= in_feed_threshold;
        let aged_out = record.age_out < now;
        let withdrawn = record.withdrawn.is_some();

        match (in_feed, aged_out, withdrawn) {
            (false, false, false) => IndicatorState::D,
            (true, false, false) => IndicatorState::Df,
            (false, true, false) => IndicatorState::Da,
            (true, true, false) => IndicatorState::Dfa,
            (false, false, true) => IndicatorState::Dw,
            (true, false, true) => IndicatorState::Dfw,
            (false, true, true) => IndicatorState::Daw,
            (true, true, true) => IndicatorState::Dfaw,
        }
    }

    /// The action the poll loop takes for this state when the indicator is
    /// present in the current feed pass. `Nx`/`D`/`Da`/`Daw`/
    /// `Dw` are the "not in-feed" states and always map to `TreatAsFresh`
    /// since they're only reached by an observation arriving for them.
    pub fn poll_action(self) -> PollAction {
        match self {
            IndicatorState::Nx
            | IndicatorState::D
            | IndicatorState::Da
            | IndicatorState::Daw
            | IndicatorState::Dw => PollAction::TreatAsFresh,
            IndicatorState::Df => PollAction::MergeAndMaybeEmit,
            IndicatorState::Dfa => PollAction::RefreshLastRunOnly,
            IndicatorState::Dfaw | IndicatorState::Dfw => PollAction::RefreshLastRunAndWithdrawn,
        }
    }
}

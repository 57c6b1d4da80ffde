//! Decides when a task's results are complete enough to grade.

use crate::state::{RoundResults, TaskResultSet};

/// A round is complete once it holds exactly the pages `1..=N`, N being the
/// page count the client declared for it.
///
/// Pages are unique per round (duplicates are rejected on record) and never
/// exceed the declared count, so a matching count means no gaps.
pub fn round_complete(round: &RoundResults) -> bool {
    let Some(last) = round.last_page_num else {
        return false;
    };
    !round.pages.is_empty()
        && round.pages.len() == last as usize
        && round.pages.iter().any(|p| p.page == last)
        && round.pages.iter().all(|p| p.page >= 1 && p.page <= last)
}

/// All rounds of the task are complete.
pub fn task_complete(set: &TaskResultSet) -> bool {
    !set.rounds.is_empty() && set.rounds.iter().all(round_complete)
}

//! Target selection from ranked candidates

use std::collections::HashSet;
use std::sync::Arc;

use crate::domain::{AgentDescriptor, AgentId};
use crate::error::RouterError;
use crate::matching::Candidate;

/// Picks dispatch targets from matcher candidates.
///
/// Candidates are grouped by capability. Within a group the best-scored
/// candidates win, and every candidate tied at the top score is kept. Unranked
/// groups keep everyone. The result has no duplicate agents and follows the
/// order in which candidates were proposed.
pub fn select_targets(candidates: Vec<Candidate>) -> Result<Vec<Arc<AgentDescriptor>>, RouterError> {
    let mut groups: Vec<(Option<String>, Vec<Candidate>)> = Vec::new();
    for candidate in candidates {
        match groups.iter_mut().find(|(cap, _)| *cap == candidate.capability) {
            Some((_, members)) => members.push(candidate),
            None => groups.push((candidate.capability.clone(), vec![candidate])),
        }
    }

    let mut seen: HashSet<AgentId> = HashSet::new();
    let mut targets = Vec::new();

    for (_, members) in groups {
        let best = members.iter().filter_map(|c| c.score).max();
        for candidate in members {
            let keep = match best {
                Some(best) => candidate.score == Some(best),
                None => true,
            };
            if keep && seen.insert(candidate.agent.id()) {
                targets.push(candidate.agent);
            }
        }
    }

    if targets.is_empty() {
        return Err(RouterError::NoCandidateAgent);
    }
    Ok(targets)
}

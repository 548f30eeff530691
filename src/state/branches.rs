use crate::state::resolver::StateResolutionError;
use crate::units::{Pdu, PduRef};
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::collections::HashMap;

/// StateLoader hands out state PDUs by reference while walking `prev_state` chains.
#[async_trait::async_trait]
pub(super) trait StateLoader: Send + Sync {
    /// `None` means the PDU could not be found anywhere; the walk treats that branch as exhausted.
    async fn load(&self, pdu_ref: &PduRef) -> Result<Option<Pdu>, StateResolutionError>;
}

/// The two chains of state PDUs that diverged since their common ancestor. Neither chain includes
/// the common ancestor itself. Chains are ordered from the tip backwards.
#[derive(Debug)]
pub(super) struct Branches {
    pub(super) new: Vec<Pdu>,
    pub(super) current: Vec<Pdu>,
    pub(super) common_ancestor: Option<PduRef>,
}

struct Side {
    chain: Vec<Pdu>,
    seen: HashMap<PduRef, usize>,
    exhausted: bool,
}

enum Step {
    Extended,
    Exhausted,
    Met { other_index: usize, ancestor: PduRef },
}

impl Side {
    fn new(start: Pdu) -> Self {
        let mut seen = HashMap::new();
        seen.insert(start.pdu_ref(), 0);
        Side {
            chain: vec![start],
            seen,
            exhausted: false,
        }
    }

    fn tip_depth(&self) -> u64 {
        self.chain.last().map(|p| p.depth).unwrap_or(0)
    }

    async fn step(&mut self, other: &Side, loader: &dyn StateLoader) -> Result<Step, StateResolutionError> {
        let prev_ref = match self.chain.last().and_then(|p| p.prev_state()) {
            Some(prev) => prev.clone(),
            None => return Ok(self.exhaust()),
        };

        if let Some(&other_index) = other.seen.get(&prev_ref) {
            return Ok(Step::Met {
                other_index,
                ancestor: prev_ref,
            });
        }
        // A chain that loops back on itself is garbage from here on.
        if self.seen.contains_key(&prev_ref) {
            return Ok(self.exhaust());
        }

        match loader.load(&prev_ref).await? {
            Some(prev) if prev.is_state() => {
                self.seen.insert(prev_ref, self.chain.len());
                self.chain.push(prev);
                Ok(Step::Extended)
            }
            _ => Ok(self.exhaust()),
        }
    }

    fn exhaust(&mut self) -> Step {
        self.exhausted = true;
        Step::Exhausted
    }
}

/// Walks back along the `prev_state` chains of `new` and `current` until they meet.
///
/// The branch whose tip is deeper is stepped first, so that both chains reach the divergence point
/// at about the same time. When one branch runs out (its first state PDU, or an ancestor nobody
/// could supply) the other keeps walking, since it may still run into the exhausted one.
pub(super) async fn enumerate_branches(
    new: Pdu,
    current: Pdu,
    loader: &dyn StateLoader,
    max_hops: usize,
) -> Result<Branches, StateResolutionError> {
    let mut new_side = Side::new(new);
    let mut current_side = Side::new(current);
    let mut hops = 0;

    loop {
        let (step_new, step_current) = match (new_side.exhausted, current_side.exhausted) {
            (true, true) => {
                return Ok(Branches {
                    new: new_side.chain,
                    current: current_side.chain,
                    common_ancestor: None,
                })
            }
            (false, true) => (true, false),
            (true, false) => (false, true),
            (false, false) => match new_side.tip_depth().cmp(&current_side.tip_depth()) {
                Ordering::Greater => (true, false),
                Ordering::Less => (false, true),
                Ordering::Equal => (true, true),
            },
        };

        if hops >= max_hops {
            return Err(StateResolutionError::WalkTooLong(max_hops));
        }
        hops += 1;

        if step_new {
            if let Step::Met {
                other_index,
                ancestor,
            } = new_side.step(&current_side, loader).await?
            {
                current_side.chain.truncate(other_index);
                return Ok(Branches {
                    new: new_side.chain,
                    current: current_side.chain,
                    common_ancestor: Some(ancestor),
                });
            }
        }

        if step_current {
            if let Step::Met {
                other_index,
                ancestor,
            } = current_side.step(&new_side, loader).await?
            {
                new_side.chain.truncate(other_index);
                return Ok(Branches {
                    new: new_side.chain,
                    current: current_side.chain,
                    common_ancestor: Some(ancestor),
                });
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Winner {
    New,
    Current,
}

/// Picks the winning branch. Rules are applied in order, each only when the previous one ties:
/// higher max power level, then more hops since divergence, then the greater SHA-1 digest of the
/// branch's concatenated `pdu_id` + `origin` strings.
///
/// `None` means every rule tied, which only happens when both branches are identical.
pub(super) fn pick_winner(new: &[Pdu], current: &[Pdu]) -> Option<Winner> {
    let by_power = max_power_level(new).cmp(&max_power_level(current));
    let by_length = new.len().cmp(&current.len());
    let by_hash = branch_digest(new).cmp(&branch_digest(current));

    match by_power.then(by_length).then(by_hash) {
        Ordering::Greater => Some(Winner::New),
        Ordering::Less => Some(Winner::Current),
        Ordering::Equal => None,
    }
}

fn max_power_level(branch: &[Pdu]) -> Option<i64> {
    branch.iter().filter_map(Pdu::power_level).max()
}

fn branch_digest(branch: &[Pdu]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    for pdu in branch {
        hasher.update(pdu.pdu_id.as_bytes());
        hasher.update(pdu.origin.as_bytes());
    }
    hasher.finalize().to_vec()
}

//! Worker groups: the collective operations a set of cooperating writers needs.
//!
//! A [`Communicator`] names one member (its rank) of a group of workers that call every
//! collective operation in the same order. [`SingleProcess`] is the trivial group of one;
//! [`ThreadGroup`] connects threads of one process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Result of comparing two communicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommCompare {
    /// The same group handle.
    Identical,
    /// The same members in the same rank order, through distinct handles.
    Congruent,
    Unequal,
}

/// A member of a group of workers.
///
/// Every collective operation must be called by all members of the group, in the same
/// order; a member that skips one blocks the others.
pub trait Communicator: Send + Sync {
    /// Rank of this member, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of members.
    fn size(&self) -> usize;

    /// Block until every member has arrived.
    fn barrier(&self);

    /// The maximum of `value` over all members.
    fn all_reduce_max(&self, value: u64) -> u64;

    /// Partition the group by `color`. Members passing the same color form a new group,
    /// ranked in the order of their rank in this one.
    fn split(&self, color: u64) -> Self
    where
        Self: Sized;

    fn compare(&self, other: &Self) -> CommCompare
    where
        Self: Sized;

    /// Whether every member passed `true`.
    fn all_agree(&self, ok: bool) -> bool {
        self.all_reduce_max(u64::from(!ok)) == 0
    }
}

/// The group consisting of the calling process alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn all_reduce_max(&self, value: u64) -> u64 {
        value
    }

    fn split(&self, _color: u64) -> Self {
        SingleProcess
    }

    fn compare(&self, _other: &Self) -> CommCompare {
        CommCompare::Identical
    }
}

/// A fixed group of threads in one process.
///
/// ```
/// use ntuple_store::comm::{Communicator, ThreadGroup};
///
/// let maxima = ThreadGroup::run(4, |comm| comm.all_reduce_max(comm.rank() as u64));
/// assert_eq!(maxima, vec![3, 3, 3, 3]);
/// ```
#[derive(Debug)]
pub struct ThreadGroup {
    members: Vec<ThreadComm>,
}

impl ThreadGroup {
    /// A group of `size` members, to be handed to one thread each.
    pub fn new(size: usize) -> Self {
        let rendezvous = Arc::new(Rendezvous::new((0..size).collect()));
        Self {
            members: (0..size)
                .map(|rank| ThreadComm {
                    rank,
                    rendezvous: rendezvous.clone(),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn into_members(self) -> Vec<ThreadComm> {
        self.members
    }

    /// Run `f` on `size` scoped threads, one per member, and collect the results in rank
    /// order.
    pub fn run<R, F>(size: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(ThreadComm) -> R + Sync,
    {
        let f = &f;
        std::thread::scope(|scope| {
            let handles: Vec<_> = Self::new(size)
                .into_members()
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}

impl IntoIterator for ThreadGroup {
    type Item = ThreadComm;
    type IntoIter = std::vec::IntoIter<ThreadComm>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.into_iter()
    }
}

/// One member of a [`ThreadGroup`].
#[derive(Debug)]
pub struct ThreadComm {
    rank: usize,
    rendezvous: Arc<Rendezvous>,
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.rendezvous.members.len()
    }

    fn barrier(&self) {
        self.rendezvous.exchange(self.rank, 0);
    }

    fn all_reduce_max(&self, value: u64) -> u64 {
        let (_, values) = self.rendezvous.exchange(self.rank, value);
        values.into_iter().max().unwrap_or(value)
    }

    fn split(&self, color: u64) -> Self {
        let (generation, colors) = self.rendezvous.exchange(self.rank, color);
        let ranks: Vec<usize> = colors
            .iter()
            .enumerate()
            .filter(|&(_, c)| *c == color)
            .map(|(rank, _)| rank)
            .collect();
        let rank = ranks
            .iter()
            .position(|&r| r == self.rank)
            .unwrap_or_default();
        let members = ranks.iter().map(|&r| self.rendezvous.members[r]).collect();
        ThreadComm {
            rank,
            rendezvous: self.rendezvous.subgroup(generation, color, members),
        }
    }

    fn compare(&self, other: &Self) -> CommCompare {
        if Arc::ptr_eq(&self.rendezvous, &other.rendezvous) && self.rank == other.rank {
            CommCompare::Identical
        } else if self.rendezvous.members == other.rendezvous.members && self.rank == other.rank {
            CommCompare::Congruent
        } else {
            CommCompare::Unequal
        }
    }
}

/// The meeting point all collective operations of one group go through.
///
/// Each round every member deposits one value; the member completing the round publishes
/// all of them and advances the generation, waking the others.
#[derive(Debug)]
struct Rendezvous {
    /// Member ids, in rank order, of the group this rendezvous serves.
    members: Vec<usize>,
    round: Mutex<Round>,
    cvar: Condvar,
    subgroups: Mutex<HashMap<(u64, u64), (Arc<Rendezvous>, usize)>>,
}

#[derive(Debug)]
struct Round {
    generation: u64,
    arrived: usize,
    deposits: Vec<u64>,
    /// The deposits of the last completed round.
    published: Vec<u64>,
}

impl Rendezvous {
    fn new(members: Vec<usize>) -> Self {
        let size = members.len();
        Self {
            members,
            round: Mutex::new(Round {
                generation: 0,
                arrived: 0,
                deposits: vec![0; size],
                published: Vec::new(),
            }),
            cvar: Condvar::new(),
            subgroups: Mutex::new(HashMap::new()),
        }
    }

    /// Deposit `value` for `rank` and wait for the round to complete. Returns the round's
    /// generation and every member's value in rank order.
    fn exchange(&self, rank: usize, value: u64) -> (u64, Vec<u64>) {
        let mut round = self.round.lock();
        let generation = round.generation;
        round.deposits[rank] = value;
        round.arrived += 1;
        if round.arrived == self.members.len() {
            let size = self.members.len();
            round.published = std::mem::replace(&mut round.deposits, vec![0; size]);
            round.arrived = 0;
            round.generation += 1;
            self.cvar.notify_all();
        } else {
            // The next round cannot complete before this member joins it, so the published
            // values are still ours when we wake.
            while round.generation == generation {
                self.cvar.wait(&mut round);
            }
        }
        (generation, round.published.clone())
    }

    /// The rendezvous of the `color` subgroup formed in round `generation`. The first
    /// member to ask creates it; the last one removes it from the registry.
    fn subgroup(&self, generation: u64, color: u64, members: Vec<usize>) -> Arc<Rendezvous> {
        let mut subgroups = self.subgroups.lock();
        let size = members.len();
        let entry = subgroups
            .entry((generation, color))
            .or_insert_with(|| (Arc::new(Rendezvous::new(members)), size));
        entry.1 -= 1;
        let rendezvous = entry.0.clone();
        if entry.1 == 0 {
            subgroups.remove(&(generation, color));
        }
        rendezvous
    }
}

//! Distribution of left-block operator instances over compute ranks.
//!
//! Ranks talk to each other only through a [`Communicator`]. Work is negotiated in two phases.
//! Lightweight descriptors of the resident instances are gathered first, so that every rank can
//! compute the same assignment. Heavy operator data is then shipped point to point, and only for
//! instances assigned away from their resident rank.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{self, bail, ensure, format_err};
use bincode;
use itertools::Itertools;
use log;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::block::RenormalisedBlock;
use crate::io::format::{npdm_output, npdm_warn};
use crate::npdm::wrappers::{NpdmSpinOps, NpdmSpinOpsBase};
use crate::operator::OpKind;

#[cfg(test)]
#[path = "distribution_tests.rs"]
mod distribution_tests;

// =================
// Trait definitions
// =================

/// Trait for the collective operations available between compute ranks.
///
/// Every rank of a communicator must call each collective the same number of times and in the
/// same order.
pub trait Communicator: Sync {
    /// Returns the rank of the caller.
    fn rank(&self) -> usize;

    /// Returns the number of ranks.
    fn size(&self) -> usize;

    /// Gathers one payload from every rank onto every rank.
    ///
    /// # Returns
    ///
    /// The payloads, indexed by source rank.
    fn all_gather(&self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>, anyhow::Error>;

    /// Sends point-to-point messages and receives those addressed to the caller.
    ///
    /// # Arguments
    ///
    /// * `messages` - The outgoing messages as `(destination rank, payload)` pairs.
    ///
    /// # Returns
    ///
    /// The incoming messages as `(source rank, payload)` pairs, sorted by source rank. Messages
    /// from one source keep their sending order.
    fn exchange(
        &self,
        messages: Vec<(usize, Vec<u8>)>,
    ) -> Result<Vec<(usize, Vec<u8>)>, anyhow::Error>;

    /// Leaves the communicator after a fatal error. Collectives pending on the other ranks fail
    /// from then on. Communicators without peers ignore this.
    fn abort(&self) {}
}

/// Gathers a serialisable value from every rank onto every rank.
pub fn all_gather_serde<T, C>(comm: &C, value: &T) -> Result<Vec<T>, anyhow::Error>
where
    T: Serialize + DeserializeOwned,
    C: Communicator + ?Sized,
{
    let bytes = bincode::serialize(value).map_err(|err| format_err!(err))?;
    comm.all_gather(bytes)?
        .iter()
        .map(|payload| bincode::deserialize(payload).map_err(|err| format_err!(err)))
        .collect()
}

// ==================
// Struct definitions
// ==================

// -----------
// Single rank
// -----------

/// A communicator for a single process.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleRank;

impl Communicator for SingleRank {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather(&self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>, anyhow::Error> {
        Ok(vec![bytes])
    }

    fn exchange(
        &self,
        messages: Vec<(usize, Vec<u8>)>,
    ) -> Result<Vec<(usize, Vec<u8>)>, anyhow::Error> {
        messages
            .into_iter()
            .map(|(dest, bytes)| {
                ensure!(dest == 0, "Rank {dest} does not exist in a single-rank world.");
                Ok((0, bytes))
            })
            .collect()
    }
}

// -----------------
// In-process ranks
// -----------------

/// Error returned by a collective that a peer rank abandoned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerAborted {
    /// The rank whose collective was interrupted.
    pub rank: usize,

    /// The first rank that left the world.
    pub origin: usize,
}

impl fmt::Display for PeerAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rank {} cannot complete a collective because rank {} left the world.",
            self.rank, self.origin
        )
    }
}

impl std::error::Error for PeerAborted {}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: usize,
    aborted_by: Option<usize>,
}

#[derive(Debug)]
struct Mailbox {
    size: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
    gathered: Mutex<Vec<Vec<u8>>>,
    inboxes: Mutex<Vec<Vec<(usize, Vec<u8>)>>>,
}

impl Mailbox {
    /// Blocks until every rank has arrived, or fails once a rank has left the world.
    fn wait(&self, rank: usize) -> Result<(), anyhow::Error> {
        let poisoned = || format_err!("Rank {rank} found a poisoned barrier.");
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if let Some(origin) = state.aborted_by {
            return Err(PeerAborted { rank, origin }.into());
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(());
        }
        while state.generation == generation && state.aborted_by.is_none() {
            state = self.released.wait(state).map_err(|_| poisoned())?;
        }
        match state.aborted_by {
            // A completed generation wins over a later departure.
            Some(origin) if state.generation == generation => {
                Err(PeerAborted { rank, origin }.into())
            }
            _ => Ok(()),
        }
    }

    /// Marks the world as abandoned by `rank` and wakes every waiting rank.
    fn abort(&self, rank: usize) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.aborted_by.is_none() {
            state.aborted_by = Some(rank);
        }
        self.released.notify_all();
    }
}

/// A factory for communicators connecting ranks that run as threads of one process.
#[derive(Clone, Copy, Debug)]
pub struct LocalWorld;

impl LocalWorld {
    /// Creates one communicator per rank. Each communicator must be moved to its own thread.
    ///
    /// A rank leaves the world when its communicator is dropped or [`Communicator::abort`] is
    /// called. Collectives still pending on the other ranks then fail with [`PeerAborted`].
    ///
    /// # Arguments
    ///
    /// * `size` - The number of ranks.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(size: usize) -> Result<Vec<LocalCommunicator>, anyhow::Error> {
        ensure!(size > 0, "A world needs at least one rank.");
        let mailbox = Arc::new(Mailbox {
            size,
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
            gathered: Mutex::new(vec![vec![]; size]),
            inboxes: Mutex::new(vec![vec![]; size]),
        });
        Ok((0..size)
            .map(|rank| LocalCommunicator {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
            })
            .collect_vec())
    }
}

/// A communicator for one of the in-process ranks created by [`LocalWorld::new`].
#[derive(Debug)]
pub struct LocalCommunicator {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl LocalCommunicator {
    fn poisoned(&self) -> anyhow::Error {
        self.abort();
        format_err!("Rank {} found a poisoned mailbox.", self.rank)
    }
}

impl Drop for LocalCommunicator {
    fn drop(&mut self) {
        self.mailbox.abort(self.rank);
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    /// Leaves the world. Every collective not yet completed by all ranks fails from now on.
    fn abort(&self) {
        log::debug!("Rank {} leaves its world.", self.rank);
        self.mailbox.abort(self.rank);
    }

    fn all_gather(&self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>, anyhow::Error> {
        self.mailbox
            .gathered
            .lock()
            .map(|mut slots| slots[self.rank] = bytes)
            .map_err(|_| self.poisoned())?;
        self.mailbox.wait(self.rank)?;
        let gathered = self
            .mailbox
            .gathered
            .lock()
            .map(|slots| slots.clone())
            .map_err(|_| self.poisoned())?;
        // Slots may only be overwritten once everyone has read them.
        self.mailbox.wait(self.rank)?;
        Ok(gathered)
    }

    fn exchange(
        &self,
        messages: Vec<(usize, Vec<u8>)>,
    ) -> Result<Vec<(usize, Vec<u8>)>, anyhow::Error> {
        let (valid, invalid): (Vec<(usize, Vec<u8>)>, Vec<(usize, Vec<u8>)>) = messages
            .into_iter()
            .partition(|(dest, _)| *dest < self.size);
        if !invalid.is_empty() {
            self.abort();
            bail!(
                "Rank {} tried to send to ranks {} outside a world of size {}.",
                self.rank,
                invalid.iter().map(|(dest, _)| dest).join(", "),
                self.size
            );
        }
        self.mailbox
            .inboxes
            .lock()
            .map(|mut inboxes| {
                valid
                    .into_iter()
                    .for_each(|(dest, bytes)| inboxes[dest].push((self.rank, bytes)))
            })
            .map_err(|_| self.poisoned())?;
        self.mailbox.wait(self.rank)?;
        let mut received = self
            .mailbox
            .inboxes
            .lock()
            .map(|mut inboxes| std::mem::take(&mut inboxes[self.rank]))
            .map_err(|_| self.poisoned())?;
        self.mailbox.wait(self.rank)?;
        received.sort_by_key(|(src, _)| *src);
        Ok(received)
    }
}

// -----------
// Descriptors
// -----------

/// A lightweight description of one operator instance, free of matrix data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpdmOpDescriptor {
    /// The operator kinds of the wrapper.
    pub pattern: Vec<OpKind>,

    /// The local index of the instance in its wrapper.
    pub local_index: usize,

    /// The orbital indices the instance takes.
    pub indices: Vec<i32>,

    /// The number of spin channels of the instance.
    pub size: usize,

    /// The rank on which the operators of the instance are resident.
    pub resident_rank: usize,
}

/// Describes the instances of a wrapper that are resident on this rank.
///
/// # Arguments
///
/// * `ops` - The wrapper.
/// * `rank` - The rank of the caller.
///
/// # Returns
///
/// The descriptors of the resident instances, by ascending local index.
pub fn describe_local_ops<B: RenormalisedBlock>(
    ops: &NpdmSpinOps<'_, B>,
    rank: usize,
) -> Result<Vec<NpdmOpDescriptor>, anyhow::Error> {
    let pattern = ops.wrapper().op_kinds();
    let size = ops.wrapper().mults().len();
    (0..ops.n_instances())
        .filter(|&idx| ops.is_local(idx))
        .map(|idx| {
            Ok(NpdmOpDescriptor {
                pattern: pattern.clone(),
                local_index: idx,
                indices: ops.describe(idx)?,
                size,
                resident_rank: rank,
            })
        })
        .collect()
}

/// Gathers the descriptors of all ranks into a global set without duplicates.
///
/// An instance resident on several ranks is kept once, with the lowest resident rank.
///
/// # Returns
///
/// The global descriptors, by ascending local index. Every rank obtains the same list.
pub fn negotiate_descriptors<C: Communicator + ?Sized>(
    comm: &C,
    local: &[NpdmOpDescriptor],
) -> Result<Vec<NpdmOpDescriptor>, anyhow::Error> {
    let gathered = all_gather_serde(comm, &local.to_vec())?;
    let global = gathered
        .into_iter()
        .flatten()
        .sorted_by_key(|desc| (desc.local_index, desc.resident_rank))
        .dedup_by(|a, b| a.local_index == b.local_index)
        .collect_vec();
    log::debug!(
        "Negotiated {} global operator instance(s) from {} rank(s).",
        global.len(),
        comm.size()
    );
    Ok(global)
}

/// Returns the smallest per-rank bound that lets `n_total` instances fit on `size` ranks.
fn minimum_bound(n_total: usize, size: usize) -> usize {
    if size == 0 {
        n_total
    } else {
        (n_total + size - 1) / size
    }
}

/// Returns the per-rank load bound, raising a configured bound that is too small.
///
/// # Arguments
///
/// * `n_total` - The number of global instances.
/// * `size` - The number of ranks.
/// * `max_lhs_per_rank` - The configured bound, if any.
pub fn load_bound(n_total: usize, size: usize, max_lhs_per_rank: Option<usize>) -> usize {
    let minimum = minimum_bound(n_total, size);
    match max_lhs_per_rank {
        Some(bound) if bound < minimum => {
            npdm_warn!(
                "Configured bound of {bound} instance(s) per rank cannot hold {n_total} instance(s) on {size} rank(s). Using {minimum} instead."
            );
            minimum
        }
        Some(bound) => bound,
        None => minimum,
    }
}

/// Assigns every global instance to a rank.
///
/// Instances stay on their resident rank while it is below `bound`. The remaining instances go,
/// in order, to the least-loaded rank below `bound`, the lowest rank winning ties.
///
/// # Returns
///
/// The assigned rank of each descriptor, in the order of `global`.
pub fn assign_descriptors(
    global: &[NpdmOpDescriptor],
    size: usize,
    bound: usize,
) -> Result<Vec<usize>, anyhow::Error> {
    ensure!(size > 0, "Cannot assign instances to an empty world.");
    let mut loads = vec![0usize; size];
    let mut assigned = global
        .iter()
        .map(|desc| {
            let resident = desc.resident_rank;
            if resident < size && loads[resident] < bound {
                loads[resident] += 1;
                Some(resident)
            } else {
                None
            }
        })
        .collect_vec();
    for slot in assigned.iter_mut().filter(|slot| slot.is_none()) {
        let (rank, _) = loads
            .iter()
            .enumerate()
            .filter(|(_, load)| **load < bound)
            .min_by_key(|(rank, load)| (**load, *rank))
            .ok_or_else(|| {
                format_err!("No rank has room for more instances under a bound of {bound}.")
            })?;
        loads[rank] += 1;
        *slot = Some(rank);
    }
    assigned
        .into_iter()
        .map(|slot| slot.ok_or_else(|| format_err!("An instance was left unassigned.")))
        .collect()
}

/// Returns the largest number of resident left-block instances over all ranks, and logs it.
///
/// # Arguments
///
/// * `comm` - The communicator.
/// * `my_size` - The number of instances resident on the caller.
pub fn get_mpi_max_lhs_size<C: Communicator + ?Sized>(
    comm: &C,
    my_size: usize,
) -> Result<usize, anyhow::Error> {
    let sizes = all_gather_serde(comm, &my_size)?;
    let max_size = sizes.iter().copied().max().unwrap_or(0);
    if comm.rank() == 0 {
        npdm_output!(
            "Resident left-block instances per rank: {} (max {max_size})",
            sizes.iter().join(", ")
        );
    }
    Ok(max_size)
}

/// Materialises the left-block instances that this rank must evaluate.
///
/// Every rank describes its resident instances, agrees on a global assignment and builds its
/// assigned instances. Instances assigned to another rank are built by their resident rank and
/// shipped.
///
/// # Arguments
///
/// * `comm` - The communicator.
/// * `ops` - The left-block wrapper. Its current instance is changed.
/// * `max_lhs_per_rank` - The configured per-rank load bound, if any.
///
/// # Returns
///
/// The instances assigned to this rank, by ascending local index.
pub fn get_all_mpi_ops<B, C>(
    comm: &C,
    ops: &mut NpdmSpinOps<'_, B>,
    max_lhs_per_rank: Option<usize>,
) -> Result<Vec<NpdmSpinOpsBase>, anyhow::Error>
where
    B: RenormalisedBlock,
    C: Communicator + ?Sized,
{
    let rank = comm.rank();
    let local = describe_local_ops(ops, rank)?;
    get_mpi_max_lhs_size(comm, local.len())?;
    let global = negotiate_descriptors(comm, &local)?;
    let bound = load_bound(global.len(), comm.size(), max_lhs_per_rank);
    let assigned = assign_descriptors(&global, comm.size(), bound)?;

    let mut mine = Vec::<(usize, NpdmSpinOpsBase)>::new();
    let mut outgoing = Vec::<(usize, Vec<u8>)>::new();
    for (desc, &target) in global.iter().zip(assigned.iter()) {
        if desc.resident_rank != rank {
            continue;
        }
        ops.set_local_ops(desc.local_index)?;
        ensure!(
            ops.base().indices == desc.indices,
            "Instance {} of {} took indices {:?}, but was described with {:?}.",
            desc.local_index,
            ops.wrapper(),
            ops.base().indices,
            desc.indices
        );
        if target == rank {
            mine.push((desc.local_index, ops.base().clone()));
        } else {
            let payload = bincode::serialize(&(desc.local_index, ops.base()))
                .map_err(|err| format_err!(err))?;
            outgoing.push((target, payload));
        }
    }
    log::debug!(
        "Rank {rank} ships {} of its resident {} instance(s).",
        outgoing.len(),
        ops.wrapper()
    );

    for (src, payload) in comm.exchange(outgoing)? {
        let (local_index, base): (usize, NpdmSpinOpsBase) = bincode::deserialize(&payload)
            .map_err(|err| format_err!("Malformed operator payload from rank {src}: {err}"))?;
        mine.push((local_index, base));
    }
    mine.sort_by_key(|(local_index, _)| *local_index);
    Ok(mine.into_iter().map(|(_, base)| base).collect_vec())
}

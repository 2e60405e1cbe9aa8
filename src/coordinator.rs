use crate::error::{Result, SyncError};
use crate::snapshot::{Snapshot, SyncSource};

/// What one store's concurrent fetch produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// No handle/folder bound, picker cancelled, or session not
    /// authenticated. The source sits this cycle out.
    Unbound,
    /// The store is reachable but holds no data file yet.
    Missing,
    Loaded(Snapshot),
}

/// One external store of the application snapshot. Implemented by
/// [`LocalFileClient`](crate::local_file::LocalFileClient) and
/// [`RemoteStoreClient`](crate::drive::RemoteStoreClient); tests use
/// in-memory fakes.
pub trait SnapshotStore {
    fn source(&self) -> SyncSource;

    fn fetch(&mut self) -> impl std::future::Future<Output = Result<FetchOutcome>>;

    fn store(&mut self, snapshot: &Snapshot) -> impl std::future::Future<Output = Result<()>>;
}

/// The UI collaborator told when a cycle pauses on a genuine conflict.
/// It is expected to eventually call [`SyncCoordinator::resolve`].
pub trait ConflictGate {
    fn conflict_detected(&self, source: SyncSource);
}

/// No-op gate for embedders that poll `state()` instead.
impl ConflictGate for () {
    fn conflict_detected(&self, _source: SyncSource) {}
}

/// The two resolution options for a pending conflict:
/// last-writer-wins by explicit user choice, never an automatic merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveChoice {
    /// Push the current in-memory snapshot to the divergent source.
    Local,
    /// Replace in-memory state with the divergent source's content.
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncState {
    Idle,
    LoadingAll,
    Comparing,
    Synced,
    ConflictPending(SyncSource),
    Applying,
    Failed(SyncError),
}

#[derive(Debug, Clone)]
struct PendingConflict {
    source: SyncSource,
    external: Snapshot,
}

enum FirstPass {
    Skip,
    /// Fetched content already equals memory; realign the baseline.
    Align,
    /// One-sided external change; take it into memory silently.
    Adopt,
    Conflict,
}

fn first_pass(memory: &Snapshot, outcome: &FetchOutcome, baseline: &Option<Snapshot>) -> FirstPass {
    match outcome {
        FetchOutcome::Unbound | FetchOutcome::Missing => FirstPass::Skip,
        FetchOutcome::Loaded(external) => {
            if external == memory {
                return FirstPass::Align;
            }
            match baseline {
                // First cycle for this binding: the divergence cannot be
                // attributed to either side, so the user decides.
                None => FirstPass::Conflict,
                Some(base) if external == base => FirstPass::Skip,
                Some(base) if memory == base => FirstPass::Adopt,
                Some(_) => FirstPass::Conflict,
            }
        }
    }
}

/// Drives the reconciliation cycle between the in-memory snapshot, the
/// local data file, and the remote canonical file.
///
/// One cycle: fetch both stores concurrently, compare each against its
/// baseline and the live memory snapshot, adopt one-sided external
/// changes, pause on genuine conflicts, push memory everywhere else.
/// Exactly one cycle runs at a time; concurrent triggers are rejected.
pub struct SyncCoordinator<L, R, G> {
    local: L,
    remote: R,
    gate: G,
    memory: Snapshot,
    local_baseline: Option<Snapshot>,
    remote_baseline: Option<Snapshot>,
    state: SyncState,
    pending: Option<PendingConflict>,
    last_local: FetchOutcome,
    last_remote: FetchOutcome,
}

impl<L, R, G> SyncCoordinator<L, R, G>
where
    L: SnapshotStore,
    R: SnapshotStore,
    G: ConflictGate,
{
    pub fn new(local: L, remote: R, gate: G, memory: Snapshot) -> Self {
        Self {
            local,
            remote,
            gate,
            memory,
            local_baseline: None,
            remote_baseline: None,
            state: SyncState::Idle,
            pending: None,
            last_local: FetchOutcome::Unbound,
            last_remote: FetchOutcome::Unbound,
        }
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn memory(&self) -> &Snapshot {
        &self.memory
    }

    /// Replaces the authoritative in-memory snapshot after an edit.
    pub fn set_memory(&mut self, snapshot: Snapshot) {
        self.memory = snapshot;
    }

    /// The last snapshot confirmed identical between memory and the given
    /// external store.
    pub fn baseline(&self, source: SyncSource) -> Option<&Snapshot> {
        match source {
            SyncSource::LocalFile => self.local_baseline.as_ref(),
            SyncSource::RemoteDrive => self.remote_baseline.as_ref(),
            SyncSource::Memory => None,
        }
    }

    pub fn local_store(&mut self) -> &mut L {
        &mut self.local
    }

    pub fn remote_store(&mut self) -> &mut R {
        &mut self.remote
    }

    /// Runs one sync cycle. Rejected with `SyncInProgress` unless the
    /// coordinator is in `Idle`, `Synced` or `Failed`.
    pub async fn trigger_sync(&mut self) -> Result<SyncState> {
        match self.state {
            SyncState::Idle | SyncState::Synced | SyncState::Failed(_) => {}
            _ => return Err(SyncError::SyncInProgress),
        }
        self.pending = None;
        self.state = SyncState::LoadingAll;
        log::debug!("sync cycle started (memory {})", self.memory.digest());

        // Both fetches are issued before either is awaited and run
        // concurrently; comparison only starts once both have settled.
        let (local, remote) = tokio::join!(self.local.fetch(), self.remote.fetch());
        let local = match local {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("{} fetch failed", self.local.source());
                return self.fail(e);
            }
        };
        let remote = match remote {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("{} fetch failed", self.remote.source());
                return self.fail(e);
            }
        };
        self.last_local = local.clone();
        self.last_remote = remote.clone();

        self.state = SyncState::Comparing;

        // Sources are classified in order, local file first; an adoption
        // updates memory before the next source is looked at, so two
        // stores that both changed externally surface as a conflict on
        // the second one instead of silently overwriting either.
        for source in [SyncSource::LocalFile, SyncSource::RemoteDrive] {
            let (outcome, baseline) = match source {
                SyncSource::LocalFile => (&self.last_local, &mut self.local_baseline),
                _ => (&self.last_remote, &mut self.remote_baseline),
            };
            match first_pass(&self.memory, outcome, baseline) {
                FirstPass::Skip => {}
                FirstPass::Align => {
                    *baseline = Some(self.memory.clone());
                }
                FirstPass::Adopt => {
                    let FetchOutcome::Loaded(external) = outcome else {
                        unreachable!()
                    };
                    log::info!(
                        "adopting external change from {source} ({})",
                        external.digest()
                    );
                    let external = external.clone();
                    *baseline = Some(external.clone());
                    self.memory = external;
                }
                FirstPass::Conflict => {
                    let FetchOutcome::Loaded(external) = outcome else {
                        unreachable!()
                    };
                    log::warn!(
                        "divergence on {source}: external {} vs memory {}",
                        external.digest(),
                        self.memory.digest()
                    );
                    self.pending = Some(PendingConflict {
                        source,
                        external: external.clone(),
                    });
                    self.state = SyncState::ConflictPending(source);
                    self.gate.conflict_detected(source);
                    return Ok(self.state.clone());
                }
            }
        }

        // No conflicts: memory is final for the cycle; push it to every
        // participating store that differs.
        let winner = self.memory.clone();
        self.apply(&winner).await
    }

    /// Applies the user's decision for the pending conflict and finishes
    /// the interrupted cycle. Rejected outside `ConflictPending`.
    pub async fn resolve(&mut self, choice: ResolveChoice) -> Result<SyncState> {
        let pending = match (&self.state, self.pending.take()) {
            (SyncState::ConflictPending(_), Some(p)) => p,
            _ => return Err(SyncError::SyncInProgress),
        };
        log::info!("conflict on {} resolved: {choice:?}", pending.source);

        let winner = match choice {
            ResolveChoice::Local => self.memory.clone(),
            ResolveChoice::Remote => {
                self.memory = pending.external.clone();
                pending.external
            }
        };
        self.apply(&winner).await
    }

    /// Writes the winning snapshot to every participating source whose
    /// fetched content differs, advancing each baseline independently on
    /// that side's success. A failure leaves the failed side's baseline
    /// untouched, so the next cycle re-attempts exactly that side.
    async fn apply(&mut self, winner: &Snapshot) -> Result<SyncState> {
        for source in [SyncSource::LocalFile, SyncSource::RemoteDrive] {
            let outcome = match source {
                SyncSource::LocalFile => self.last_local.clone(),
                _ => self.last_remote.clone(),
            };
            let needs_write = match &outcome {
                FetchOutcome::Unbound => continue,
                FetchOutcome::Missing => true,
                FetchOutcome::Loaded(external) => external != winner,
            };

            if needs_write {
                self.state = SyncState::Applying;
                let result = match source {
                    SyncSource::LocalFile => self.local.store(winner).await,
                    _ => self.remote.store(winner).await,
                };
                if let Err(e) = result {
                    return self.fail(e);
                }
                log::info!("snapshot {} applied to {source}", winner.digest());
            }

            match source {
                SyncSource::LocalFile => self.local_baseline = Some(winner.clone()),
                _ => self.remote_baseline = Some(winner.clone()),
            }
        }

        self.state = SyncState::Synced;
        log::debug!("sync cycle complete ({})", winner.digest());
        Ok(SyncState::Synced)
    }

    fn fail(&mut self, error: SyncError) -> Result<SyncState> {
        log::error!("sync cycle failed: {error}");
        self.state = SyncState::Failed(error.clone());
        Err(error)
    }
}

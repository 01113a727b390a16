//! In-process cluster: every rank is a thread, every link a bounded channel
//!
//! Each endpoint owns one bounded mailbox. Senders never block: a full
//! mailbox is reported as [`SendError::Full`] so the caller can keep
//! draining its own mailbox before retrying. `agree` is a generation-counted
//! barrier shared by all endpoints of a cluster.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use super::{Communicator, SendError, ThreadLevel};
use crate::constants::DEFAULT_MAILBOX_CAPACITY;

type Message = (usize, Vec<u8>);

#[derive(Default)]
struct AgreeState {
    arrived: usize,
    all_ok: bool,
    generation: u64,
    last_result: bool,
}

struct Collective {
    size: usize,
    state: Mutex<AgreeState>,
    released: Condvar,
}

impl Collective {
    fn lock(&self) -> MutexGuard<'_, AgreeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn agree(&self, ok: bool) -> bool {
        let mut state = self.lock();
        if state.arrived == 0 {
            state.all_ok = true;
        }
        state.all_ok &= ok;
        state.arrived += 1;

        if state.arrived == self.size {
            state.last_result = state.all_ok;
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return state.last_result;
        }

        let generation = state.generation;
        while state.generation == generation {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.last_result
    }
}

/// Builder for a set of connected [`Endpoint`]s
pub struct LocalCluster;

impl LocalCluster {
    /// Create `size` endpoints with the default mailbox capacity
    ///
    /// # Panics
    /// Panics if `size` is zero.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(size: usize) -> Vec<Endpoint> {
        Self::with_capacity(size, DEFAULT_MAILBOX_CAPACITY)
    }

    /// Create `size` endpoints whose mailboxes hold `capacity` frames each
    ///
    /// # Panics
    /// Panics if `size` is zero.
    pub fn with_capacity(size: usize, capacity: usize) -> Vec<Endpoint> {
        assert!(size > 0, "a cluster needs at least one rank");
        let (senders, receivers): (Vec<Sender<Message>>, Vec<Receiver<Message>>) =
            (0..size).map(|_| bounded(capacity.max(1))).unzip();
        let senders = Arc::new(senders);
        let collective = Arc::new(Collective {
            size,
            state: Mutex::new(AgreeState::default()),
            released: Condvar::new(),
        });

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, mailbox)| Endpoint {
                rank,
                senders: Arc::clone(&senders),
                mailbox,
                collective: Arc::clone(&collective),
            })
            .collect()
    }
}

/// One rank of a [`LocalCluster`]
pub struct Endpoint {
    rank: usize,
    senders: Arc<Vec<Sender<Message>>>,
    mailbox: Receiver<Message>,
    collective: Arc<Collective>,
}

impl Communicator for Endpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn thread_level(&self) -> ThreadLevel {
        ThreadLevel::Multiple
    }

    fn send(&self, dest: usize, frame: Vec<u8>) -> Result<(), SendError> {
        let Some(link) = self.senders.get(dest) else {
            return Err(SendError::Disconnected);
        };
        match link.try_send((self.rank, frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full((_, frame))) => Err(SendError::Full(frame)),
            Err(TrySendError::Disconnected(_)) => Err(SendError::Disconnected),
        }
    }

    fn try_recv(&self) -> Option<(usize, Vec<u8>)> {
        match self.mailbox.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<(usize, Vec<u8>)> {
        match self.mailbox.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    fn agree(&self, ok: bool) -> bool {
        self.collective.agree(ok)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("rank", &self.rank)
            .field("size", &self.senders.len())
            .finish()
    }
}

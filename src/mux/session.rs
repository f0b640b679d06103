use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use crate::buffer::{MultiBuffer, TransferType};
use crate::ray::PipeWriter;
use crate::signal::Done;

/// Hard ceiling on sessions ever carried by one client; a client that
/// served this many retires and a fresh connection takes over.
pub const MAX_TOTAL: u32 = 128;

/// One logical stream inside a multiplexed connection. The reading side
/// is owned by the per-session pump task; the manager keeps the writer
/// the demultiplexer feeds.
pub struct Session {
    pub id: u16,
    pub transfer: TransferType,
    output: Mutex<Option<PipeWriter>>,
    done: Done,
}

impl Session {
    fn new(id: u16, transfer: TransferType, output: PipeWriter) -> Arc<Self> {
        Arc::new(Self {
            id,
            transfer,
            output: Mutex::new(Some(output)),
            done: Done::new(),
        })
    }

    pub fn done(&self) -> Done {
        self.done.clone()
    }

    pub async fn write_output(&self, mb: MultiBuffer) -> io::Result<()> {
        let writer = self.output.lock().unwrap().clone();
        match writer {
            Some(w) => w.write(mb).await,
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn shutdown(&self) {
        self.done.close();
        if let Some(w) = self.output.lock().unwrap().take() {
            w.close();
        }
    }
}

#[derive(PartialEq, Eq)]
enum ManagerState {
    Active,
    /// Reaped for idleness; allocation fails from here on.
    Drained,
    Closed,
}

struct Inner {
    sessions: HashMap<u16, Arc<Session>>,
    next_id: u16,
    count: u32,
    state: ManagerState,
}

pub struct SessionManager {
    inner: Mutex<Inner>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                next_id: 0,
                count: 0,
                state: ManagerState::Active,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Total sessions ever allocated or added.
    pub fn count(&self) -> u32 {
        self.inner.lock().unwrap().count
    }

    /// Allocates a locally-initiated session. Returns the writer back when
    /// capacity is declined so the caller can escalate to a new client.
    pub fn allocate(
        &self,
        transfer: TransferType,
        output: PipeWriter,
    ) -> Result<Arc<Session>, PipeWriter> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ManagerState::Active || inner.count >= MAX_TOTAL {
            return Err(output);
        }

        let mut id = inner.next_id.wrapping_add(1);
        if id == 0 {
            id = 1;
        }
        if inner.sessions.contains_key(&id) {
            // Counter landed on a live id; fall back to the smallest free one.
            match (1..=u16::MAX).find(|c| !inner.sessions.contains_key(c)) {
                Some(free) => id = free,
                None => return Err(output),
            }
        }

        inner.next_id = id;
        inner.count += 1;
        let session = Session::new(id, transfer, output);
        inner.sessions.insert(id, session.clone());
        Ok(session)
    }

    /// Registers a remotely-initiated session under its wire id.
    pub fn add(
        &self,
        id: u16,
        transfer: TransferType,
        output: PipeWriter,
    ) -> Arc<Session> {
        let mut inner = self.inner.lock().unwrap();
        inner.count += 1;
        let session = Session::new(id, transfer, output);
        if let Some(old) = inner.sessions.insert(id, session.clone()) {
            old.shutdown();
        }
        session
    }

    pub fn get(&self, id: u16) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().sessions.get(&id).cloned()
    }

    pub fn remove(&self, id: u16) {
        let removed = self.inner.lock().unwrap().sessions.remove(&id);
        if let Some(session) = removed {
            session.shutdown();
        }
    }

    /// Flips an empty manager to the drained state. Returns false when
    /// sessions are still live or the state already moved on.
    pub fn close_if_no_session(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ManagerState::Active && inner.sessions.is_empty() {
            inner.state = ManagerState::Drained;
            true
        } else {
            false
        }
    }

    pub fn close_all(&self) {
        let sessions: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ManagerState::Closed;
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ray::new_pipe;

    fn writer() -> PipeWriter {
        new_pipe().0
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let manager = SessionManager::new();
        for expected in 1..=5u16 {
            let s = manager.allocate(TransferType::Stream, writer()).unwrap();
            assert_eq!(s.id, expected);
        }
        assert_eq!(manager.size(), 5);
        assert_eq!(manager.count(), 5);
    }

    #[test]
    fn collision_falls_back_to_smallest_free_id() {
        let manager = SessionManager::new();
        for _ in 0..5 {
            manager.allocate(TransferType::Stream, writer()).unwrap();
        }
        manager.add(6, TransferType::Stream, writer());
        manager.remove(3);

        let s = manager.allocate(TransferType::Stream, writer()).unwrap();
        assert_eq!(s.id, 3);
    }

    #[test]
    fn total_allocation_is_capped() {
        let manager = SessionManager::new();
        for _ in 0..MAX_TOTAL {
            let s = manager.allocate(TransferType::Stream, writer()).unwrap();
            manager.remove(s.id);
        }
        assert_eq!(manager.size(), 0);
        assert!(manager.allocate(TransferType::Stream, writer()).is_err());
    }

    #[test]
    fn drained_manager_declines_allocation() {
        let manager = SessionManager::new();
        let s = manager.allocate(TransferType::Stream, writer()).unwrap();
        assert!(!manager.close_if_no_session());

        manager.remove(s.id);
        assert!(manager.close_if_no_session());
        assert!(!manager.close_if_no_session());
        assert!(manager.allocate(TransferType::Stream, writer()).is_err());
    }
}

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Result, TrainError};

/// Collective operations over a fixed group of data-parallel workers.
/// Every worker must issue the same operations in the same order.
pub trait Collective: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_primary(&self) -> bool {
        self.rank() == 0
    }

    /// Replaces `buffer` on every worker with the element-wise mean of all
    /// workers' buffers.
    fn all_reduce_mean(&self, buffer: &mut [f64]) -> Result<()>;

    /// Replaces `buffer` on every worker with `root`'s buffer.
    fn broadcast(&self, buffer: &mut [f64], root: usize) -> Result<()>;
}

/// The trivial group of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, _buffer: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _buffer: &mut [f64], _root: usize) -> Result<()> {
        Ok(())
    }
}

struct Rendezvous {
    world_size: usize,
    arrived: usize,
    generation: u64,
    acc: Vec<f64>,
    result: Arc<Vec<f64>>,
    departed: usize,
    failure: Option<String>,
}

type Shared = Arc<(Mutex<Rendezvous>, Condvar)>;

/// In-process worker group: one handle per worker thread, synchronized
/// through a shared rendezvous. A timed-out operation, a length mismatch,
/// or a worker leaving mid-run fails the whole group; a group that has
/// failed cannot be reused.
pub struct LocalGroup;

impl LocalGroup {
    pub fn new(world_size: usize, timeout: Duration) -> Vec<LocalCollective> {
        let world_size = world_size.max(1);
        let shared: Shared = Arc::new((
            Mutex::new(Rendezvous {
                world_size,
                arrived: 0,
                generation: 0,
                acc: Vec::new(),
                result: Arc::new(Vec::new()),
                departed: 0,
                failure: None,
            }),
            Condvar::new(),
        ));
        (0..world_size)
            .map(|rank| LocalCollective { rank, world_size, timeout, shared: shared.clone() })
            .collect()
    }
}

pub struct LocalCollective {
    rank: usize,
    world_size: usize,
    timeout: Duration,
    shared: Shared,
}

impl LocalCollective {
    fn sync_error(&self, reason: &str) -> TrainError {
        TrainError::DistributedSync(format!("rank {}: {reason}", self.rank))
    }

    fn rendezvous<C, F>(&self, contribute: C, finish: F) -> Result<Arc<Vec<f64>>>
    where
        C: FnOnce(&mut Vec<f64>) -> std::result::Result<(), String>,
        F: FnOnce(&mut Vec<f64>, usize),
    {
        let (lock, cvar) = &*self.shared;
        let mut st = lock.lock().map_err(|_| self.sync_error("group state poisoned"))?;
        if let Some(reason) = &st.failure {
            return Err(self.sync_error(reason));
        }
        if st.departed > 0 {
            return Err(self.sync_error("a peer left the group"));
        }

        if st.arrived == 0 {
            st.acc.clear();
        }
        if let Err(reason) = contribute(&mut st.acc) {
            st.failure = Some(reason.clone());
            cvar.notify_all();
            return Err(self.sync_error(&reason));
        }
        st.arrived += 1;

        if st.arrived == st.world_size {
            let world = st.world_size;
            finish(&mut st.acc, world);
            st.result = Arc::new(std::mem::take(&mut st.acc));
            st.arrived = 0;
            st.generation += 1;
            cvar.notify_all();
            return Ok(st.result.clone());
        }

        let my_generation = st.generation;
        let deadline = Instant::now() + self.timeout;
        while st.generation == my_generation {
            if let Some(reason) = &st.failure {
                return Err(self.sync_error(reason));
            }
            let now = Instant::now();
            if now >= deadline {
                let reason = format!("rank {} timed out after {:?} waiting for peers", self.rank, self.timeout);
                st.failure = Some(reason.clone());
                cvar.notify_all();
                return Err(self.sync_error(&reason));
            }
            let (guard, _) = cvar
                .wait_timeout(st, deadline - now)
                .map_err(|_| self.sync_error("group state poisoned"))?;
            st = guard;
        }
        Ok(st.result.clone())
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_mean(&self, buffer: &mut [f64]) -> Result<()> {
        let len = buffer.len();
        let contribution: &[f64] = buffer;
        let result = self.rendezvous(
            |acc| {
                if acc.is_empty() {
                    acc.resize(len, 0.0);
                } else if acc.len() != len {
                    return Err(format!("all-reduce length mismatch: {} vs {len}", acc.len()));
                }
                for (a, x) in acc.iter_mut().zip(contribution.iter()) {
                    *a += x;
                }
                Ok(())
            },
            |acc, world| {
                let inv = 1.0 / world as f64;
                for a in acc.iter_mut() {
                    *a *= inv;
                }
            },
        )?;
        buffer.copy_from_slice(&result);
        Ok(())
    }

    fn broadcast(&self, buffer: &mut [f64], root: usize) -> Result<()> {
        if root >= self.world_size {
            return Err(self.sync_error(&format!("broadcast root {root} outside group")));
        }
        let is_root = self.rank == root;
        let contribution: &[f64] = buffer;
        let result = self.rendezvous(
            |acc| {
                if is_root {
                    acc.clear();
                    acc.extend_from_slice(contribution);
                }
                Ok(())
            },
            |_, _| {},
        )?;
        if result.len() != buffer.len() {
            return Err(self.sync_error(&format!(
                "broadcast length mismatch: {} vs {}",
                result.len(),
                buffer.len()
            )));
        }
        buffer.copy_from_slice(&result);
        Ok(())
    }
}

impl Drop for LocalCollective {
    /// Peers already waiting on a round this worker will never join fail
    /// immediately; later arrivals fail on entry.
    fn drop(&mut self) {
        let (lock, cvar) = &*self.shared;
        if let Ok(mut st) = lock.lock() {
            st.departed += 1;
            if st.arrived > 0 && st.failure.is_none() {
                st.failure = Some(format!("rank {} left the group", self.rank));
                cvar.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn all_reduce_averages_across_threads() {
        let group = LocalGroup::new(3, Duration::from_secs(5));
        let handles: Vec<_> = group.into_iter()
            .map(|c| thread::spawn(move || {
                let mut buf = vec![c.rank() as f64, 10.0 * c.rank() as f64];
                c.all_reduce_mean(&mut buf).unwrap();
                let mut second = vec![1.0 + c.rank() as f64];
                c.all_reduce_mean(&mut second).unwrap();
                (buf, second)
            }))
            .collect();
        for h in handles {
            let (buf, second) = h.join().unwrap();
            assert_eq!(buf, vec![1.0, 10.0]);
            assert_eq!(second, vec![2.0]);
        }
    }

    #[test]
    fn broadcast_copies_root_buffer() {
        let group = LocalGroup::new(2, Duration::from_secs(5));
        let handles: Vec<_> = group.into_iter()
            .map(|c| thread::spawn(move || {
                let mut buf = vec![c.rank() as f64; 3];
                c.broadcast(&mut buf, 1).unwrap();
                buf
            }))
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![1.0; 3]);
        }
    }

    #[test]
    fn missing_peer_times_out() {
        let mut group = LocalGroup::new(2, Duration::from_millis(50));
        let lonely = group.remove(0);
        let err = lonely.all_reduce_mean(&mut [1.0]).unwrap_err();
        assert!(matches!(err, TrainError::DistributedSync(_)));
        // the group stays failed
        let err = group[0].all_reduce_mean(&mut [1.0]).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn departed_peer_fails_later_rounds() {
        let mut group = LocalGroup::new(2, Duration::from_secs(60));
        drop(group.remove(1));
        let err = group[0].all_reduce_mean(&mut [1.0]).unwrap_err();
        assert!(err.to_string().contains("left the group"));
    }

    #[test]
    fn single_process_is_identity() {
        let mut buf = [3.0, 4.0];
        SingleProcess.all_reduce_mean(&mut buf).unwrap();
        assert_eq!(buf, [3.0, 4.0]);
        assert!(SingleProcess.is_primary());
    }
}

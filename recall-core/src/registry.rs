//! Session registry: at most one live memory session per user.
//!
//! Every user has a slot with a gate. [`SessionRegistry::acquire`] takes the
//! gate and hands it out inside a [`SessionLease`], so session creation is
//! single-flight and turns for one user run one at a time. Different users
//! only share the brief lookup in the slot map.
//!
//! Slots stay in the map once created. [`SessionRegistry::release`] bumps
//! the slot's generation instead of removing it, so a later `acquire` for
//! the same user queues on the same gate behind any creation still running
//! for the released generation.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::identity::UserId;
use crate::session::{MemorySession, SessionLauncher};

#[derive(Default)]
struct SlotState {
    session: Option<Arc<MemorySession>>,
    /// Bumped by `release`. Waiters and creations from an older generation
    /// fail with `Released`.
    generation: u64,
}

#[derive(Default)]
struct UserSlot {
    gate: Arc<Mutex<()>>,
    /// Held while a released session shuts down; launches wait for it.
    teardown: Arc<Mutex<()>>,
    state: Mutex<SlotState>,
}

impl UserSlot {
    async fn take_session(&self) -> Option<Arc<MemorySession>> {
        self.state.lock().await.session.take()
    }

    async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    /// Bump the generation and detach the session. The caller shuts it down.
    async fn retire(&self) -> Option<Arc<MemorySession>> {
        let mut state = self.state.lock().await;
        state.generation += 1;
        state.session.take()
    }
}

/// Exclusive use of one user's session, held for the duration of a turn.
pub struct SessionLease {
    user: UserId,
    session: Arc<MemorySession>,
    slot: Arc<UserSlot>,
    generation: u64,
    reused: bool,
    _gate: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn session(&self) -> &MemorySession {
        &self.session
    }

    /// Whether the session existed before this lease was taken.
    pub fn was_reused(&self) -> bool {
        self.reused
    }

    /// Tear down the leased session after a peer failure. The gate stays
    /// held, so nobody else sees the slot empty until the lease is dropped.
    pub async fn evict(&self) {
        {
            let mut state = self.slot.state.lock().await;
            if state
                .session
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(s, &self.session))
            {
                state.session = None;
            }
        }
        tracing::warn!(user_id = %self.user, "Evicting memory session");
        self.session.shutdown().await;
    }
}

impl Deref for SessionLease {
    type Target = MemorySession;

    fn deref(&self) -> &MemorySession {
        &self.session
    }
}

/// Maps users to their live memory sessions.
pub struct SessionRegistry {
    launcher: Arc<dyn SessionLauncher>,
    slots: Mutex<HashMap<UserId, Arc<UserSlot>>>,
}

impl SessionRegistry {
    pub fn new(launcher: Arc<dyn SessionLauncher>) -> Self {
        Self {
            launcher,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Lease the user's session, creating it if there is none or the
    /// current one is unhealthy.
    pub async fn acquire(&self, user: &UserId) -> Result<SessionLease, SessionError> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(user.clone()).or_default().clone()
        };
        let generation = slot.generation().await;
        let gate = slot.gate.clone().lock_owned().await;

        let existing = {
            let state = slot.state.lock().await;
            if state.generation != generation {
                return Err(SessionError::Released);
            }
            state.session.clone()
        };

        if let Some(session) = existing {
            if session.is_healthy() {
                return Ok(SessionLease {
                    user: user.clone(),
                    session,
                    slot,
                    generation,
                    reused: true,
                    _gate: gate,
                });
            }
            tracing::info!(user_id = %user, "Replacing unhealthy memory session");
            if let Some(stale) = slot.take_session().await {
                stale.shutdown().await;
            }
        }

        let session = self.create(user, &slot, generation).await?;
        Ok(SessionLease {
            user: user.clone(),
            session,
            slot,
            generation,
            reused: false,
            _gate: gate,
        })
    }

    /// Replace the leased session with a freshly launched one.
    pub async fn reopen(&self, lease: &mut SessionLease) -> Result<(), SessionError> {
        lease.evict().await;
        lease.session = self
            .create(&lease.user, &lease.slot, lease.generation)
            .await?;
        lease.reused = false;
        Ok(())
    }

    /// Launch and install a session for `generation`. The caller holds the
    /// slot's gate.
    async fn create(
        &self,
        user: &UserId,
        slot: &UserSlot,
        generation: u64,
    ) -> Result<Arc<MemorySession>, SessionError> {
        // the previous peer must be gone before its successor starts
        drop(slot.teardown.lock().await);
        if slot.generation().await != generation {
            return Err(SessionError::Released);
        }

        let session = match self.launcher.launch(user).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                tracing::warn!(user_id = %user, error = %e, "Failed to start memory session");
                return Err(e);
            }
        };

        let mut state = slot.state.lock().await;
        if state.generation != generation {
            drop(state);
            tracing::info!(user_id = %user, "Session released during creation, discarding");
            session.shutdown().await;
            return Err(SessionError::Released);
        }
        state.session = Some(session.clone());
        Ok(session)
    }

    /// Terminate the user's session, if any. In-flight calls on it fail;
    /// this does not wait for the current turn.
    pub async fn release(&self, user: &UserId) {
        let Some(slot) = self.slots.lock().await.get(user).cloned() else {
            return;
        };

        let _teardown = slot.teardown.clone().lock_owned().await;
        if let Some(session) = slot.retire().await {
            tracing::info!(user_id = %user, "Releasing memory session");
            session.shutdown().await;
        }
    }

    /// Release every session.
    pub async fn shutdown_all(&self) {
        let slots: Vec<Arc<UserSlot>> = self.slots.lock().await.values().cloned().collect();

        let mut shutdowns = JoinSet::new();
        for slot in slots {
            let teardown = slot.teardown.clone().lock_owned().await;
            if let Some(session) = slot.retire().await {
                shutdowns.spawn(async move {
                    session.shutdown().await;
                    drop(teardown);
                });
            }
        }

        let count = shutdowns.len();
        while shutdowns.join_next().await.is_some() {}
        tracing::info!(count, "All memory sessions shut down");
    }

    /// Close sessions that have been idle for `idle_timeout` or whose peer
    /// has exited. Sessions in use are skipped. Returns how many were closed.
    pub async fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let slots: Vec<(UserId, Arc<UserSlot>)> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(user, slot)| (user.clone(), slot.clone()))
            .collect();

        let mut reaped = 0;
        for (user, slot) in slots {
            let Ok(_gate) = slot.gate.clone().try_lock_owned() else {
                continue;
            };

            let Some(session) = slot.state.lock().await.session.clone() else {
                continue;
            };
            let idle = session.idle_for();
            if idle < idle_timeout && session.is_alive().await {
                continue;
            }

            if slot.take_session().await.is_some() {
                tracing::info!(
                    user_id = %user,
                    idle_secs = idle.as_secs(),
                    "Reaping memory session"
                );
                session.shutdown().await;
                reaped += 1;
            }
        }
        reaped
    }

    /// Run [`reap_idle`](Self::reap_idle) every `interval` until `token` is cancelled.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        idle_timeout: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = registry.reap_idle(idle_timeout).await;
                        if reaped > 0 {
                            tracing::debug!(reaped, "Idle reaper pass complete");
                        }
                    }
                }
            }
            tracing::debug!("Idle reaper stopped");
        })
    }

    /// Users that currently have a session.
    pub async fn active_users(&self) -> Vec<UserId> {
        let slots: Vec<(UserId, Arc<UserSlot>)> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(user, slot)| (user.clone(), slot.clone()))
            .collect();

        let mut users = Vec::new();
        for (user, slot) in slots {
            if slot.state.lock().await.session.is_some() {
                users.push(user);
            }
        }
        users.sort();
        users
    }

    pub async fn active_count(&self) -> usize {
        self.active_users().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLauncher;
    use std::time::Instant;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn registry() -> (Arc<FakeLauncher>, Arc<SessionRegistry>) {
        let launcher = Arc::new(FakeLauncher::new());
        let registry = Arc::new(SessionRegistry::new(launcher.clone()));
        (launcher, registry)
    }

    async fn wait_for_spawns(launcher: &FakeLauncher, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while launcher.spawn_count() < n {
            assert!(Instant::now() < deadline, "launcher never reached {n} spawns");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn acquire_creates_then_reuses() {
        let (launcher, registry) = registry();
        let alice = user("alice");

        let lease = registry.acquire(&alice).await.unwrap();
        assert!(!lease.was_reused());
        drop(lease);

        let lease = registry.acquire(&alice).await.unwrap();
        assert!(lease.was_reused());
        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(registry.active_users().await, vec![alice]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_spawns_once() {
        let (launcher, registry) = registry();
        launcher.set_launch_delay(Duration::from_millis(50));
        let alice = user("alice");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let alice = alice.clone();
            tasks.push(tokio::spawn(async move {
                let lease = registry.acquire(&alice).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(lease);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(launcher.spawn_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn users_do_not_block_each_other() {
        let (launcher, registry) = registry();
        let alice = user("alice");
        let bob = user("bob");

        // alice holds her lease; bob's acquire must still complete
        let alice_lease = registry.acquire(&alice).await.unwrap();
        let bob_lease = tokio::time::timeout(Duration::from_secs(1), registry.acquire(&bob))
            .await
            .expect("bob blocked behind alice")
            .unwrap();

        assert_eq!(bob_lease.user(), &bob);
        assert_eq!(alice_lease.user(), &alice);
        assert_eq!(launcher.spawn_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_creation_for_one_user_does_not_block_another() {
        let (launcher, registry) = registry();
        let alice = user("alice");
        let bob = user("bob");

        let hold = launcher.hold_launches();
        let alice_task = {
            let registry = registry.clone();
            let alice = alice.clone();
            tokio::spawn(async move { registry.acquire(&alice).await.map(|_| ()) })
        };
        wait_for_spawns(&launcher, 1).await;

        // bob's own launch is held too; only a map lookup is shared, so
        // bob reaches the launcher while alice's creation is in progress
        let bob_task = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire(&bob).await.map(|_| ()) })
        };
        wait_for_spawns(&launcher, 2).await;

        hold.add_permits(2);
        alice_task.await.unwrap().unwrap();
        bob_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn release_unknown_user_is_noop() {
        let (_, registry) = registry();
        registry.release(&user("nobody")).await;
        registry.release(&user("nobody")).await;
        assert!(registry.active_users().await.is_empty());
    }

    #[tokio::test]
    async fn release_closes_peer_and_next_acquire_recreates() {
        let (launcher, registry) = registry();
        let alice = user("alice");

        drop(registry.acquire(&alice).await.unwrap());
        let first = launcher.peer(&alice).unwrap();

        registry.release(&alice).await;
        assert!(first.is_closed());
        assert!(registry.active_users().await.is_empty());

        let lease = registry.acquire(&alice).await.unwrap();
        assert!(!lease.was_reused());
        assert_eq!(launcher.spawn_count(), 2);
    }

    #[tokio::test]
    async fn failed_creation_leaves_no_entry() {
        let (launcher, registry) = registry();
        let alice = user("alice");
        launcher.fail_next(1);

        let err = registry.acquire(&alice).await.err().unwrap();
        assert!(err.is_creation_failure());
        assert!(registry.active_users().await.is_empty());

        // the next attempt launches again and succeeds
        registry.acquire(&alice).await.unwrap();
        assert_eq!(launcher.spawn_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn creation_finishing_after_release_is_discarded() {
        let (launcher, registry) = registry();
        let alice = user("alice");
        let hold = launcher.hold_launches();

        let pending = {
            let registry = registry.clone();
            let alice = alice.clone();
            tokio::spawn(async move { registry.acquire(&alice).await.map(|_| ()) })
        };
        wait_for_spawns(&launcher, 1).await;

        registry.release(&alice).await;
        hold.add_permits(1);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Released));
        assert!(launcher.peer(&alice).unwrap().is_closed());
        assert!(registry.active_users().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn acquire_after_release_waits_for_pending_creation() {
        let (launcher, registry) = registry();
        let alice = user("alice");
        let hold = launcher.hold_launches();

        let first = {
            let registry = registry.clone();
            let alice = alice.clone();
            tokio::spawn(async move { registry.acquire(&alice).await.map(|_| ()) })
        };
        wait_for_spawns(&launcher, 1).await;

        registry.release(&alice).await;
        let second = {
            let registry = registry.clone();
            let alice = alice.clone();
            tokio::spawn(async move { registry.acquire(&alice).await.map(|_| ()) })
        };

        // the new acquire queues behind the released creation
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.spawn_count(), 1);

        hold.add_permits(2);
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Released));
        second.await.unwrap().unwrap();

        assert_eq!(launcher.spawn_count(), 2);
        assert_eq!(launcher.max_concurrent_launches(), 1);
        assert_eq!(launcher.overlapping_launches(), 0);
        assert!(launcher.peers(&alice)[0].is_closed());
        assert_eq!(registry.active_users().await, vec![alice]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn acquire_after_release_waits_for_old_peer_to_close() {
        let (launcher, registry) = registry();
        let alice = user("alice");

        drop(registry.acquire(&alice).await.unwrap());
        let old = launcher.peer(&alice).unwrap();
        old.set_close_delay(Duration::from_millis(100));

        let releasing = {
            let registry = registry.clone();
            let alice = alice.clone();
            tokio::spawn(async move { registry.release(&alice).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!old.is_closed());

        let lease = registry.acquire(&alice).await.unwrap();
        assert!(!lease.was_reused());
        assert!(old.is_closed());
        assert_eq!(launcher.overlapping_launches(), 0);
        releasing.await.unwrap();
    }

    #[tokio::test]
    async fn unhealthy_session_is_replaced() {
        let (launcher, registry) = registry();
        let alice = user("alice");

        let lease = registry.acquire(&alice).await.unwrap();
        lease.mark_unhealthy();
        drop(lease);

        let lease = registry.acquire(&alice).await.unwrap();
        assert!(!lease.was_reused());
        assert_eq!(launcher.spawn_count(), 2);
        assert!(launcher.peers(&alice)[0].is_closed());
    }

    #[tokio::test]
    async fn evict_clears_slot() {
        let (launcher, registry) = registry();
        let alice = user("alice");

        let lease = registry.acquire(&alice).await.unwrap();
        lease.evict().await;
        assert!(registry.active_users().await.is_empty());
        drop(lease);

        registry.acquire(&alice).await.unwrap();
        assert_eq!(launcher.spawn_count(), 2);
    }

    #[tokio::test]
    async fn reopen_swaps_session_under_same_lease() {
        let (launcher, registry) = registry();
        let alice = user("alice");

        let mut lease = registry.acquire(&alice).await.unwrap();
        registry.reopen(&mut lease).await.unwrap();
        assert!(!lease.was_reused());
        assert!(lease.is_healthy());
        assert_eq!(launcher.spawn_count(), 2);
        assert!(launcher.peers(&alice)[0].is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn release_fails_in_flight_call_without_waiting() {
        let (launcher, registry) = registry();
        let alice = user("alice");

        drop(registry.acquire(&alice).await.unwrap());
        launcher.peer(&alice).unwrap().hang_retrieve(true);

        let in_flight = {
            let registry = registry.clone();
            let alice = alice.clone();
            tokio::spawn(async move {
                let lease = registry.acquire(&alice).await.unwrap();
                lease.retrieve_memory("Hi").await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), registry.release(&alice))
            .await
            .expect("release waited for the in-flight turn");

        let result = tokio::time::timeout(Duration::from_secs(2), in_flight)
            .await
            .expect("in-flight call hung after release")
            .unwrap();
        let err = result.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn waiter_on_released_slot_gets_released_error() {
        let (_, registry) = registry();
        let alice = user("alice");

        let lease = registry.acquire(&alice).await.unwrap();
        let waiter = {
            let registry = Arc::clone(&registry);
            let alice = alice.clone();
            tokio::spawn(async move { registry.acquire(&alice).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        registry.release(&alice).await;
        drop(lease);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Released));
    }

    #[tokio::test]
    async fn reap_idle_closes_idle_and_dead_sessions() {
        let (launcher, registry) = registry();
        let alice = user("alice");
        let bob = user("bob");
        let carol = user("carol");

        drop(registry.acquire(&alice).await.unwrap());
        drop(registry.acquire(&bob).await.unwrap());
        let carol_lease = registry.acquire(&carol).await.unwrap();

        // nothing is idle for an hour yet
        assert_eq!(registry.reap_idle(Duration::from_secs(3600)).await, 0);

        // a dead peer is reaped regardless of idle time
        launcher.peer(&bob).unwrap().kill();
        assert_eq!(registry.reap_idle(Duration::from_secs(3600)).await, 1);
        assert_eq!(registry.active_users().await, vec![alice.clone(), carol.clone()]);

        // carol is leased, so only alice goes
        assert_eq!(registry.reap_idle(Duration::ZERO).await, 1);
        assert_eq!(registry.active_users().await, vec![carol]);
        drop(carol_lease);

        // alice comes back on demand
        registry.acquire(&alice).await.unwrap();
    }

    #[tokio::test]
    async fn reaper_task_stops_on_cancel() {
        let (_, registry) = registry();
        drop(registry.acquire(&user("alice")).await.unwrap());

        let token = CancellationToken::new();
        let handle = registry.spawn_reaper(
            Duration::from_millis(10),
            Duration::ZERO,
            token.clone(),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while registry.active_count().await > 0 {
            assert!(Instant::now() < deadline, "reaper never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_all_closes_everything() {
        let (launcher, registry) = registry();
        let users = [user("alice"), user("bob"), user("carol")];
        for u in &users {
            drop(registry.acquire(u).await.unwrap());
        }

        registry.shutdown_all().await;

        assert!(registry.active_users().await.is_empty());
        for u in &users {
            assert!(launcher.peer(u).unwrap().is_closed());
        }
    }
}

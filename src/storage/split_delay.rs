//! Delaying splits while followers catch up, so the new right-hand replicas
//! are not created from a snapshot right away.

use crate::kvpb::ReplicaId;
use crate::storage::raft::{Progress, ProgressState};
use crate::utils::Ctx;

use async_trait::async_trait;

use tokio::time::Duration;

/// Leader view and side effects used while delaying a split.
#[async_trait]
pub(super) trait SplitDelayHelper: Send + Sync {
    /// Progress of every follower, or `None` unless this replica leads.
    fn follower_progress(&self) -> Option<Vec<(ReplicaId, Progress)>>;

    /// Proposes an empty command, nudging lagging followers.
    fn propose_empty(&self);

    fn num_attempts(&self) -> u32;

    /// Waits one delay interval and returns how long that was.
    async fn sleep(&self) -> Duration;
}

/// Outcome of a split delay.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(super) struct SplitDelay {
    pub waited: Duration,

    /// Followers still behind when the delay gave up.
    pub lagging: Vec<ReplicaId>,

    /// Followers pinged once and then ignored as inactive.
    pub inactive: Vec<ReplicaId>,

    pub not_leader: bool,
}

impl SplitDelay {
    pub fn caught_up(&self) -> bool {
        self.lagging.is_empty()
    }
}

/// Waits up to `num_attempts` intervals for every active follower to reach
/// the replicate state. Inactive followers hold up only the first attempt.
pub(super) async fn delay_split_to_avoid_snapshot(
    ctx: &Ctx,
    h: &impl SplitDelayHelper,
) -> SplitDelay {
    let mut delay = SplitDelay::default();
    for attempt in 0..h.num_attempts() {
        let progress = match h.follower_progress() {
            Some(progress) => progress,
            None => {
                delay.not_leader = true;
                delay.lagging.clear();
                break;
            }
        };

        let mut done = true;
        delay.lagging.clear();
        for (id, pr) in progress {
            if pr.state == ProgressState::Replicate {
                continue;
            }
            if !pr.recent_active {
                if attempt == 0 {
                    delay.inactive.push(id);
                    done = false;
                }
                continue;
            }
            delay.lagging.push(id);
            done = false;
        }
        if done {
            break;
        }

        h.propose_empty();
        if ctx.check().is_err() {
            break;
        }
        delay.waited += h.sleep().await;
    }
    delay
}

#[cfg(test)]
mod split_delay_tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn progress(state: ProgressState, recent_active: bool) -> Progress {
        Progress {
            matched: 0,
            next: 0,
            state,
            recent_active,
        }
    }

    #[derive(Default)]
    struct Recorder {
        slept: u32,
        proposed: u32,
    }

    /// Scripted leader view; `on_sleep` may mutate the followers.
    struct ScriptedHelper {
        attempts: u32,
        followers: Mutex<Option<BTreeMap<ReplicaId, Progress>>>,
        calls: Mutex<Recorder>,
        on_sleep: Box<dyn Fn(u32, &mut BTreeMap<ReplicaId, Progress>) + Send + Sync>,
    }

    impl ScriptedHelper {
        fn new(attempts: u32, followers: Option<Vec<(ReplicaId, Progress)>>) -> Self {
            ScriptedHelper {
                attempts,
                followers: Mutex::new(followers.map(|f| f.into_iter().collect())),
                calls: Mutex::new(Recorder::default()),
                on_sleep: Box::new(|_, _| {}),
            }
        }

        fn counts(&self) -> (u32, u32) {
            let calls = self.calls.lock().unwrap();
            (calls.slept, calls.proposed)
        }
    }

    #[async_trait]
    impl SplitDelayHelper for ScriptedHelper {
        fn follower_progress(&self) -> Option<Vec<(ReplicaId, Progress)>> {
            self.followers
                .lock()
                .unwrap()
                .as_ref()
                .map(|f| f.iter().map(|(id, pr)| (*id, *pr)).collect())
        }

        fn propose_empty(&self) {
            self.calls.lock().unwrap().proposed += 1;
        }

        fn num_attempts(&self) -> u32 {
            self.attempts
        }

        async fn sleep(&self) -> Duration {
            let slept = self.calls.lock().unwrap().slept;
            if let Some(followers) = self.followers.lock().unwrap().as_mut() {
                (self.on_sleep)(slept, followers);
            }
            self.calls.lock().unwrap().slept += 1;
            Duration::from_secs(1)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn disabled_and_not_leader() {
        let ctx = Ctx::background();
        let h = ScriptedHelper::new(0, None);
        assert_eq!(delay_split_to_avoid_snapshot(&ctx, &h).await, SplitDelay::default());
        assert_eq!(h.counts(), (0, 0));

        let h = ScriptedHelper::new(5, None);
        let delay = delay_split_to_avoid_snapshot(&ctx, &h).await;
        assert!(delay.not_leader);
        assert_eq!(h.counts(), (0, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn inactive_follower_pinged_once() {
        let ctx = Ctx::background();
        let h = ScriptedHelper::new(5, Some(vec![(2, progress(ProgressState::Probe, false))]));
        let delay = delay_split_to_avoid_snapshot(&ctx, &h).await;
        assert_eq!(delay.inactive, vec![2]);
        assert!(delay.caught_up());
        assert_eq!(delay.waited, Duration::from_secs(1));
        assert_eq!(h.counts(), (1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn active_laggard_exhausts_attempts() {
        let ctx = Ctx::background();
        for state in [ProgressState::Probe, ProgressState::Snapshot] {
            let h = ScriptedHelper::new(
                5,
                Some(vec![
                    (2, progress(state, true)),
                    (3, progress(ProgressState::Replicate, false)),
                ]),
            );
            let delay = delay_split_to_avoid_snapshot(&ctx, &h).await;
            assert_eq!(delay.lagging, vec![2]);
            assert_eq!(delay.waited, Duration::from_secs(5));
            assert_eq!(h.counts(), (5, 5));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn replicating_follower_needs_no_delay() {
        let ctx = Ctx::background();
        let h = ScriptedHelper::new(
            5,
            Some(vec![(2, progress(ProgressState::Replicate, false))]),
        );
        let delay = delay_split_to_avoid_snapshot(&ctx, &h).await;
        assert!(delay.caught_up());
        assert_eq!(delay.waited, Duration::ZERO);
        assert_eq!(h.counts(), (0, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn follower_catches_up_midway() {
        let ctx = Ctx::background();
        let mut h = ScriptedHelper::new(5, Some(vec![(2, progress(ProgressState::Probe, true))]));
        h.on_sleep = Box::new(|slept, followers| {
            if slept == 2 {
                if let Some(pr) = followers.get_mut(&2) {
                    pr.state = ProgressState::Replicate;
                }
            }
        });
        let delay = delay_split_to_avoid_snapshot(&ctx, &h).await;
        assert!(delay.caught_up());
        assert_eq!(delay.waited, Duration::from_secs(3));
        assert_eq!(h.counts(), (3, 3));
    }
}

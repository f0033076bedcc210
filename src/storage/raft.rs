//! Per-range replicated log.
//!
//! A leader-based log with terms, log-matching appends, quorum commit and
//! follower progress tracking. Leadership is never contested on timeouts:
//! a replica campaigns only when it needs the range lease, and voters
//! refuse candidates while they know of a valid lease held elsewhere. The
//! leader is therefore always the (would-be) leaseholder.

use std::collections::HashMap;

use crate::kvpb::ReplicaId;
use crate::utils::{Bitmap, KvError};

use serde::{Deserialize, Serialize};

/// Index and term every initialized range starts its log at.
pub const INITIAL_LOG_INDEX: u64 = 10;
pub const INITIAL_LOG_TERM: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: u64,
    pub index: u64,

    /// Encoded command; empty for the no-op a new leader appends.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: Option<ReplicaId>,
    pub commit: u64,
}

/// State-machine snapshot shipped to a follower that fell behind the
/// truncated prefix of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Append {
        prev_index: u64,
        prev_term: u64,
        entries: Vec<Entry>,
        commit: u64,
    },

    /// `index` is the match index on success, the follower's last index as
    /// a hint on rejection.
    AppendResp { reject: bool, index: u64 },

    Heartbeat { commit: u64 },
    HeartbeatResp,
    Snapshot { snapshot: Snapshot },
    Vote { last_index: u64, last_term: u64 },
    VoteResp { granted: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: ReplicaId,
    pub to: ReplicaId,
    pub term: u64,
    pub body: MessageBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Replication state of a follower, as tracked by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// Position unknown; one append in flight at a time.
    Probe,
    /// Caught up and streaming.
    Replicate,
    /// Waiting for a snapshot to land.
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub matched: u64,
    pub next: u64,
    pub state: ProgressState,

    /// Heard from since the last heartbeat round.
    pub recent_active: bool,
}

/// Output of the group to be handled by the replica.
#[derive(Debug, Default)]
pub struct Ready {
    pub messages: Vec<Message>,

    /// Entries to persist before the messages are sent.
    pub entries: Vec<Entry>,

    /// Newly committed entries to apply, in order.
    pub committed: Vec<Entry>,

    /// Snapshot received from the leader, to install before applying.
    pub snapshot: Option<Snapshot>,

    pub hard_state: Option<HardState>,

    /// Followers that need a snapshot from the leader's state machine.
    pub needs_snapshot: Vec<ReplicaId>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.entries.is_empty()
            && self.committed.is_empty()
            && self.snapshot.is_none()
            && self.hard_state.is_none()
            && self.needs_snapshot.is_empty()
    }
}

/// Replicated log of one replica.
pub struct RaftGroup {
    id: ReplicaId,

    /// Voters, self included; ordered as in the range descriptor.
    peers: Vec<ReplicaId>,

    heartbeat_ticks: u32,

    term: u64,
    vote: Option<ReplicaId>,
    role: Role,
    leader: Option<ReplicaId>,

    /// Entries after `snap_index`.
    log: Vec<Entry>,
    snap_index: u64,
    snap_term: u64,

    commit: u64,
    applied: u64,

    /// First log index not yet handed out for persistence.
    unstable: u64,

    progress: HashMap<ReplicaId, Progress>,
    votes: Bitmap,
    rejections: Bitmap,

    /// Ticks since the leader was last heard from (followers) or since
    /// the last heartbeat round (leader).
    elapsed: u32,

    msgs: Vec<Message>,
    pending_snapshot: Option<Snapshot>,
    needs_snapshot: Vec<ReplicaId>,
    last_hard_state: HardState,
}

impl RaftGroup {
    /// Creates a group whose state machine reflects the log up to
    /// `(snap_index, snap_term)`. An uninitialized replica passes zeros.
    pub fn new(
        id: ReplicaId,
        peers: Vec<ReplicaId>,
        heartbeat_ticks: u32,
        hard_state: HardState,
        snap_index: u64,
        snap_term: u64,
        log: Vec<Entry>,
    ) -> Self {
        let mut log = log;
        log.retain(|e| e.index > snap_index);
        let n = peers.len().max(1);
        let last = snap_index + log.len() as u64;
        RaftGroup {
            id,
            peers,
            heartbeat_ticks: heartbeat_ticks.max(1),
            term: hard_state.term.max(snap_term),
            vote: hard_state.vote,
            role: Role::Follower,
            leader: None,
            log,
            snap_index,
            snap_term,
            commit: hard_state.commit.clamp(snap_index, last),
            applied: snap_index,
            unstable: last + 1,
            progress: HashMap::new(),
            votes: Bitmap::new(n),
            rejections: Bitmap::new(n),
            elapsed: 0,
            msgs: Vec::new(),
            pending_snapshot: None,
            needs_snapshot: Vec::new(),
            last_hard_state: hard_state,
        }
    }

    #[inline]
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    #[inline]
    pub fn term(&self) -> u64 {
        self.term
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn leader(&self) -> Option<ReplicaId> {
        self.leader
    }

    #[inline]
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn commit_index(&self) -> u64 {
        self.commit
    }

    pub fn applied_index(&self) -> u64 {
        self.applied
    }

    pub fn first_index(&self) -> u64 {
        self.snap_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.snap_index + self.log.len() as u64
    }

    pub fn peers(&self) -> &[ReplicaId] {
        &self.peers
    }

    pub fn progress(&self, id: ReplicaId) -> Option<Progress> {
        self.progress.get(&id).copied()
    }

    /// Term of the entry at `index`, if still in the log.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snap_index {
            return Some(self.snap_term);
        }
        if index < self.snap_index || index > self.last_index() {
            return None;
        }
        Some(self.log[(index - self.snap_index - 1) as usize].term)
    }

    fn entries_from(&self, lo: u64) -> Option<Vec<Entry>> {
        if lo <= self.snap_index {
            return None;
        }
        let start = (lo - self.snap_index - 1) as usize;
        Some(self.log.get(start..).map(|s| s.to_vec()).unwrap_or_default())
    }

    fn quorum(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    fn slot(&self, id: ReplicaId) -> Option<usize> {
        self.peers.iter().position(|p| *p == id)
    }

    fn send(&mut self, to: ReplicaId, body: MessageBody) {
        self.msgs.push(Message {
            from: self.id,
            to,
            term: self.term,
            body,
        });
    }

    fn become_follower(&mut self, term: u64, leader: Option<ReplicaId>) {
        if term > self.term {
            self.term = term;
            self.vote = None;
        }
        self.role = Role::Follower;
        self.leader = leader;
        self.elapsed = 0;
        self.progress.clear();
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.elapsed = 0;
        let last = self.last_index();
        self.progress = self
            .peers
            .iter()
            .map(|&p| {
                (
                    p,
                    Progress {
                        matched: if p == self.id { last } else { 0 },
                        next: last + 1,
                        state: ProgressState::Probe,
                        recent_active: p == self.id,
                    },
                )
            })
            .collect();
        // entries of earlier terms only commit along with one of our own
        self.append_local(Vec::new());
        self.bcast_append();
    }

    /// Starts an election at a new term.
    pub fn campaign(&mut self) -> Result<(), KvError> {
        let slot = self
            .slot(self.id)
            .ok_or_else(|| KvError::msg(format!("replica {} is not a voter", self.id)))?;
        if self.role == Role::Leader {
            return Ok(());
        }
        self.term += 1;
        self.vote = Some(self.id);
        self.role = Role::Candidate;
        self.leader = None;
        self.votes = Bitmap::new(self.peers.len());
        self.rejections = Bitmap::new(self.peers.len());
        self.votes.set(slot, true)?;
        if self.votes.count() >= self.quorum() {
            self.become_leader();
            return Ok(());
        }
        let (last_index, last_term) = (self.last_index(), self.term_at(self.last_index()).unwrap_or(0));
        for p in self.peers.clone() {
            if p != self.id {
                self.send(p, MessageBody::Vote { last_index, last_term });
            }
        }
        Ok(())
    }

    fn append_local(&mut self, data: Vec<u8>) -> u64 {
        let index = self.last_index() + 1;
        self.log.push(Entry {
            term: self.term,
            index,
            data,
        });
        if let Some(pr) = self.progress.get_mut(&self.id) {
            pr.matched = index;
            pr.next = index + 1;
        }
        self.maybe_commit();
        index
    }

    /// Appends a command on the leader; returns its `(index, term)`.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(u64, u64), KvError> {
        if self.role != Role::Leader {
            return Err(KvError::msg(format!(
                "replica {} is not the leader (leader {:?})",
                self.id, self.leader
            )));
        }
        let index = self.append_local(data);
        self.bcast_append();
        Ok((index, self.term))
    }

    fn bcast_append(&mut self) {
        for p in self.peers.clone() {
            if p != self.id {
                self.send_append(p);
            }
        }
    }

    fn send_append(&mut self, to: ReplicaId) {
        let pr = match self.progress.get(&to) {
            Some(pr) => *pr,
            None => return,
        };
        if pr.state == ProgressState::Snapshot {
            return;
        }
        let prev_index = pr.next - 1;
        let (prev_term, entries) = match (self.term_at(prev_index), self.entries_from(pr.next)) {
            (Some(t), Some(e)) => (t, e),
            _ => {
                self.request_snapshot(to);
                return;
            }
        };
        let sent = entries.len() as u64;
        let commit = self.commit;
        self.send(
            to,
            MessageBody::Append {
                prev_index,
                prev_term,
                entries,
                commit,
            },
        );
        if pr.state == ProgressState::Replicate && sent > 0 {
            if let Some(pr) = self.progress.get_mut(&to) {
                pr.next = prev_index + sent + 1;
            }
        }
    }

    fn request_snapshot(&mut self, to: ReplicaId) {
        if let Some(pr) = self.progress.get_mut(&to) {
            pr.state = ProgressState::Snapshot;
        }
        if !self.needs_snapshot.contains(&to) {
            self.needs_snapshot.push(to);
        }
    }

    /// Sends a snapshot of the leader's state machine at `index`.
    pub fn send_snapshot(&mut self, to: ReplicaId, index: u64, data: Vec<u8>) -> Result<(), KvError> {
        let term = self
            .term_at(index)
            .ok_or_else(|| KvError::msg(format!("no term known for index {}", index)))?;
        self.send(
            to,
            MessageBody::Snapshot {
                snapshot: Snapshot { index, term, data },
            },
        );
        Ok(())
    }

    /// Advances the commit index to the highest entry of the current term
    /// replicated on a quorum.
    fn maybe_commit(&mut self) -> bool {
        if self.role != Role::Leader {
            return false;
        }
        let mut matched: Vec<u64> = self
            .peers
            .iter()
            .map(|p| self.progress.get(p).map_or(0, |pr| pr.matched))
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let idx = match matched.get(self.quorum() - 1) {
            Some(&i) => i,
            None => return false,
        };
        if idx > self.commit && self.term_at(idx) == Some(self.term) {
            self.commit = idx;
            return true;
        }
        false
    }

    /// Advances the logical clock of the group.
    pub fn tick(&mut self) {
        self.elapsed += 1;
        if self.role != Role::Leader || self.elapsed < self.heartbeat_ticks {
            return;
        }
        self.elapsed = 0;
        for p in self.peers.clone() {
            if p == self.id {
                continue;
            }
            let pr = match self.progress.get_mut(&p) {
                Some(pr) => pr,
                None => continue,
            };
            pr.recent_active = false;
            let commit = self.commit.min(pr.matched);
            let probe = pr.state == ProgressState::Probe;
            self.send(p, MessageBody::Heartbeat { commit });
            if probe {
                self.send_append(p);
            }
        }
    }

    /// True if a follower heard from its leader within the last
    /// `within_ticks` ticks.
    pub fn leader_recently_active(&self, within_ticks: u32) -> bool {
        self.role == Role::Leader || (self.leader.is_some() && self.elapsed < within_ticks)
    }

    /// Handles a message from a peer. `vote_allowed` tells whether the
    /// replica would accept the sender as leaseholder.
    pub fn step(&mut self, m: Message, vote_allowed: bool) -> Result<(), KvError> {
        if m.term > self.term {
            match &m.body {
                MessageBody::Vote { .. } if !vote_allowed => {
                    // refuse at the candidate's term without adopting it
                    self.msgs.push(Message {
                        from: self.id,
                        to: m.from,
                        term: m.term,
                        body: MessageBody::VoteResp { granted: false },
                    });
                    return Ok(());
                }
                MessageBody::Append { .. }
                | MessageBody::Heartbeat { .. }
                | MessageBody::Snapshot { .. } => {
                    self.become_follower(m.term, Some(m.from))
                }
                _ => self.become_follower(m.term, None),
            }
        } else if m.term < self.term {
            if matches!(m.body, MessageBody::Append { .. } | MessageBody::Heartbeat { .. }) {
                // tell the stale leader about the newer term
                let index = self.last_index();
                self.send(m.from, MessageBody::AppendResp { reject: true, index });
            }
            return Ok(());
        }

        match m.body {
            MessageBody::Append {
                prev_index,
                prev_term,
                entries,
                commit,
            } => {
                self.become_follower(m.term, Some(m.from));
                self.handle_append(m.from, prev_index, prev_term, entries, commit);
            }
            MessageBody::Heartbeat { commit } => {
                self.become_follower(m.term, Some(m.from));
                if commit > self.commit && commit <= self.last_index() {
                    self.commit = commit;
                }
                self.send(m.from, MessageBody::HeartbeatResp);
            }
            MessageBody::Snapshot { snapshot } => {
                self.become_follower(m.term, Some(m.from));
                self.handle_snapshot(m.from, snapshot);
            }
            MessageBody::Vote {
                last_index,
                last_term,
            } => {
                let my_last_term = self.term_at(self.last_index()).unwrap_or(0);
                let up_to_date = last_term > my_last_term
                    || (last_term == my_last_term && last_index >= self.last_index());
                let granted = vote_allowed
                    && self.role != Role::Leader
                    && self.vote.map_or(true, |v| v == m.from)
                    && up_to_date;
                if granted {
                    self.vote = Some(m.from);
                    self.elapsed = 0;
                }
                self.send(m.from, MessageBody::VoteResp { granted });
            }
            MessageBody::VoteResp { granted } => {
                if self.role != Role::Candidate {
                    return Ok(());
                }
                if let Some(slot) = self.slot(m.from) {
                    if granted {
                        self.votes.set(slot, true)?;
                    } else {
                        self.rejections.set(slot, true)?;
                    }
                }
                if self.votes.count() >= self.quorum() {
                    self.become_leader();
                } else if self.rejections.count() >= self.quorum() {
                    self.become_follower(self.term, None);
                }
            }
            MessageBody::AppendResp { reject, index } => {
                self.handle_append_resp(m.from, reject, index);
            }
            MessageBody::HeartbeatResp => {
                let last_index = self.last_index();
                if let Some(pr) = self.progress.get_mut(&m.from) {
                    pr.recent_active = true;
                    if pr.matched < last_index && pr.state != ProgressState::Snapshot {
                        self.send_append(m.from);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_append(
        &mut self,
        from: ReplicaId,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<Entry>,
        commit: u64,
    ) {
        if prev_index < self.commit {
            // already committed locally; acknowledge what we have
            let index = self.commit;
            let tail: Vec<Entry> = entries.into_iter().filter(|e| e.index > index).collect();
            if tail.is_empty() || self.term_at(index).is_none() {
                self.send(from, MessageBody::AppendResp { reject: false, index });
                return;
            }
            let t = self.term_at(index).unwrap_or(0);
            return self.handle_append(from, index, t, tail, commit);
        }
        if self.term_at(prev_index) != Some(prev_term) {
            let hint = self.last_index().min(prev_index.saturating_sub(1));
            self.send(from, MessageBody::AppendResp { reject: true, index: hint });
            return;
        }
        for e in entries.iter() {
            match self.term_at(e.index) {
                Some(t) if t == e.term => continue,
                Some(_) => {
                    // conflicting suffix; never below the commit index
                    self.log.truncate((e.index - self.snap_index - 1) as usize);
                    self.unstable = self.unstable.min(e.index);
                    self.log.push(e.clone());
                }
                None => self.log.push(e.clone()),
            }
        }
        let last_new = prev_index + entries.len() as u64;
        if commit > self.commit {
            self.commit = commit.min(last_new);
        }
        self.send(from, MessageBody::AppendResp { reject: false, index: last_new });
    }

    fn handle_snapshot(&mut self, from: ReplicaId, snapshot: Snapshot) {
        if snapshot.index <= self.commit {
            let index = self.commit;
            self.send(from, MessageBody::AppendResp { reject: false, index });
            return;
        }
        self.log.clear();
        self.snap_index = snapshot.index;
        self.snap_term = snapshot.term;
        self.commit = snapshot.index;
        self.applied = snapshot.index;
        self.unstable = snapshot.index + 1;
        let index = snapshot.index;
        self.pending_snapshot = Some(snapshot);
        self.send(from, MessageBody::AppendResp { reject: false, index });
    }

    fn handle_append_resp(&mut self, from: ReplicaId, reject: bool, index: u64) {
        if self.role != Role::Leader {
            return;
        }
        let last = self.last_index();
        let pr = match self.progress.get_mut(&from) {
            Some(pr) => pr,
            None => return,
        };
        pr.recent_active = true;
        if reject {
            if index == 0 {
                // empty, uninitialized replica
                self.request_snapshot(from);
                return;
            }
            pr.next = (index + 1).min(pr.next.saturating_sub(1)).max(1);
            pr.state = ProgressState::Probe;
            self.send_append(from);
            return;
        }
        if index > pr.matched {
            pr.matched = index;
        }
        pr.next = pr.next.max(index + 1);
        if pr.state != ProgressState::Replicate {
            pr.state = ProgressState::Replicate;
            pr.next = pr.matched + 1;
        }
        self.needs_snapshot.retain(|p| *p != from);
        let behind = pr.matched < last;
        if self.maybe_commit() {
            self.bcast_append();
        } else if behind {
            self.send_append(from);
        }
    }

    /// Replaces the voter set after a configuration change.
    pub fn set_peers(&mut self, peers: Vec<ReplicaId>) {
        if self.role == Role::Leader {
            let last = self.last_index();
            for p in &peers {
                self.progress.entry(*p).or_insert(Progress {
                    matched: 0,
                    next: last + 1,
                    state: ProgressState::Probe,
                    recent_active: false,
                });
            }
            self.progress.retain(|p, _| peers.contains(p));
        }
        self.votes = Bitmap::new(peers.len().max(1));
        self.rejections = Bitmap::new(peers.len().max(1));
        self.peers = peers;
        if self.role == Role::Leader {
            self.maybe_commit();
            self.bcast_append();
        }
    }

    /// Discards log entries up to `index`, which must be applied.
    pub fn compact(&mut self, index: u64) -> Option<u64> {
        if index <= self.snap_index || index > self.applied {
            return None;
        }
        let term = self.term_at(index)?;
        let drop_n = (index - self.snap_index) as usize;
        self.log.drain(..drop_n);
        self.snap_index = index;
        self.snap_term = term;
        Some(term)
    }

    /// Advances the commit index to an entry known to be committed through
    /// another channel, e.g. the right-hand side of a merge catching up
    /// before it is subsumed. Returns false if the entry is not in the log.
    pub fn commit_to(&mut self, index: u64) -> bool {
        if index > self.last_index() {
            return false;
        }
        if index > self.commit {
            self.commit = index;
        }
        true
    }

    pub fn has_ready(&self) -> bool {
        !self.msgs.is_empty()
            || self.unstable <= self.last_index()
            || self.commit > self.applied
            || self.pending_snapshot.is_some()
            || !self.needs_snapshot.is_empty()
            || self.hard_state() != self.last_hard_state
    }

    fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.commit,
        }
    }

    /// Collects pending output. Committed entries are considered applied
    /// once handed out.
    pub fn ready(&mut self) -> Ready {
        let entries = if self.unstable <= self.last_index() {
            self.entries_from(self.unstable).unwrap_or_default()
        } else {
            Vec::new()
        };
        self.unstable = self.last_index() + 1;
        let committed = if self.commit > self.applied {
            let lo = (self.applied + 1 - self.first_index()) as usize;
            let hi = (self.commit + 1 - self.first_index()) as usize;
            self.log.get(lo..hi).map(|s| s.to_vec()).unwrap_or_default()
        } else {
            Vec::new()
        };
        self.applied = self.applied.max(self.commit);
        let hs = self.hard_state();
        let hard_state = if hs != self.last_hard_state {
            self.last_hard_state = hs;
            Some(hs)
        } else {
            None
        };
        Ready {
            messages: std::mem::take(&mut self.msgs),
            entries,
            committed,
            snapshot: self.pending_snapshot.take(),
            hard_state,
            needs_snapshot: std::mem::take(&mut self.needs_snapshot),
        }
    }
}

#[cfg(test)]
mod raft_tests {
    use super::*;

    /// Delivers messages among groups until quiet.
    fn deliver(groups: &mut HashMap<ReplicaId, RaftGroup>, drop_to: Option<ReplicaId>) -> Vec<(ReplicaId, Ready)> {
        let mut readies = Vec::new();
        loop {
            let mut msgs = Vec::new();
            for (id, g) in groups.iter_mut() {
                if g.has_ready() {
                    let rd = g.ready();
                    msgs.extend(rd.messages.iter().cloned());
                    readies.push((*id, rd));
                }
            }
            if msgs.is_empty() {
                return readies;
            }
            for m in msgs {
                if Some(m.to) == drop_to {
                    continue;
                }
                if let Some(g) = groups.get_mut(&m.to) {
                    g.step(m, true).unwrap();
                }
            }
        }
    }

    fn cluster(n: u32) -> HashMap<ReplicaId, RaftGroup> {
        let peers: Vec<ReplicaId> = (1..=n).collect();
        peers
            .iter()
            .map(|&id| {
                (
                    id,
                    RaftGroup::new(
                        id,
                        peers.clone(),
                        2,
                        HardState::default(),
                        INITIAL_LOG_INDEX,
                        INITIAL_LOG_TERM,
                        vec![],
                    ),
                )
            })
            .collect()
    }

    #[test]
    fn elect_and_commit() -> Result<(), KvError> {
        let mut groups = cluster(3);
        groups.get_mut(&1).unwrap().campaign()?;
        deliver(&mut groups, None);
        assert!(groups[&1].is_leader());
        assert_eq!(groups[&2].leader(), Some(1));
        let (index, _) = groups.get_mut(&1).unwrap().propose(b"cmd".to_vec())?;
        let readies = deliver(&mut groups, None);
        assert_eq!(groups[&1].commit_index(), index);
        let applied: Vec<_> = readies
            .iter()
            .flat_map(|(_, rd)| rd.committed.iter())
            .filter(|e| e.data == b"cmd")
            .collect();
        // followers learn the commit index with the next heartbeat
        for _ in 0..2 {
            groups.get_mut(&1).unwrap().tick();
        }
        deliver(&mut groups, None);
        assert!(!applied.is_empty());
        assert_eq!(groups[&2].commit_index(), index);
        Ok(())
    }

    #[test]
    fn quorum_survives_one_down() -> Result<(), KvError> {
        let mut groups = cluster(3);
        groups.get_mut(&1).unwrap().campaign()?;
        deliver(&mut groups, Some(3));
        assert!(groups[&1].is_leader());
        let (index, _) = groups.get_mut(&1).unwrap().propose(b"x".to_vec())?;
        deliver(&mut groups, Some(3));
        assert_eq!(groups[&1].commit_index(), index);
        assert_eq!(groups[&3].last_index(), INITIAL_LOG_INDEX);
        // the lagging follower catches up once reachable
        for _ in 0..2 {
            groups.get_mut(&1).unwrap().tick();
        }
        deliver(&mut groups, None);
        assert_eq!(groups[&3].last_index(), index);
        Ok(())
    }

    #[test]
    fn vote_refused_under_lease() -> Result<(), KvError> {
        let mut groups = cluster(3);
        groups.get_mut(&2).unwrap().campaign()?;
        let rd = groups.get_mut(&2).unwrap().ready();
        for m in rd.messages {
            let to = m.to;
            groups.get_mut(&to).unwrap().step(m, false)?;
        }
        let mut resps = Vec::new();
        for id in [1, 3] {
            resps.extend(groups.get_mut(&id).unwrap().ready().messages);
        }
        for m in resps {
            groups.get_mut(&2).unwrap().step(m, true)?;
        }
        assert_eq!(groups[&2].role(), Role::Follower);
        // refusing voters kept their term
        assert_eq!(groups[&1].term(), INITIAL_LOG_TERM);
        Ok(())
    }

    #[test]
    fn new_replica_gets_snapshot() -> Result<(), KvError> {
        let mut groups = cluster(1);
        groups.get_mut(&1).unwrap().campaign()?;
        deliver(&mut groups, None);
        let (index, _) = groups.get_mut(&1).unwrap().propose(b"x".to_vec())?;
        deliver(&mut groups, None);
        groups.insert(2, RaftGroup::new(2, vec![1, 2], 2, HardState::default(), 0, 0, vec![]));
        groups.get_mut(&1).unwrap().set_peers(vec![1, 2]);
        let readies = deliver(&mut groups, None);
        assert!(readies.iter().any(|(id, rd)| *id == 1 && rd.needs_snapshot.contains(&2)));
        let leader = groups.get_mut(&1).unwrap();
        assert_eq!(leader.progress(2).map(|p| p.state), Some(ProgressState::Snapshot));
        leader.send_snapshot(2, index, b"state".to_vec())?;
        let readies = deliver(&mut groups, None);
        assert!(readies
            .iter()
            .any(|(id, rd)| *id == 2 && rd.snapshot.as_ref().map(|s| s.index) == Some(index)));
        assert_eq!(groups[&1].progress(2).map(|p| p.state), Some(ProgressState::Replicate));
        assert_eq!(groups[&2].commit_index(), index);
        Ok(())
    }

    #[test]
    fn compaction() -> Result<(), KvError> {
        let mut groups = cluster(1);
        let g = groups.get_mut(&1).unwrap();
        g.campaign()?;
        for i in 0..5u8 {
            g.propose(vec![i])?;
        }
        g.ready();
        let last = g.last_index();
        assert!(g.compact(last - 1).is_some());
        assert_eq!(g.first_index(), last);
        assert!(g.compact(last + 1).is_none());
        Ok(())
    }
}

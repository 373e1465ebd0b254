//! Cluster Membership Set
//!
//! The observer's view of an election: one optional leader plus followers
//! keyed by election key. The leader never appears among the followers.
//! Every mutation bumps a version; the set is dirty while that version is
//! ahead of the last published one.

use std::collections::HashMap;

use crate::node::NodeSpec;

/// Leader and followers of one election
#[derive(Debug, Default)]
pub struct MembershipSet {
    /// Current leader
    leader: Option<NodeSpec>,
    /// Followers by election key
    followers: HashMap<String, NodeSpec>,
    /// Bumped on every change
    version: u64,
    /// Version of the last successful publish
    published: u64,
}

/// Point-in-time copy handed to the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipSnapshot {
    /// Version this snapshot was taken at
    pub version: u64,
    /// Leader, if known
    pub leader: Option<NodeSpec>,
    /// Followers ordered by election key
    pub followers: Vec<NodeSpec>,
}

/// Counters describing a membership set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipSummary {
    /// Name of the leader
    pub leader: Option<String>,
    /// Number of followers
    pub followers: usize,
    /// Current version
    pub version: u64,
    /// Last published version
    pub published: u64,
}

impl MembershipSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    fn is_leader_key(&self, key: &str) -> bool {
        self.leader
            .as_ref()
            .map(|l| l.election_key == key)
            .unwrap_or(false)
    }

    /// Install a new leader, removing it from the followers
    pub fn set_leader(&mut self, leader: NodeSpec) {
        self.followers.remove(&leader.election_key);
        self.leader = Some(leader);
        self.touch();
    }

    /// Insert or replace a follower. Ignored for the leader's own key.
    pub fn put(&mut self, spec: NodeSpec) {
        if !self.is_leader_key(&spec.election_key) {
            self.followers.insert(spec.election_key.clone(), spec);
        }
        self.touch();
    }

    /// Remove `key` from whichever side holds it
    pub fn delete(&mut self, key: &str) {
        if self.is_leader_key(key) {
            self.leader = None;
        } else {
            self.followers.remove(key);
        }
        self.touch();
    }

    /// Replace every follower with `specs`. The leader is kept only while
    /// `specs` still holds its key.
    pub fn replace_followers<I>(&mut self, specs: I)
    where
        I: IntoIterator<Item = NodeSpec>,
    {
        self.followers.clear();
        let mut leader_present = false;
        for spec in specs {
            if self.is_leader_key(&spec.election_key) {
                leader_present = true;
            } else {
                self.followers.insert(spec.election_key.clone(), spec);
            }
        }
        if !leader_present {
            self.leader = None;
        }
        self.touch();
    }

    /// Current leader
    pub fn leader(&self) -> Option<&NodeSpec> {
        self.leader.as_ref()
    }

    /// Check whether `key` is a follower
    pub fn is_follower(&self, key: &str) -> bool {
        self.followers.contains_key(key)
    }

    /// Followers ordered by election key
    pub fn followers(&self) -> Vec<NodeSpec> {
        let mut followers: Vec<NodeSpec> = self.followers.values().cloned().collect();
        followers.sort_by(|a, b| a.election_key.cmp(&b.election_key));
        followers
    }

    /// Check whether changes are waiting to be published
    pub fn is_dirty(&self) -> bool {
        self.version != self.published
    }

    /// Snapshot to publish, if anything changed since the last publish
    pub fn pending(&self) -> Option<MembershipSnapshot> {
        if !self.is_dirty() {
            return None;
        }
        Some(MembershipSnapshot {
            version: self.version,
            leader: self.leader.clone(),
            followers: self.followers(),
        })
    }

    /// Record a successful publish of the snapshot taken at `version`
    pub fn mark_published(&mut self, version: u64) {
        if version > self.published {
            self.published = version;
        }
    }

    /// Summary counters
    pub fn summary(&self) -> MembershipSummary {
        MembershipSummary {
            leader: self.leader.as_ref().map(|l| l.name.clone()),
            followers: self.followers.len(),
            version: self.version,
            published: self.published,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(key: &str, name: &str) -> NodeSpec {
        NodeSpec::new(name, "10.0.0.1", 5432).with_election_key(key)
    }

    #[test]
    fn test_puts_then_delete() {
        let mut set = MembershipSet::new();
        set.put(spec("k1", "a"));
        set.put(spec("k2", "b"));
        set.put(spec("k3", "c"));
        set.delete("k2");

        let followers = set.followers();
        assert_eq!(followers, vec![spec("k1", "a"), spec("k3", "c")]);
        assert!(set.leader().is_none());
    }

    #[test]
    fn test_leader_leaves_followers() {
        let mut set = MembershipSet::new();
        set.put(spec("k1", "a"));
        set.put(spec("k2", "b"));

        set.set_leader(spec("k1", "a"));
        assert!(!set.is_follower("k1"));
        assert_eq!(set.followers().len(), 1);

        // Puts for the leader key only change the leader via the leader stream.
        set.put(spec("k1", "a-renamed"));
        assert!(!set.is_follower("k1"));
        assert_eq!(set.leader().unwrap().name, "a");
    }

    #[test]
    fn test_delete_leader_clears_it() {
        let mut set = MembershipSet::new();
        set.set_leader(spec("k1", "a"));
        set.put(spec("k2", "b"));

        set.delete("k1");
        assert!(set.leader().is_none());
        assert!(set.is_follower("k2"));
    }

    #[test]
    fn test_replace_followers_skips_leader() {
        let mut set = MembershipSet::new();
        set.set_leader(spec("k1", "a"));
        set.put(spec("k9", "gone"));

        set.replace_followers(vec![spec("k1", "a"), spec("k2", "b")]);
        assert_eq!(set.followers(), vec![spec("k2", "b")]);
        assert_eq!(set.leader().unwrap().election_key, "k1");
    }

    #[test]
    fn test_replace_followers_drops_absent_leader() {
        let mut set = MembershipSet::new();
        set.set_leader(spec("k1", "a"));
        set.put(spec("k2", "b"));

        set.replace_followers(vec![spec("k2", "b")]);
        assert!(set.leader().is_none());
        assert_eq!(set.followers(), vec![spec("k2", "b")]);

        set.set_leader(spec("k2", "b"));
        set.replace_followers(Vec::new());
        assert!(set.leader().is_none());
        assert!(set.followers().is_empty());
    }

    #[test]
    fn test_publish_bookkeeping() {
        let mut set = MembershipSet::new();
        assert!(set.pending().is_none());

        set.put(spec("k1", "a"));
        set.put(spec("k2", "b"));
        let snapshot = set.pending().unwrap();
        assert_eq!(snapshot.followers.len(), 2);

        // A change landing while the snapshot is being published stays pending.
        set.put(spec("k3", "c"));
        set.mark_published(snapshot.version);
        assert!(set.is_dirty());

        let next = set.pending().unwrap();
        set.mark_published(next.version);
        assert!(!set.is_dirty());

        // Out of order acknowledgements never move the marker back.
        set.mark_published(snapshot.version);
        assert!(!set.is_dirty());

        let summary = set.summary();
        assert_eq!(summary.followers, 3);
        assert_eq!(summary.version, summary.published);
    }

    #[test]
    fn test_leader_and_followers_stay_disjoint() {
        let mut set = MembershipSet::new();
        let events: Vec<Box<dyn Fn(&mut MembershipSet)>> = vec![
            Box::new(|s| s.put(spec("k1", "a"))),
            Box::new(|s| s.set_leader(spec("k1", "a"))),
            Box::new(|s| s.put(spec("k2", "b"))),
            Box::new(|s| s.put(spec("k1", "a"))),
            Box::new(|s| s.set_leader(spec("k2", "b"))),
            Box::new(|s| s.put(spec("k1", "a"))),
            Box::new(|s| s.delete("k2")),
            Box::new(|s| s.put(spec("k2", "b"))),
        ];

        for event in events {
            event(&mut set);
            if let Some(leader) = set.leader() {
                assert!(!set.is_follower(&leader.election_key));
            }
        }
    }
}

//! The address selector: ordered iteration over cluster members with a leader preference.

/// The iteration state of a selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorState {
    /// The iterator has been reset and not yet started.
    Reset,
    /// The iterator is part way through the address list.
    Iterate,
    /// Every address has been tried once since the last reset.
    Complete,
}

/// An ordered iterator over cluster member addresses.
///
/// The last known leader, when present, is always yielded first; the remaining members follow in
/// a stable order. One full pass exhausts the selector until it is reset, which is how the
/// connection layer knows it has tried the whole cluster.
#[derive(Debug)]
pub struct AddressSelector {
    /// The address of the last known cluster leader.
    leader: Option<String>,
    /// The addresses of all known members.
    members: Vec<String>,
    /// The iteration order for the current pass.
    sequence: Vec<String>,
    /// The position of the next address to yield.
    index: usize,
    state: SelectorState,
}

impl AddressSelector {
    /// Create a new selector over the given member addresses.
    pub fn new(members: Vec<String>) -> Self {
        let mut this = Self {
            leader: None,
            members,
            sequence: Vec::new(),
            index: 0,
            state: SelectorState::Reset,
        };
        this.rebuild();
        this
    }

    /// The selector's current iteration state.
    pub fn state(&self) -> SelectorState {
        self.state
    }

    /// The address of the last known leader, if any.
    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    /// The number of distinct addresses the selector will yield in one pass.
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Restart iteration from the current leader hint and membership.
    pub fn reset(&mut self) {
        self.index = 0;
        self.state = SelectorState::Reset;
        self.rebuild();
    }

    /// Update the leader hint and membership, and restart iteration.
    ///
    /// An empty member list keeps the previous membership; a cluster never shrinks to nothing
    /// from the client's point of view.
    pub fn reset_with(&mut self, leader: Option<String>, members: Vec<String>) {
        self.leader = leader;
        if !members.is_empty() {
            self.members = members;
        }
        self.reset();
    }

    /// Check if any addresses remain in the current pass.
    pub fn has_next(&self) -> bool {
        self.index < self.sequence.len()
    }

    /// Yield the next address of the current pass.
    pub fn next(&mut self) -> Option<String> {
        if self.index >= self.sequence.len() {
            self.state = SelectorState::Complete;
            return None;
        }
        let address = self.sequence[self.index].clone();
        self.index += 1;
        self.state = if self.index >= self.sequence.len() {
            SelectorState::Complete
        } else {
            SelectorState::Iterate
        };
        Some(address)
    }

    /// Rebuild the iteration order: leader first, then the remaining members in stable order.
    fn rebuild(&mut self) {
        self.sequence.clear();
        if let Some(leader) = &self.leader {
            self.sequence.push(leader.clone());
        }
        for member in self.members.iter() {
            if Some(member.as_str()) != self.leader.as_deref() {
                self.sequence.push(member.clone());
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn members() -> Vec<String> {
        vec!["a:1".into(), "b:2".into(), "c:3".into()]
    }

    #[test]
    fn test_yields_members_in_stable_order() {
        let mut sel = AddressSelector::new(members());
        assert_eq!(sel.state(), SelectorState::Reset);
        assert_eq!(sel.next().as_deref(), Some("a:1"));
        assert_eq!(sel.state(), SelectorState::Iterate);
        assert_eq!(sel.next().as_deref(), Some("b:2"));
        assert_eq!(sel.next().as_deref(), Some("c:3"));
        assert_eq!(sel.state(), SelectorState::Complete);
        assert!(!sel.has_next());
        assert_eq!(sel.next(), None);
    }

    #[test]
    fn test_leader_is_yielded_first_without_duplication() {
        let mut sel = AddressSelector::new(members());
        sel.reset_with(Some("b:2".into()), vec![]);
        assert_eq!(sel.next().as_deref(), Some("b:2"));
        assert_eq!(sel.next().as_deref(), Some("a:1"));
        assert_eq!(sel.next().as_deref(), Some("c:3"));
        assert_eq!(sel.next(), None);
    }

    #[test]
    fn test_reset_restarts_the_pass() {
        let mut sel = AddressSelector::new(members());
        sel.next();
        sel.next();
        sel.reset();
        assert_eq!(sel.state(), SelectorState::Reset);
        assert_eq!(sel.next().as_deref(), Some("a:1"));
    }

    #[test]
    fn test_reset_with_updates_membership() {
        let mut sel = AddressSelector::new(members());
        sel.reset_with(Some("d:4".into()), vec!["d:4".into(), "e:5".into()]);
        assert_eq!(sel.len(), 2);
        assert_eq!(sel.next().as_deref(), Some("d:4"));
        assert_eq!(sel.next().as_deref(), Some("e:5"));
        assert_eq!(sel.next(), None);
    }

    #[test]
    fn test_empty_membership_update_is_ignored() {
        let mut sel = AddressSelector::new(members());
        sel.reset_with(None, vec![]);
        assert_eq!(sel.len(), 3);
    }
}

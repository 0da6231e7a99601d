//! Registry of live links keyed by remote participant
//!
//! The registry is the only place links are stored. It enforces one link per
//! remote user and validates every state transition; callers outside the
//! mesh never see it.

use crate::identity::UserId;
use crate::link::LinkHandle;
use crate::media::MediaStream;
use crate::signaling::IceCandidate;
use crate::types::{LinkRole, LinkState};
use std::collections::HashMap;
use std::time::Instant;

/// Book-keeping for one link
pub(crate) struct LinkEntry {
    pub(crate) handle: LinkHandle,
    /// Matches the id carried by this link's notifications
    pub(crate) link_id: u64,
    pub(crate) role: LinkRole,
    pub(crate) state: LinkState,
    /// Set once our offer/answer has been published; local candidates are
    /// held back until then
    pub(crate) local_description_sent: bool,
    pub(crate) pending_local_candidates: Vec<IceCandidate>,
    /// Set once the remote offer/answer has been applied; remote candidates
    /// are held back until then
    pub(crate) remote_description_set: bool,
    pub(crate) pending_remote_candidates: Vec<IceCandidate>,
    /// Our offer won a glare race; candidates from the remote's abandoned
    /// offer are dropped until its answer arrives
    pub(crate) glare_won: bool,
    pub(crate) remote_stream: Option<MediaStream>,
    pub(crate) created_at: Instant,
}

impl LinkEntry {
    pub(crate) fn new(handle: LinkHandle, link_id: u64, role: LinkRole) -> Self {
        Self {
            handle,
            link_id,
            role,
            state: LinkState::New,
            local_description_sent: false,
            pending_local_candidates: Vec::new(),
            remote_description_set: false,
            pending_remote_candidates: Vec::new(),
            glare_won: false,
            remote_stream: None,
            created_at: Instant::now(),
        }
    }
}

/// Rejected state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionError {
    UnknownLink,
    Invalid { from: LinkState, to: LinkState },
}

#[derive(Default)]
pub(crate) struct LinkRegistry {
    entries: HashMap<UserId, LinkEntry>,
}

impl LinkRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store a link, returning the one it displaced
    pub(crate) fn insert(&mut self, user: UserId, entry: LinkEntry) -> Option<LinkEntry> {
        self.entries.insert(user, entry)
    }

    pub(crate) fn get(&self, user: &UserId) -> Option<&LinkEntry> {
        self.entries.get(user)
    }

    pub(crate) fn get_mut(&mut self, user: &UserId) -> Option<&mut LinkEntry> {
        self.entries.get_mut(user)
    }

    pub(crate) fn remove(&mut self, user: &UserId) -> Option<LinkEntry> {
        self.entries.remove(user)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, user: &UserId) -> bool {
        self.entries.contains_key(user)
    }

    pub(crate) fn state(&self, user: &UserId) -> Option<LinkState> {
        self.entries.get(user).map(|e| e.state)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Move a link to a new state, returning the previous one
    pub(crate) fn transition(
        &mut self,
        user: &UserId,
        to: LinkState,
    ) -> Result<LinkState, TransitionError> {
        let entry = self
            .entries
            .get_mut(user)
            .ok_or(TransitionError::UnknownLink)?;
        let from = entry.state;
        if !from.can_transition_to(to) {
            return Err(TransitionError::Invalid { from, to });
        }
        entry.state = to;
        Ok(from)
    }

    /// Handles of links that have not reached a terminal state
    pub(crate) fn live_handles(&self) -> Vec<LinkHandle> {
        self.entries
            .values()
            .filter(|e| !e.state.is_terminal())
            .map(|e| e.handle.clone())
            .collect()
    }

    pub(crate) fn handle(&self, user: &UserId) -> Option<LinkHandle> {
        self.entries.get(user).map(|e| e.handle.clone())
    }

    /// Every link handle, sorted by user
    pub(crate) fn handles(&self) -> Vec<(UserId, LinkHandle)> {
        let mut handles: Vec<_> = self
            .entries
            .iter()
            .map(|(user, e)| (user.clone(), e.handle.clone()))
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        handles
    }

    pub(crate) fn remote_streams(&self) -> Vec<(UserId, MediaStream)> {
        let mut streams: Vec<_> = self
            .entries
            .iter()
            .filter_map(|(user, e)| e.remote_stream.clone().map(|s| (user.clone(), s)))
            .collect();
        streams.sort_by(|a, b| a.0.cmp(&b.0));
        streams
    }

    /// Take every entry out of the registry
    pub(crate) fn drain(&mut self) -> Vec<(UserId, LinkEntry)> {
        self.entries.drain().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::link::{LinkError, LinkStats, PeerLink};
    use crate::media::{MediaTrack, TrackKind};
    use crate::signaling::SessionDescription;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NullLink(UserId);

    #[async_trait]
    impl PeerLink for NullLink {
        fn remote_user(&self) -> &UserId {
            &self.0
        }
        async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
            Ok(SessionDescription::offer(""))
        }
        async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
            Ok(SessionDescription::answer(""))
        }
        async fn set_remote_description(&self, _: SessionDescription) -> Result<(), LinkError> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _: IceCandidate) -> Result<(), LinkError> {
            Ok(())
        }
        async fn replace_outbound_track(
            &self,
            _: &MediaTrack,
        ) -> Result<Option<MediaTrack>, LinkError> {
            Ok(None)
        }
        async fn outbound_track(&self, _: TrackKind) -> Option<MediaTrack> {
            None
        }
        async fn stats(&self) -> Result<LinkStats, LinkError> {
            Ok(LinkStats::default())
        }
        async fn close(&self) -> Result<(), LinkError> {
            Ok(())
        }
    }

    fn entry(user: &str, role: LinkRole) -> LinkEntry {
        LinkEntry::new(Arc::new(NullLink(UserId::new(user))), 1, role)
    }

    #[test]
    fn test_insert_displaces_existing_link() {
        let mut reg = LinkRegistry::new();
        let bob = UserId::new("bob");
        assert!(reg.insert(bob.clone(), entry("bob", LinkRole::Offerer)).is_none());
        let old = reg.insert(bob.clone(), entry("bob", LinkRole::Answerer));
        assert_eq!(old.map(|e| e.role), Some(LinkRole::Offerer));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_transition_validation() {
        let mut reg = LinkRegistry::new();
        let bob = UserId::new("bob");
        reg.insert(bob.clone(), entry("bob", LinkRole::Offerer));

        assert_eq!(reg.transition(&bob, LinkState::OfferSent), Ok(LinkState::New));
        assert_eq!(
            reg.transition(&bob, LinkState::AnswerSent),
            Err(TransitionError::Invalid {
                from: LinkState::OfferSent,
                to: LinkState::AnswerSent
            })
        );
        assert_eq!(
            reg.transition(&UserId::new("carol"), LinkState::Closed),
            Err(TransitionError::UnknownLink)
        );
    }

    #[test]
    fn test_live_handles_skip_terminal_links() {
        let mut reg = LinkRegistry::new();
        reg.insert(UserId::new("bob"), entry("bob", LinkRole::Offerer));
        reg.insert(UserId::new("carol"), entry("carol", LinkRole::Offerer));
        reg.transition(&UserId::new("carol"), LinkState::Failed).unwrap();

        let live = reg.live_handles();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].remote_user(), &UserId::new("bob"));
    }

    #[test]
    fn test_remote_streams_sorted_by_user() {
        let mut reg = LinkRegistry::new();
        for user in ["dave", "bob"] {
            let mut e = entry(user, LinkRole::Answerer);
            e.remote_stream = Some(MediaStream::new(format!("{user}-stream")));
            reg.insert(UserId::new(user), e);
        }
        reg.insert(UserId::new("carol"), entry("carol", LinkRole::Answerer));

        let streams = reg.remote_streams();
        let users: Vec<_> = streams.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(users, vec!["bob", "dave"]);
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut reg = LinkRegistry::new();
        reg.insert(UserId::new("bob"), entry("bob", LinkRole::Offerer));
        assert_eq!(reg.drain().len(), 1);
        assert_eq!(reg.len(), 0);
        assert!(!reg.contains(&UserId::new("bob")));
    }
}

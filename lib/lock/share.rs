//! Open share reservations.
//!
//! Only the conflict check lives here; the open-state machinery belongs to the protocol layer.

use std::sync::Arc;

use bitflags::bitflags;

use super::{LockOwner, OwnerMatcher};

bitflags! {
    /// Access an opener asks for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShareAccess: u8 {
        /// Read access.
        const READ = 0b01;
        /// Write access.
        const WRITE = 0b10;
    }
}

bitflags! {
    /// Access an opener denies to everybody else.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShareDeny: u8 {
        /// Deny readers.
        const READ = 0b01;
        /// Deny writers.
        const WRITE = 0b10;
    }
}

/// One open's share reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareReservation {
    /// The opener.
    pub owner: Arc<LockOwner>,
    /// Access granted to the opener.
    pub access: ShareAccess,
    /// Access denied to others.
    pub deny: ShareDeny,
}

impl ShareReservation {
    fn clashes(&self, access: ShareAccess, deny: ShareDeny) -> bool {
        self.deny.bits() & access.bits() != 0 || deny.bits() & self.access.bits() != 0
    }
}

/// Share reservations of one regular file.
#[derive(Debug, Default)]
pub struct ShareTable {
    reservations: Vec<ShareReservation>,
}

impl ShareTable {
    /// First reservation of another owner that the requested access/deny pair clashes with.
    #[must_use]
    pub fn conflict(
        &self,
        matcher: &dyn OwnerMatcher,
        owner: &LockOwner,
        access: ShareAccess,
        deny: ShareDeny,
    ) -> Option<&ShareReservation> {
        self.reservations
            .iter()
            .find(|r| !matcher.same_owner(&r.owner, owner) && r.clashes(access, deny))
    }

    pub(crate) fn add(&mut self, reservation: ShareReservation) {
        self.reservations.push(reservation);
    }

    pub(crate) fn remove(&mut self, matcher: &dyn OwnerMatcher, owner: &LockOwner) -> usize {
        let before = self.reservations.len();
        self.reservations
            .retain(|r| !matcher.same_owner(&r.owner, owner));
        before - self.reservations.len()
    }

    /// Whether any reservation is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }

    /// Number of reservations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reservations.len()
    }
}

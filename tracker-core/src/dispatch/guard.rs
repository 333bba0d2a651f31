//! Pairing and guest-mode gate in front of the command tables.

use super::{Command, ErrorCode};

/// What the guard decided for one command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Admit,
    /// Answer with the error code and do not run the command.
    Deny(ErrorCode),
    /// Drop the command without a reply.
    Ignore,
}

/// Per-link access state.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AccessGuard {
    /// A pairing code is stored, so the central must verify it.
    pub pairing_required: bool,
    /// The central presented the stored code on this link.
    pub verified: bool,
    /// The central entered guest mode on this link.
    pub guest: bool,
}

impl AccessGuard {
    #[must_use]
    pub const fn new(pairing_required: bool) -> Self {
        Self {
            pairing_required,
            verified: false,
            guest: false,
        }
    }

    pub fn check(&self, command: Command) -> Access {
        if self.guest {
            return if command.is_privileged() {
                Access::Ignore
            } else {
                Access::Admit
            };
        }
        if self.pairing_required && !self.verified && !command.allowed_unverified() {
            return Access::Deny(ErrorCode::AccessDenied);
        }
        Access::Admit
    }

    /// Forgets everything granted on the previous link.
    pub fn reset_link(&mut self, pairing_required: bool) {
        *self = Self::new(pairing_required);
    }

    pub fn mark_verified(&mut self) {
        self.verified = true;
        self.guest = false;
    }

    pub fn enter_guest(&mut self) {
        if !self.verified {
            self.guest = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpaired_device_admits_everything() {
        let guard = AccessGuard::new(false);
        assert_eq!(guard.check(Command::SetPlayerProfile), Access::Admit);
        assert_eq!(guard.check(Command::ClearPairingCode), Access::Admit);
    }

    #[test]
    fn unverified_link_only_reaches_the_handshake() {
        let guard = AccessGuard::new(true);
        assert_eq!(guard.check(Command::GetStatus), Access::Admit);
        assert_eq!(guard.check(Command::VerifyPairingCode), Access::Admit);
        assert_eq!(guard.check(Command::EnterGuestMode), Access::Admit);
        assert_eq!(
            guard.check(Command::GetActivity),
            Access::Deny(ErrorCode::AccessDenied)
        );
    }

    #[test]
    fn guest_mutations_are_dropped_silently() {
        let mut guard = AccessGuard::new(true);
        guard.enter_guest();
        assert_eq!(guard.check(Command::GetActivity), Access::Admit);
        assert_eq!(guard.check(Command::SetPlayerProfile), Access::Ignore);
        assert_eq!(guard.check(Command::SetPairingCode), Access::Ignore);
    }

    #[test]
    fn verification_ends_guest_mode() {
        let mut guard = AccessGuard::new(true);
        guard.enter_guest();
        guard.mark_verified();
        assert_eq!(guard.check(Command::SetPlayerProfile), Access::Admit);
        guard.reset_link(true);
        assert!(!guard.verified);
    }
}

//! Capability checks performed before dispatching operator commands.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Start a run.
    Execute,
    /// Pause, resume, stop, edit breakpoints.
    Control,
    ReadHistory,
    DeleteHistory,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Permission::Execute => "execute",
            Permission::Control => "control",
            Permission::ReadHistory => "read-history",
            Permission::DeleteHistory => "delete-history",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("session is not authenticated")]
    NotAuthenticated,
    #[error("permission '{0}' denied")]
    Denied(Permission),
}

/// Who is issuing commands.
pub trait Session: Send + Sync {
    fn is_authenticated(&self) -> bool;
    fn has_permission(&self, permission: Permission) -> bool;
}

/// The local operator at the bench: authenticated, allowed everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSession;

impl Session for LocalSession {
    fn is_authenticated(&self) -> bool {
        true
    }

    fn has_permission(&self, _permission: Permission) -> bool {
        true
    }
}

/// A viewer that may browse history and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnlySession;

impl Session for ReadOnlySession {
    fn is_authenticated(&self) -> bool {
        true
    }

    fn has_permission(&self, permission: Permission) -> bool {
        permission == Permission::ReadHistory
    }
}

pub fn authorize(session: &dyn Session, permission: Permission) -> Result<(), AccessError> {
    if !session.is_authenticated() {
        return Err(AccessError::NotAuthenticated);
    }
    if !session.has_permission(permission) {
        return Err(AccessError::Denied(permission));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Anonymous;

    impl Session for Anonymous {
        fn is_authenticated(&self) -> bool {
            false
        }
        fn has_permission(&self, _permission: Permission) -> bool {
            true
        }
    }

    #[test]
    fn test_local_session_allows_everything() {
        for p in [
            Permission::Execute,
            Permission::Control,
            Permission::ReadHistory,
            Permission::DeleteHistory,
        ] {
            assert!(authorize(&LocalSession, p).is_ok());
        }
    }

    #[test]
    fn test_read_only_session() {
        assert!(authorize(&ReadOnlySession, Permission::ReadHistory).is_ok());
        assert_eq!(
            authorize(&ReadOnlySession, Permission::Execute),
            Err(AccessError::Denied(Permission::Execute))
        );
    }

    #[test]
    fn test_unauthenticated_rejected_first() {
        assert_eq!(
            authorize(&Anonymous, Permission::ReadHistory),
            Err(AccessError::NotAuthenticated)
        );
    }
}

#![forbid(unsafe_code)]

// Seams to the rest of the course platform. The media-routing core calls
// these collaborators; it never persists anything itself.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Role of a peer within a lecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
    Admin,
}

impl Role {
    /// Teachers and admins may open rooms and end lectures.
    pub fn can_manage_lecture(&self) -> bool {
        matches!(self, Role::Teacher | Role::Admin)
    }
}

/// Authorization outcome for a join/create attempt
#[derive(Debug, Clone)]
pub struct AccessDenied {
    pub reason: String,
}

/// Checks whether a user may enter a lecture and with which role.
/// Called on create-room and join-room.
pub trait AccessControl: Send + Sync {
    fn authorize(
        &self,
        user_id: &str,
        lecture_id: &str,
        requested: Role,
    ) -> Result<Role, AccessDenied>;
}

/// Persists lecture progression (NOT_STARTED -> STARTED -> COMPLETED).
/// The core calls it on room ACTIVE and ENDED transitions.
pub trait LectureLifecycle: Send + Sync {
    fn lecture_started(&self, lecture_id: &str);
    fn lecture_completed(&self, lecture_id: &str);
}

/// Receives fire-and-forget join/leave timestamps per peer.
/// Never on the core's critical path; implementations must not block.
pub trait AttendanceSink: Send + Sync {
    fn peer_joined(&self, lecture_id: &str, user_id: &str, at: SystemTime);
    fn peer_left(&self, lecture_id: &str, user_id: &str, at: SystemTime);
}

/// Bundle of platform collaborators handed to the room manager.
#[derive(Clone)]
pub struct Collaborators {
    pub access: Arc<dyn AccessControl>,
    pub lifecycle: Arc<dyn LectureLifecycle>,
    pub attendance: Arc<dyn AttendanceSink>,
}

impl Collaborators {
    /// Standalone defaults: grant the requested role and log transitions.
    /// The deployed platform wires its own implementations here.
    pub fn permissive() -> Self {
        let stub = Arc::new(Permissive);
        Self {
            access: stub.clone(),
            lifecycle: stub.clone(),
            attendance: stub,
        }
    }
}

struct Permissive;

impl AccessControl for Permissive {
    fn authorize(
        &self,
        user_id: &str,
        lecture_id: &str,
        requested: Role,
    ) -> Result<Role, AccessDenied> {
        debug!("Granting {:?} access to {} for lecture {}", requested, user_id, lecture_id);
        Ok(requested)
    }
}

impl LectureLifecycle for Permissive {
    fn lecture_started(&self, lecture_id: &str) {
        debug!("Lecture {} started", lecture_id);
    }

    fn lecture_completed(&self, lecture_id: &str) {
        debug!("Lecture {} completed", lecture_id);
    }
}

impl AttendanceSink for Permissive {
    fn peer_joined(&self, lecture_id: &str, user_id: &str, _at: SystemTime) {
        debug!("Attendance: {} joined lecture {}", user_id, lecture_id);
    }

    fn peer_left(&self, lecture_id: &str, user_id: &str, _at: SystemTime) {
        debug!("Attendance: {} left lecture {}", user_id, lecture_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lecture_management_requires_teacher_or_admin() {
        assert!(Role::Teacher.can_manage_lecture());
        assert!(Role::Admin.can_manage_lecture());
        assert!(!Role::Student.can_manage_lecture());
    }

    #[test]
    fn permissive_access_echoes_requested_role() {
        let collaborators = Collaborators::permissive();
        let role = collaborators
            .access
            .authorize("u1", "lecture-1", Role::Student)
            .unwrap();
        assert_eq!(role, Role::Student);
    }
}

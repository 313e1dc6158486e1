use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Teacher,
    Student,
}

impl Role {
    pub fn is_staff(&self) -> bool {
        !matches!(self, Role::Student)
    }

    /// Admins and managers act on any teacher's lessons within their school.
    pub fn is_school_wide(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Manager => write!(f, "manager"),
            Role::Teacher => write!(f, "teacher"),
            Role::Student => write!(f, "student"),
        }
    }
}

/// The authenticated caller of a scheduling operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Uuid,
    pub school_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Uuid, school_id: Uuid, role: Role) -> Self {
        Self { user_id, school_id, role }
    }

    pub fn is_staff(&self) -> bool {
        self.role.is_staff()
    }
}

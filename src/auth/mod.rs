/*!
 * # Actor Identity
 *
 * Every mutating procurement call carries the identity of whoever asked for it. Whether
 * that actor is *allowed* to ask is decided by the calling service layer before the call
 * reaches this crate; here the actor is only recorded on rows, events and audit records.
 */

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Procurement roles as seen by audit consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActorRole {
    Requester,
    Buyer,
    Approver,
    Receiver,
    /// Supplier-side user recording a response on the supplier's behalf.
    Supplier,
    /// Automated jobs.
    System,
}

/// Identity of the caller of a mutating operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub name: String,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(id: Uuid, name: impl Into<String>, role: ActorRole) -> Self {
        Self {
            id,
            name: name.into(),
            role,
        }
    }

    /// The identity used for automated reconciliation jobs.
    pub fn system() -> Self {
        Self {
            id: Uuid::nil(),
            name: "system".to_string(),
            role: ActorRole::System,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_render_in_snake_case() {
        assert_eq!(ActorRole::Buyer.to_string(), "buyer");
        assert_eq!(
            serde_json::to_string(&ActorRole::Receiver).unwrap(),
            "\"receiver\""
        );
    }

    #[test]
    fn system_actor_has_nil_id() {
        let actor = Actor::system();
        assert!(actor.id.is_nil());
        assert_eq!(actor.role, ActorRole::System);
    }
}

use std::collections::HashMap;

use chrono::Utc;
use log::info;

use crate::error::ChatError;
use crate::{Identity, IdentityOrigin, Presence, UserId};

/// In-memory identity registry: display name (+ optional durable account id)
/// to identity, with presence. The registry is the only writer of
/// status/last_seen; the store keeps a durable copy so ids survive restarts.
pub struct IdentityRegistry {
    pub identities: HashMap<UserId, Identity>,
    /// account_id -> identity id, for idempotent re-login.
    accounts: HashMap<String, UserId>,
}

impl IdentityRegistry {
    pub fn new(known: Vec<Identity>) -> Self {
        let mut accounts = HashMap::new();
        let mut identities = HashMap::new();
        for mut identity in known {
            // Nobody is online before their channel opens.
            identity.status = Presence::Offline;
            if let IdentityOrigin::AccountBound { account_id } = &identity.origin {
                accounts.insert(account_id.clone(), identity.id.clone());
            }
            identities.insert(identity.id.clone(), identity);
        }
        Self {
            identities,
            accounts,
        }
    }

    /// Register a display name, minting a fresh ephemeral id unless the
    /// account id is already known (re-login reuses the existing identity).
    pub fn register(
        &mut self,
        display_name: &str,
        account_id: Option<String>,
    ) -> Result<Identity, ChatError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(ChatError::InvalidName);
        }

        if let Some(account_id) = account_id {
            if let Some(existing_id) = self.accounts.get(&account_id).cloned() {
                // Known account: keep the id stable, refresh the name.
                let identity = self
                    .identities
                    .get_mut(&existing_id)
                    .ok_or_else(|| ChatError::NotFound(format!("identity {}", existing_id)))?;
                identity.display_name = display_name.to_string();
                identity.last_seen = Utc::now();
                return Ok(identity.clone());
            }

            let identity = Identity {
                id: uuid::Uuid::new_v4().to_string(),
                display_name: display_name.to_string(),
                origin: IdentityOrigin::AccountBound {
                    account_id: account_id.clone(),
                },
                status: Presence::Offline,
                last_seen: Utc::now(),
            };
            self.accounts.insert(account_id, identity.id.clone());
            self.identities.insert(identity.id.clone(), identity.clone());
            info!("Registered account-bound identity {}", identity.id);
            return Ok(identity);
        }

        let identity = Identity {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
            origin: IdentityOrigin::Ephemeral,
            status: Presence::Offline,
            last_seen: Utc::now(),
        };
        self.identities.insert(identity.id.clone(), identity.clone());
        info!("Registered ephemeral identity {}", identity.id);
        Ok(identity)
    }

    /// Update presence and last_seen. Returns the updated identity, or None
    /// if the id is unknown.
    pub fn set_status(&mut self, user_id: &UserId, status: Presence) -> Option<Identity> {
        let identity = self.identities.get_mut(user_id)?;
        identity.status = status;
        identity.last_seen = Utc::now();
        Some(identity.clone())
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.identities.contains_key(user_id)
    }

    pub fn get(&self, user_id: &UserId) -> Option<&Identity> {
        self.identities.get(user_id)
    }

    /// Snapshot of all identities, optionally excluding the caller. Taken
    /// under one lock so no identity is skipped or duplicated mid-call.
    pub fn snapshot(&self, exclude: Option<&UserId>) -> Vec<Identity> {
        self.identities
            .values()
            .filter(|i| exclude.map_or(true, |ex| &i.id != ex))
            .cloned()
            .collect()
    }
}

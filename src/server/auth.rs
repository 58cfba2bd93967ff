//! Authorization policy: users, groups, ACL masks and the requirements a
//! location places on the authenticated user.
//!
//! Password checking is delegated to a [`CredentialStore`]. Without an
//! external store the policy's own user table is used.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::AuthConfig;
use crate::error::ConfigError;

/// Access control bit mask.
pub type Acl = u64;

pub const ACL_ALL: Acl = Acl::MAX;

/// Parses a hex ACL mask. An empty string is the empty mask.
pub fn parse_acl(s: &str) -> Result<Acl, ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    if s == "-1" || s.eq_ignore_ascii_case("all") {
        return Ok(ACL_ALL);
    }
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    Acl::from_str_radix(digits, 16).map_err(|_| ConfigError::InvalidAcl(s.to_string()))
}

/// Validates a user's password.
pub trait CredentialStore: Send + Sync {
    fn validate(&self, realm: &str, user: &str, password: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub password: String,
    pub enabled: bool,
    /// Union of the ACLs of the enabled groups the user belongs to.
    pub acl: Acl,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub acl: Acl,
    pub enabled: bool,
    pub users: Vec<String>,
}

#[derive(Default)]
pub struct Auth {
    pub realm: String,
    users: HashMap<String, User>,
    groups: HashMap<String, Group>,
    pub required_users: Vec<String>,
    pub required_groups: Vec<String>,
    /// Any authenticated user is accepted.
    pub any_valid_user: bool,
    pub required_acl: Acl,
    store: Option<Arc<dyn CredentialStore>>,
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("realm", &self.realm)
            .field("users", &self.users.len())
            .field("groups", &self.groups.len())
            .field("required_users", &self.required_users)
            .field("required_groups", &self.required_groups)
            .field("any_valid_user", &self.any_valid_user)
            .field("required_acl", &self.required_acl)
            .field("external_store", &self.store.is_some())
            .finish()
    }
}

impl Auth {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            ..Self::default()
        }
    }

    pub fn from_config(cfg: &AuthConfig) -> Result<Self, ConfigError> {
        let mut auth = Auth::new(cfg.realm.clone());
        for user in &cfg.users {
            auth.add_user(&user.name, &user.password, user.enabled);
        }
        for group in &cfg.groups {
            auth.add_group(&group.name, parse_acl(&group.acl)?, group.enabled);
            let members: Vec<&str> = group.users.iter().map(String::as_str).collect();
            auth.add_users_to_group(&group.name, &members)?;
        }
        for name in &cfg.require.groups {
            if !auth.groups.contains_key(name) {
                return Err(ConfigError::UnknownGroup(name.clone()));
            }
        }
        auth.required_users = cfg.require.users.clone();
        auth.required_groups = cfg.require.groups.clone();
        auth.any_valid_user = cfg.require.valid_user;
        auth.required_acl = match &cfg.require.acl {
            Some(acl) => parse_acl(acl)?,
            None => 0,
        };
        auth.update_user_acls();
        Ok(auth)
    }

    /// Hands password checks to an external backend.
    pub fn set_store(&mut self, store: Arc<dyn CredentialStore>) {
        self.store = Some(store);
    }

    pub fn add_user(&mut self, name: &str, password: &str, enabled: bool) {
        self.users.insert(
            name.to_string(),
            User {
                name: name.to_string(),
                password: password.to_string(),
                enabled,
                acl: 0,
            },
        );
        self.update_user_acls();
    }

    pub fn user(&self, name: &str) -> Option<&User> {
        self.users.get(name)
    }

    pub fn add_group(&mut self, name: &str, acl: Acl, enabled: bool) {
        self.groups.insert(
            name.to_string(),
            Group {
                name: name.to_string(),
                acl,
                enabled,
                users: Vec::new(),
            },
        );
        self.update_user_acls();
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn add_users_to_group(&mut self, group: &str, users: &[&str]) -> Result<(), ConfigError> {
        let entry = self
            .groups
            .get_mut(group)
            .ok_or_else(|| ConfigError::UnknownGroup(group.to_string()))?;
        for user in users {
            if !entry.users.iter().any(|u| u == user) {
                entry.users.push(user.to_string());
            }
        }
        self.update_user_acls();
        Ok(())
    }

    pub fn remove_user_from_group(&mut self, group: &str, user: &str) -> Result<(), ConfigError> {
        let entry = self
            .groups
            .get_mut(group)
            .ok_or_else(|| ConfigError::UnknownGroup(group.to_string()))?;
        entry.users.retain(|u| u != user);
        self.update_user_acls();
        Ok(())
    }

    pub fn set_group_enabled(&mut self, group: &str, enabled: bool) -> Result<(), ConfigError> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| ConfigError::UnknownGroup(group.to_string()))?
            .enabled = enabled;
        self.update_user_acls();
        Ok(())
    }

    /// Recomputes each user's ACL as the union of the ACLs of every enabled
    /// group whose member list names the user.
    pub fn update_user_acls(&mut self) {
        let groups = &self.groups;
        for user in self.users.values_mut() {
            user.acl = groups
                .values()
                .filter(|g| g.enabled && g.users.iter().any(|u| *u == user.name))
                .fold(0, |acl, g| acl | g.acl);
        }
    }

    /// Checks a user's password.
    pub fn validate(&self, user: &str, password: &str) -> bool {
        match &self.store {
            Some(store) => store.validate(&self.realm, user, password),
            None => self
                .users
                .get(user)
                .is_some_and(|u| u.enabled && u.password == password),
        }
    }

    /// Checks an authenticated user against the required users, groups and
    /// ACL.
    pub fn is_authorized(&self, user: &str) -> bool {
        if !self.required_users.is_empty() && !self.required_users.iter().any(|u| u == user) {
            return false;
        }
        if !self.required_groups.is_empty() {
            let member = self.required_groups.iter().any(|name| {
                self.groups
                    .get(name)
                    .is_some_and(|g| g.enabled && g.users.iter().any(|u| u == user))
            });
            if !member {
                return false;
            }
        }
        if self.required_acl != 0 {
            let acl = self.users.get(user).map_or(0, |u| u.acl);
            if acl & self.required_acl == 0 {
                return false;
            }
        }
        true
    }
}

//! An in-memory credential store

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use crate::sources::CredentialStore;
use crate::AccessToken;

/// An in-memory credential store
///
/// Clones share the same contents, so one clone can be handed to a token
/// manager while another plays the part of the server writing credentials.
#[derive(Clone, Default, Debug)]
pub struct InMemoryCredentialStore {
    values: Arc<RwLock<HashMap<String, AccessToken>>>,
}

impl InMemoryCredentialStore {
    /// Constructs a new, empty credential store
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `token` under `name`, replacing any previous value
    pub fn set(&self, name: impl Into<String>, token: impl Into<AccessToken>) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), token.into());
    }

    /// Removes the value stored under `name`
    pub fn remove(&self, name: &str) -> Option<AccessToken> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn read_raw(&self, name: &str) -> Option<AccessToken> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

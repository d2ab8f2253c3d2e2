use crate::error::{AppError, AppResult};
use crate::models::tags::{Alias, Tag, TagRef};
use crate::services::store::KvStore;
use chrono::Utc;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

const ALIAS_PREFIX: &str = "alias:";
const TAG_PREFIX: &str = "tag:";
const TAG_INDEX_PREFIX: &str = "tagidx:";

fn alias_key(host_id: &str) -> String {
    format!("{}{}", ALIAS_PREFIX, host_id)
}

fn tag_key(host_id: &str, tag: &TagRef) -> String {
    format!("{}{}:{}:{}", TAG_PREFIX, host_id, tag.tag_type, tag.id)
}

fn tag_index_prefix(tag: &TagRef) -> String {
    format!("{}{}:{}:", TAG_INDEX_PREFIX, tag.tag_type, tag.id)
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,64}$").expect("valid identifier regex"))
}

/// Host ids and tag types are embedded in composite keys, so they are limited
/// to characters that can't collide with the `:` separator.
fn validate_identifier(field: &str, value: &str) -> AppResult<()> {
    if identifier_pattern().is_match(value) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "{} must be 1-64 characters of [A-Za-z0-9_.-], got {:?}",
            field, value
        )))
    }
}

pub struct AliasStore {
    store: Arc<KvStore>,
}

impl AliasStore {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    pub fn set(&self, host_id: &str, alias: &str) -> AppResult<Alias> {
        validate_identifier("host id", host_id)?;
        let alias = alias.trim();
        if alias.is_empty() {
            return Err(AppError::Validation("alias must not be empty".to_string()));
        }

        self.store.transact(|txn| {
            let key = alias_key(host_id);
            let now = Utc::now();
            let record = match txn.get::<Alias>(&key)? {
                Some(existing) => Alias {
                    alias: alias.to_string(),
                    updated_at: now,
                    ..existing
                },
                None => Alias {
                    id: Uuid::new_v4(),
                    host_id: host_id.to_string(),
                    alias: alias.to_string(),
                    created_at: now,
                    updated_at: now,
                },
            };
            txn.put(&key, &record)?;
            Ok(record)
        })
    }

    pub fn get(&self, host_id: &str) -> AppResult<Option<Alias>> {
        self.store.get(&alias_key(host_id))
    }

    pub fn delete(&self, host_id: &str) -> AppResult<()> {
        if self.store.delete(&alias_key(host_id))? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("alias for host {}", host_id)))
        }
    }

    pub fn list_all(&self) -> Vec<Alias> {
        self.store
            .scan_prefix::<Alias>(ALIAS_PREFIX)
            .into_iter()
            .map(|(_, alias)| alias)
            .collect()
    }
}

/// Host tag memberships, with a `(type, id) -> host` index maintained in the
/// same transaction as each membership record.
pub struct TagStore {
    store: Arc<KvStore>,
}

impl TagStore {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    pub fn add(&self, host_id: &str, tag: &TagRef) -> AppResult<Tag> {
        validate_identifier("host id", host_id)?;
        validate_identifier("tag type", &tag.tag_type)?;

        self.store.transact(|txn| {
            let key = tag_key(host_id, tag);
            if txn.exists(&key) {
                return Err(AppError::Conflict(format!(
                    "tag {}:{} on host {}",
                    tag.tag_type, tag.id, host_id
                )));
            }

            let record = Tag {
                host_id: host_id.to_string(),
                tag_type: tag.tag_type.clone(),
                tag_id: tag.id,
                created_at: Utc::now(),
            };
            txn.put(&key, &record)?;
            txn.put(&format!("{}{}", tag_index_prefix(tag), host_id), &host_id)?;
            Ok(record)
        })
    }

    pub fn remove(&self, host_id: &str, tag: &TagRef) -> AppResult<()> {
        self.store.transact(|txn| {
            if !txn.delete(&tag_key(host_id, tag)) {
                return Err(AppError::NotFound(format!(
                    "tag {}:{} on host {}",
                    tag.tag_type, tag.id, host_id
                )));
            }
            txn.delete(&format!("{}{}", tag_index_prefix(tag), host_id));
            Ok(())
        })
    }

    pub fn list(&self, host_id: &str) -> Vec<Tag> {
        self.store
            .scan_prefix::<Tag>(&format!("{}{}:", TAG_PREFIX, host_id))
            .into_iter()
            .map(|(_, tag)| tag)
            .collect()
    }

    /// Host bound to `(type, id)`. When several hosts carry the same tag the
    /// lowest host id wins.
    pub fn find_host(&self, tag: &TagRef) -> Option<String> {
        self.store
            .scan_prefix::<String>(&tag_index_prefix(tag))
            .into_iter()
            .map(|(_, host_id)| host_id)
            .next()
    }
}

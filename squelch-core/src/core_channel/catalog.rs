//! Channel catalog backed by `channels/{C}/meta`

use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::core_directory::{
    ChannelPaths, DirectoryError, DirectoryEvent, DirectoryPath, DirectoryResult, SharedDirectory, Subscription,
};
use crate::core_directory::path::META;
use crate::core_model::records::Record;
use crate::core_model::{ChannelId, ChannelMeta};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub meta: ChannelMeta,
}

impl Channel {
    pub fn display_name(&self) -> String {
        self.meta.display_name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Previous,
    Next,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogChange {
    Upserted(Channel),
    Removed(ChannelId),
}

/// Channel id of a `channels/{C}/meta` path
fn meta_channel(path: &DirectoryPath) -> Option<ChannelId> {
    match path.relative_to(&ChannelPaths::all_channels())? {
        [id, meta] if meta == META => Some(ChannelId::new(id.as_str())),
        _ => None,
    }
}

/// Catalog changes, filtered out of a watch on every channel
pub struct CatalogWatch {
    subscription: Subscription,
}

impl CatalogWatch {
    pub async fn next(&mut self) -> Option<CatalogChange> {
        while let Some(event) = self.subscription.next().await {
            let Some(id) = meta_channel(event.path()) else {
                continue;
            };
            match event {
                DirectoryEvent::Put { path, value } => match ChannelMeta::decode(&value) {
                    Ok(meta) => return Some(CatalogChange::Upserted(Channel { id, meta })),
                    Err(e) => warn!(%path, error = %e, "Skipping malformed channel metadata"),
                },
                DirectoryEvent::Removed { .. } => return Some(CatalogChange::Removed(id)),
            }
        }
        None
    }

    pub fn detach(&self) {
        self.subscription.detach();
    }
}

#[derive(Clone)]
pub struct ChannelCatalog {
    store: SharedDirectory,
    config: ChannelConfig,
}

impl ChannelCatalog {
    pub fn new(store: SharedDirectory, config: ChannelConfig) -> Self {
        Self { store, config }
    }

    /// Seed the default channel set if the directory has none. Returns
    /// whether anything was written.
    pub async fn ensure_defaults(&self) -> DirectoryResult<bool> {
        if !self.config.seed_defaults {
            return Ok(false);
        }
        if !self.list().await?.is_empty() {
            debug!("Channel catalog already provisioned");
            return Ok(false);
        }

        for n in 1..=self.config.default_count {
            let id = ChannelId::numbered(n);
            let meta = ChannelMeta::public(format!("{} {}", self.config.name_prefix, id));
            let value = meta.encode().map_err(|e| DirectoryError::Malformed {
                path: ChannelPaths::new(&id).meta().to_string(),
                reason: e.to_string(),
            })?;
            self.store.set(&ChannelPaths::new(&id).meta(), value).await?;
        }
        info!(count = self.config.default_count, "Seeded default channels");
        Ok(true)
    }

    /// Every channel, sorted by id. Malformed metadata is skipped.
    pub async fn list(&self) -> DirectoryResult<Vec<Channel>> {
        let entries = self.store.list(&ChannelPaths::all_channels()).await?;
        let mut channels: Vec<Channel> = entries
            .into_iter()
            .filter_map(|(path, value)| {
                let id = meta_channel(&path)?;
                match ChannelMeta::decode(&value) {
                    Ok(meta) => Some(Channel { id, meta }),
                    Err(e) => {
                        warn!(%path, error = %e, "Skipping malformed channel metadata");
                        None
                    }
                }
            })
            .collect();
        channels.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(channels)
    }

    pub async fn get(&self, id: &ChannelId) -> DirectoryResult<Option<Channel>> {
        let Some(value) = self.store.get(&ChannelPaths::new(id).meta()).await? else {
            return Ok(None);
        };
        Ok(ChannelMeta::decode(&value).ok().map(|meta| Channel {
            id: id.clone(),
            meta,
        }))
    }

    /// First channel in catalog order
    pub async fn first(&self) -> DirectoryResult<Option<ChannelId>> {
        Ok(self.list().await?.into_iter().next().map(|c| c.id))
    }

    /// The channel next to `current`, clamped at both ends. A channel that
    /// is not in the catalog navigates to the first one.
    pub async fn neighbor(
        &self,
        current: &ChannelId,
        direction: Direction,
    ) -> DirectoryResult<Option<ChannelId>> {
        let channels = self.list().await?;
        let Some(position) = channels.iter().position(|c| &c.id == current) else {
            return Ok(channels.into_iter().next().map(|c| c.id));
        };
        let target = match direction {
            Direction::Previous => position.saturating_sub(1),
            Direction::Next => (position + 1).min(channels.len() - 1),
        };
        Ok(Some(channels[target].id.clone()))
    }

    pub async fn watch(&self) -> DirectoryResult<CatalogWatch> {
        let subscription = self.store.watch(&ChannelPaths::all_channels()).await?;
        Ok(CatalogWatch { subscription })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_directory::{DirectoryStore, MemoryDirectory};
    use std::sync::Arc;

    fn catalog(store: &MemoryDirectory) -> ChannelCatalog {
        ChannelCatalog::new(Arc::new(store.connect()), ChannelConfig::default())
    }

    #[tokio::test]
    async fn test_defaults_seeded_once() {
        let store = MemoryDirectory::new();
        let catalog = catalog(&store);

        assert!(catalog.ensure_defaults().await.unwrap());
        assert!(!catalog.ensure_defaults().await.unwrap());

        let channels = catalog.list().await.unwrap();
        assert_eq!(channels.len(), 25);
        assert_eq!(channels[0].id.as_str(), "01");
        assert_eq!(channels[0].display_name(), "Channel 01");
        assert_eq!(channels[24].id.as_str(), "25");
    }

    #[tokio::test]
    async fn test_existing_channels_block_seeding() {
        let store = MemoryDirectory::new();
        let client = store.connect();
        let id = ChannelId::new("ops");
        client
            .set(&ChannelPaths::new(&id).meta(), ChannelMeta::private("Ops").encode().unwrap())
            .await
            .unwrap();

        let catalog = catalog(&store);
        assert!(!catalog.ensure_defaults().await.unwrap());
        let channels = catalog.list().await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].display_name(), "★ Ops");
    }

    #[tokio::test]
    async fn test_navigation_is_clamped() {
        let store = MemoryDirectory::new();
        let catalog = catalog(&store);
        catalog.ensure_defaults().await.unwrap();

        let first = ChannelId::numbered(1);
        let last = ChannelId::numbered(25);
        assert_eq!(catalog.neighbor(&first, Direction::Previous).await.unwrap(), Some(first.clone()));
        assert_eq!(
            catalog.neighbor(&first, Direction::Next).await.unwrap(),
            Some(ChannelId::numbered(2))
        );
        assert_eq!(catalog.neighbor(&last, Direction::Next).await.unwrap(), Some(last));
        assert_eq!(
            catalog.neighbor(&ChannelId::new("nope"), Direction::Next).await.unwrap(),
            Some(first)
        );
    }

    #[tokio::test]
    async fn test_watch_only_reports_metadata() {
        let store = MemoryDirectory::new();
        let client = store.connect();
        let catalog = catalog(&store);
        let mut watch = catalog.watch().await.unwrap();

        let paths = ChannelPaths::new(&ChannelId::new("01"));
        client
            .set(&paths.presence_of(&"alice".into()), serde_json::json!({"label": "a", "joinedAtMillis": 1}))
            .await
            .unwrap();
        client
            .set(&paths.meta(), ChannelMeta::public("Lobby").encode().unwrap())
            .await
            .unwrap();

        match watch.next().await.unwrap() {
            CatalogChange::Upserted(channel) => assert_eq!(channel.meta.name, "Lobby"),
            other => panic!("unexpected change {other:?}"),
        }
        watch.detach();
    }
}

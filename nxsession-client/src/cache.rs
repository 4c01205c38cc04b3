//! Local mirrors of server entities.
//!
//! Each cache is keyed both by numeric id and by GUID. Entity frames are
//! decoded into [`EntityClass`] through an [`EntityRegistry`] that maps the
//! numeric class tag to a constructor; new tags can be registered at runtime.

use nxsession_protocol::codes::*;
use nxsession_protocol::Frame;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

// Object class tags carried in VID_OBJECT_CLASS.
pub const CLASS_GENERIC: u32 = 0;
pub const CLASS_SUBNET: u32 = 1;
pub const CLASS_NODE: u32 = 2;
pub const CLASS_INTERFACE: u32 = 3;
pub const CLASS_NETWORK: u32 = 4;
pub const CLASS_CONTAINER: u32 = 5;
pub const CLASS_ZONE: u32 = 6;

/// User ids with this bit set denote groups.
pub const GROUP_FLAG: u32 = 0x8000_0000;

// VID_UPDATE_TYPE values of CMD_USER_DB_UPDATE.
pub const USER_DB_OBJECT_CREATED: u32 = 0;
pub const USER_DB_OBJECT_MODIFIED: u32 = 1;
pub const USER_DB_OBJECT_DELETED: u32 = 2;

// VID_NOTIFICATION_CODE values of CMD_EVENT_DB_UPDATE.
pub const EVENT_TEMPLATE_MODIFIED: u32 = 0;
pub const EVENT_TEMPLATE_REMOVED: u32 = 1;

/// Decoded shape of a cached entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityClass {
    Node {
        primary_ip: Option<String>,
    },
    Interface {
        node_id: Option<u32>,
        ip_address: Option<String>,
    },
    Subnet {
        ip_address: Option<String>,
    },
    Container {
        children: Vec<u32>,
    },
    Zone,
    Network,
    User {
        is_group: bool,
    },
    EventTemplate {
        code: u32,
    },
    /// Produced by constructors registered at runtime.
    Custom {
        tag: u32,
        data: serde_json::Value,
    },
    /// Class tag without a registered constructor.
    Generic {
        tag: u32,
    },
}

/// A server entity mirrored locally.
#[derive(Debug, Clone)]
pub struct CachedEntity {
    pub id: u32,
    pub guid: Option<Uuid>,
    pub name: String,
    pub class: EntityClass,
    /// The frame the entity was decoded from.
    pub raw: Frame,
}

type Constructor = Arc<dyn Fn(&Frame) -> EntityClass + Send + Sync>;

/// Maps class tags to entity constructors.
pub struct EntityRegistry {
    constructors: RwLock<HashMap<u32, Constructor>>,
}

impl EntityRegistry {
    /// Creates a registry with the built-in object classes.
    pub fn new() -> Self {
        let registry = Self {
            constructors: RwLock::new(HashMap::new()),
        };
        registry.register(CLASS_NODE, |f| EntityClass::Node {
            primary_ip: f.get_str(VID_IP_ADDRESS),
        });
        registry.register(CLASS_INTERFACE, |f| EntityClass::Interface {
            node_id: f.get_u32(VID_NODE_ID),
            ip_address: f.get_str(VID_IP_ADDRESS),
        });
        registry.register(CLASS_SUBNET, |f| EntityClass::Subnet {
            ip_address: f.get_str(VID_IP_ADDRESS),
        });
        registry.register(CLASS_CONTAINER, |f| EntityClass::Container {
            children: child_ids(f),
        });
        registry.register(CLASS_ZONE, |_| EntityClass::Zone);
        registry.register(CLASS_NETWORK, |_| EntityClass::Network);
        registry
    }

    /// Registers (or replaces) the constructor for `tag`.
    pub fn register<F>(&self, tag: u32, constructor: F)
    where
        F: Fn(&Frame) -> EntityClass + Send + Sync + 'static,
    {
        self.constructors.write().insert(tag, Arc::new(constructor));
    }

    pub fn is_registered(&self, tag: u32) -> bool {
        self.constructors.read().contains_key(&tag)
    }

    /// Decodes the class of an object frame. Unknown tags become
    /// [`EntityClass::Generic`].
    pub fn decode(&self, frame: &Frame) -> EntityClass {
        let tag = frame.get_u32(VID_OBJECT_CLASS).unwrap_or(CLASS_GENERIC);
        let ctor = self.constructors.read().get(&tag).cloned();
        match ctor {
            Some(ctor) => ctor(frame),
            None => EntityClass::Generic { tag },
        }
    }

    /// Builds a cache entity from an object frame.
    pub fn object_from_frame(&self, frame: &Frame) -> Option<CachedEntity> {
        let id = frame.get_u32(VID_OBJECT_ID)?;
        Some(CachedEntity {
            id,
            guid: frame.get_uuid(VID_GUID),
            name: frame.get_str(VID_OBJECT_NAME).unwrap_or_default(),
            class: self.decode(frame),
            raw: frame.clone(),
        })
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn child_ids(frame: &Frame) -> Vec<u32> {
    let count = frame.get_u32(VID_NUM_OBJECTS).unwrap_or(0);
    (0..count)
        .filter_map(|i| frame.get_u32(VID_CHILD_ID_BASE + i))
        .collect()
}

#[derive(Default)]
struct Maps {
    by_id: HashMap<u32, Arc<CachedEntity>>,
    by_guid: HashMap<Uuid, u32>,
}

/// Dual-keyed entity cache.
#[derive(Default)]
pub struct EntityCache {
    maps: RwLock<Maps>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entity; returns the stored handle.
    pub fn upsert(&self, entity: CachedEntity) -> Arc<CachedEntity> {
        let entity = Arc::new(entity);
        let mut maps = self.maps.write();
        if let Some(old) = maps.by_id.insert(entity.id, entity.clone()) {
            if let Some(guid) = old.guid {
                maps.by_guid.remove(&guid);
            }
        }
        if let Some(guid) = entity.guid {
            maps.by_guid.insert(guid, entity.id);
        }
        entity
    }

    pub fn remove(&self, id: u32) -> Option<Arc<CachedEntity>> {
        let mut maps = self.maps.write();
        let removed = maps.by_id.remove(&id)?;
        if let Some(guid) = removed.guid {
            maps.by_guid.remove(&guid);
        }
        Some(removed)
    }

    pub fn get(&self, id: u32) -> Option<Arc<CachedEntity>> {
        self.maps.read().by_id.get(&id).cloned()
    }

    pub fn get_by_guid(&self, guid: &Uuid) -> Option<Arc<CachedEntity>> {
        let maps = self.maps.read();
        let id = maps.by_guid.get(guid)?;
        maps.by_id.get(id).cloned()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.maps.read().by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.maps.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns all entities matching `filter`.
    pub fn find<F>(&self, filter: F) -> Vec<Arc<CachedEntity>>
    where
        F: Fn(&CachedEntity) -> bool,
    {
        self.maps
            .read()
            .by_id
            .values()
            .filter(|e| filter(e))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        let mut maps = self.maps.write();
        maps.by_id.clear();
        maps.by_guid.clear();
    }
}

/// One-shot completion flag for an initial synchronization.
#[derive(Default)]
struct SyncFlag {
    done: AtomicBool,
    notify: Notify,
}

impl SyncFlag {
    fn complete(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_complete(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }
}

/// All caches of a session.
pub struct Caches {
    pub objects: EntityCache,
    pub users: EntityCache,
    pub event_templates: EntityCache,
    pub registry: EntityRegistry,
    objects_synced: SyncFlag,
    users_synced: SyncFlag,
}

impl Caches {
    pub fn new() -> Self {
        Self {
            objects: EntityCache::new(),
            users: EntityCache::new(),
            event_templates: EntityCache::new(),
            registry: EntityRegistry::new(),
            objects_synced: SyncFlag::default(),
            users_synced: SyncFlag::default(),
        }
    }

    /// Marks the initial object synchronization as complete.
    pub fn complete_object_sync(&self) {
        self.objects_synced.complete();
    }

    pub fn is_object_sync_complete(&self) -> bool {
        self.objects_synced.is_complete()
    }

    /// Waits until [`Caches::complete_object_sync`] has been called.
    pub async fn wait_object_sync(&self) {
        self.objects_synced.wait().await
    }

    /// Marks the user database load as complete.
    pub fn complete_user_sync(&self) {
        self.users_synced.complete();
    }

    pub fn is_user_sync_complete(&self) -> bool {
        self.users_synced.is_complete()
    }

    pub async fn wait_user_sync(&self) {
        self.users_synced.wait().await
    }
}

impl Default for Caches {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a user database entity from `CMD_USER_DATA`/`CMD_USER_DB_UPDATE`.
pub fn user_from_frame(frame: &Frame) -> Option<CachedEntity> {
    let id = frame.get_u32(VID_USER_ID)?;
    Some(CachedEntity {
        id,
        guid: frame.get_uuid(VID_GUID),
        name: frame.get_str(VID_NAME).unwrap_or_default(),
        class: EntityClass::User {
            is_group: id & GROUP_FLAG != 0,
        },
        raw: frame.clone(),
    })
}

/// Builds a group entity from `CMD_GROUP_DATA`.
pub fn group_from_frame(frame: &Frame) -> Option<CachedEntity> {
    let mut group = user_from_frame(frame)?;
    group.class = EntityClass::User { is_group: true };
    Some(group)
}

/// Builds an event template entity from `CMD_EVENT_DB_UPDATE`.
pub fn event_template_from_frame(frame: &Frame) -> Option<CachedEntity> {
    let code = frame.get_u32(VID_EVENT_CODE)?;
    Some(CachedEntity {
        id: code,
        guid: frame.get_uuid(VID_GUID),
        name: frame.get_str(VID_NAME).unwrap_or_default(),
        class: EntityClass::EventTemplate { code },
        raw: frame.clone(),
    })
}

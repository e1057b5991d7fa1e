//! SQLite-backed store
//!
//! Records are kept as JSON payloads next to the few columns needed for
//! ordering and lookup. Filtering happens in memory; the record counts on a
//! node are small.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{
    AttributeScope, Device, MicroserviceDefinition, PersistenceStore, ServiceDefFilter, StoreError,
};
use crate::attributes::Attribute;
use crate::eventlog::{EventLog, EventLogQuery};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS device (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS service_defs (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    org TEXT NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS attributes (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS event_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    data TEXT NOT NULL
);
";

pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let db = Connection::open(db_path)?;

        // Enable WAL mode for concurrent read access
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        db.execute_batch(SCHEMA)?;

        info!(path = %db_path.display(), "Store initialized");
        Ok(Self { db: Mutex::new(db) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let db = Connection::open_in_memory()?;
        db.execute_batch(SCHEMA)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    fn load_all<T: DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>, StoreError> {
        let db = self.conn()?;
        let mut stmt = db.prepare_cached(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }
}

impl PersistenceStore for SqliteStore {
    fn find_device(&self) -> Result<Option<Device>, StoreError> {
        let db = self.conn()?;
        let result = db.query_row("SELECT data FROM device WHERE id = 1", [], |row| {
            row.get::<_, String>(0)
        });

        match result {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_device(&self, device: &Device) -> Result<(), StoreError> {
        let data = serde_json::to_string(device)?;
        self.conn()?.execute(
            "INSERT INTO device (id, data) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET data = ?1",
            params![data],
        )?;
        debug!(org = %device.org, id = %device.id, "Saved device");
        Ok(())
    }

    fn delete_device(&self) -> Result<(), StoreError> {
        self.conn()?.execute("DELETE FROM device", [])?;
        Ok(())
    }

    fn find_service_defs(
        &self,
        filters: &[ServiceDefFilter],
    ) -> Result<Vec<MicroserviceDefinition>, StoreError> {
        let defs: Vec<MicroserviceDefinition> =
            self.load_all("SELECT data FROM service_defs ORDER BY rowid")?;
        Ok(defs
            .into_iter()
            .filter(|def| filters.iter().all(|f| f.matches(def)))
            .collect())
    }

    fn save_service_def(&self, def: &MicroserviceDefinition) -> Result<(), StoreError> {
        let data = serde_json::to_string(def)?;
        self.conn()?.execute(
            "INSERT INTO service_defs (id, url, org, archived, data) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET url = ?2, org = ?3, archived = ?4, data = ?5",
            params![def.id, def.url, def.org, def.archived, data],
        )?;
        debug!(id = %def.id, url = %def.url, org = %def.org, archived = def.archived, "Saved service definition");
        Ok(())
    }

    fn delete_service_def(&self, id: &str) -> Result<(), StoreError> {
        self.conn()?
            .execute("DELETE FROM service_defs WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn find_attributes(&self, scope: &AttributeScope) -> Result<Vec<Attribute>, StoreError> {
        let attrs: Vec<Attribute> = self.load_all("SELECT data FROM attributes ORDER BY rowid")?;
        Ok(attrs.into_iter().filter(|a| scope.matches(a)).collect())
    }

    fn save_attribute(&self, attr: &Attribute) -> Result<(), StoreError> {
        let data = serde_json::to_string(attr)?;
        self.conn()?.execute(
            "INSERT INTO attributes (id, data) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET data = ?2",
            params![attr.meta.id, data],
        )?;
        debug!(id = %attr.meta.id, kind = %attr.kind(), "Saved attribute");
        Ok(())
    }

    fn delete_attribute(&self, id: &str) -> Result<(), StoreError> {
        self.conn()?
            .execute("DELETE FROM attributes WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn save_event_log(&self, entry: &EventLog) -> Result<(), StoreError> {
        let data = serde_json::to_string(entry)?;
        self.conn()?.execute(
            "INSERT INTO event_log (id, timestamp, data) VALUES (?1, ?2, ?3)",
            params![entry.id, entry.timestamp as i64, data],
        )?;
        Ok(())
    }

    fn find_event_logs(&self, query: &EventLogQuery) -> Result<Vec<EventLog>, StoreError> {
        let logs: Vec<EventLog> = self.load_all("SELECT data FROM event_log ORDER BY seq")?;
        Ok(logs.into_iter().filter(|l| query.matches(l)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AttributeValue, ServiceSpec};
    use crate::catalog::{ServiceDefinition, SharingMode};
    use crate::eventlog::{codes, Severity, ServiceSource};
    use tempfile::TempDir;

    fn msdef(url: &str) -> MicroserviceDefinition {
        MicroserviceDefinition::from_service(
            &ServiceDefinition {
                url: url.to_string(),
                org: "acme".to_string(),
                version: "1.0.0".to_string(),
                arch: "amd64".to_string(),
                user_inputs: vec![],
                sharable: SharingMode::Exclusive,
            },
            "acme",
        )
    }

    #[test]
    fn test_device_absent_then_saved() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.find_device().unwrap().is_none());

        let device = Device {
            org: "acme".to_string(),
            id: "node-1".to_string(),
            token: "t".to_string(),
            pattern: String::new(),
            ha_enabled: true,
        };
        store.save_device(&device).unwrap();
        store.save_device(&device).unwrap();
        assert_eq!(store.find_device().unwrap(), Some(device));

        store.delete_device().unwrap();
        assert!(store.find_device().unwrap().is_none());
    }

    #[test]
    fn test_service_def_filters_and_replace() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut gps = msdef("gps");
        store.save_service_def(&gps).unwrap();
        store.save_service_def(&msdef("cpu")).unwrap();

        let found = store
            .find_service_defs(&[
                ServiceDefFilter::Unarchived,
                ServiceDefFilter::url_org("gps", "acme"),
            ])
            .unwrap();
        assert_eq!(found.len(), 1);

        gps.archive(10);
        store.save_service_def(&gps).unwrap();
        assert_eq!(
            store
                .find_service_defs(&[ServiceDefFilter::Unarchived])
                .unwrap()
                .len(),
            1
        );
        assert_eq!(store.find_service_defs(&[]).unwrap().len(), 2);

        store.delete_service_def(&gps.id).unwrap();
        assert_eq!(store.find_service_defs(&[]).unwrap().len(), 1);
    }

    #[test]
    fn test_attribute_scopes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let spec = ServiceSpec::new("gps", "acme");

        let mut global = Attribute::global(AttributeValue::Ha {
            partners: vec!["b".to_string()],
        });
        global.meta.id = "g".to_string();
        let mut scoped = Attribute::scoped(spec.clone(), AttributeValue::Compute { cpus: 1, ram: 64 });
        scoped.meta.id = "s".to_string();
        let mut elsewhere =
            Attribute::scoped(ServiceSpec::new("cpu", "acme"), AttributeValue::Compute { cpus: 2, ram: 64 });
        elsewhere.meta.id = "e".to_string();

        for attr in [&global, &scoped, &elsewhere] {
            store.save_attribute(attr).unwrap();
        }

        assert_eq!(store.find_attributes(&AttributeScope::All).unwrap().len(), 3);
        assert_eq!(store.find_attributes(&AttributeScope::Global).unwrap(), vec![global]);
        assert_eq!(
            store
                .find_attributes(&AttributeScope::Service(spec.clone()))
                .unwrap(),
            vec![scoped]
        );
        assert_eq!(
            store
                .find_attributes(&AttributeScope::Applicable(spec))
                .unwrap()
                .len(),
            2
        );

        store.delete_attribute("e").unwrap();
        assert_eq!(store.find_attributes(&AttributeScope::All).unwrap().len(), 2);
    }

    #[test]
    fn test_event_logs_persist_on_disk() {
        let dir = TempDir::new().unwrap();
        {
            let store = SqliteStore::open(&dir.path().join("agent.db")).unwrap();
            let entry = EventLog::new(
                Severity::Info,
                "Start service configuration",
                codes::START_SERVICE_CONFIG,
                ServiceSource::default(),
            );
            store.save_event_log(&entry).unwrap();
        }

        let reopened = SqliteStore::open(&dir.path().join("agent.db")).unwrap();
        let logs = reopened.find_event_logs(&EventLogQuery::default()).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].event_code, codes::START_SERVICE_CONFIG);
    }
}

//! Shard pool: database creation, id routing and fan-out
//!
//! The archive partitions documents across N shard databases keyed by the
//! first byte of the document id. Every shard owns a read-write connection
//! (WAL) and a read-only one, each behind its own lock so readers proceed
//! while a writer holds the write scope.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use domla_common::config::ArchiveConfig;
use domla_common::error::{Error, Result};

use crate::schema;
use crate::sqlite::{Connection, JournalMode, SqliteConfig};

/// One shard database with its writer/reader connection pair
pub struct Shard {
    number: usize,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Shard {
    fn open(number: usize, token: &str, config: &ArchiveConfig) -> Result<Self> {
        let location = if config.is_in_memory() {
            // A named shared-cache database, so both connections see the
            // same ephemeral data. The token keeps separate archives in one
            // process apart.
            format!("file:domla-{token}-{number}?mode=memory&cache=shared")
        } else {
            Path::new(&config.data_location)
                .join(format!("{number:03}domla.archive"))
                .to_string_lossy()
                .into_owned()
        };

        debug!("opening shard {number} at {location}");

        let write_setup = SqliteConfig {
            path: location.clone(),
            busy_timeout_ms: Some(100),
            cache_size: Some(-20000),
            foreign_keys: Some(true),
            max_page_count: Some(2_147_483_646),
            page_size: Some(65536),
            journal: Some(JournalMode::Wal),
            cell_size_check: Some(true),
            ..SqliteConfig::default()
        };
        let writer = Connection::open_or_create(&write_setup)?;
        schema::ensure(&writer)?;

        let read_setup = SqliteConfig {
            path: location,
            read_only: true,
            busy_timeout_ms: Some(100),
            cache_size: Some(-20000),
            foreign_keys: Some(true),
            // Shared-cache readers would otherwise block on the writer's
            // table locks instead of honouring the busy timeout.
            read_uncommitted: Some(true),
            ..SqliteConfig::default()
        };
        let reader = Connection::open(&read_setup)?;

        Ok(Self {
            number,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    pub fn number(&self) -> usize {
        self.number
    }

    /// Enter a write scope; multi-statement writes open a transaction inside
    pub fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock()
    }

    /// Enter a read scope on the read-only connection
    pub fn reader(&self) -> MutexGuard<'_, Connection> {
        self.reader.lock()
    }
}

/// Owns the shard databases and routes document ids to them
pub struct ShardPool {
    shards: Vec<Arc<Shard>>,
    /// Maps the first id byte to an index into `shards`
    routing: [u8; 256],
}

impl ShardPool {
    pub fn open(config: &ArchiveConfig) -> Result<Self> {
        // An in-memory archive is always a single ephemeral shard.
        let count = if config.is_in_memory() {
            1
        } else {
            config.backends
        };
        if !(1..=256).contains(&count) {
            return Err(Error::Config(format!(
                "shard count must be in 1..=256, got {count}"
            )));
        }

        info!("opening {count} archive shard(s) at {}", config.data_location);

        let token = domla_common::utils::new_id();
        let shards = (1..=count)
            .map(|number| Shard::open(number, &token, config).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let span = 256usize.div_ceil(count);
        let mut routing = [0u8; 256];
        for (byte, slot) in routing.iter_mut().enumerate() {
            *slot = std::cmp::min(byte / span, count - 1) as u8;
        }

        Ok(Self { shards, routing })
    }

    /// The distinct shards, in creation order
    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    /// Resolve a document id to its shard via the first two hex characters
    pub fn shard_for(&self, id: &str) -> Result<&Arc<Shard>> {
        let prefix = id
            .get(0..2)
            .ok_or_else(|| Error::Invalid(format!("id too short for routing: {id:?}")))?;
        let byte = u8::from_str_radix(prefix, 16)
            .map_err(|_| Error::Invalid(format!("id does not start with hex: {id:?}")))?;
        Ok(&self.shards[self.routing[byte as usize] as usize])
    }

    /// Run `query` against every distinct shard reader in parallel and
    /// concatenate the results.
    pub fn fan_out<T, F>(&self, query: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&Connection) -> Result<Vec<T>> + Sync,
    {
        let query = &query;
        crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = self
                .shards
                .iter()
                .map(|shard| {
                    scope.spawn(move |_| {
                        let reader = shard.reader();
                        query(&reader)
                    })
                })
                .collect();

            let mut merged = Vec::new();
            for handle in handles {
                let partial = handle
                    .join()
                    .map_err(|_| Error::Integrity("fan-out worker panicked".into()))??;
                merged.extend(partial);
            }
            Ok(merged)
        })
        .map_err(|_| Error::Integrity("fan-out scope panicked".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_pool() -> ShardPool {
        ShardPool::open(&ArchiveConfig::in_memory()).unwrap()
    }

    #[test]
    fn requested_shard_files_are_created() {
        let directory = tempfile::tempdir().unwrap();
        let config = ArchiveConfig {
            data_location: directory.path().to_string_lossy().into_owned(),
            backends: 10,
            ..ArchiveConfig::default()
        };
        let pool = ShardPool::open(&config).unwrap();
        assert_eq!(pool.shards().len(), 10);

        for number in 1..=10 {
            let file = directory.path().join(format!("{number:03}domla.archive"));
            assert!(file.is_file(), "missing {file:?}");
        }
    }

    #[test]
    fn routing_is_total_and_stable() {
        let directory = tempfile::tempdir().unwrap();
        let config = ArchiveConfig {
            data_location: directory.path().to_string_lossy().into_owned(),
            backends: 7,
            ..ArchiveConfig::default()
        };
        let pool = ShardPool::open(&config).unwrap();

        for byte in 0u16..256 {
            let id = format!("{byte:02x}e0a9b2-0000-4000-8000-000000000000");
            let first = pool.shard_for(&id).unwrap().number();
            let second = pool.shard_for(&id).unwrap().number();
            assert_eq!(first, second);
            assert!((1..=7).contains(&first));
        }
    }

    #[test]
    fn consecutive_prefixes_share_a_shard() {
        let directory = tempfile::tempdir().unwrap();
        let config = ArchiveConfig {
            data_location: directory.path().to_string_lossy().into_owned(),
            backends: 2,
            ..ArchiveConfig::default()
        };
        let pool = ShardPool::open(&config).unwrap();

        // ceil(256 / 2) = 128 byte values per shard.
        assert_eq!(pool.shard_for("00abc").unwrap().number(), 1);
        assert_eq!(pool.shard_for("7fabc").unwrap().number(), 1);
        assert_eq!(pool.shard_for("80abc").unwrap().number(), 2);
        assert_eq!(pool.shard_for("ffabc").unwrap().number(), 2);
    }

    #[test]
    fn non_hex_ids_are_rejected() {
        let pool = memory_pool();
        assert!(pool.shard_for("zz-not-hex").is_err());
        assert!(pool.shard_for("f").is_err());
    }

    #[test]
    fn fan_out_merges_all_shards() {
        let directory = tempfile::tempdir().unwrap();
        let config = ArchiveConfig {
            data_location: directory.path().to_string_lossy().into_owned(),
            backends: 4,
            ..ArchiveConfig::default()
        };
        let pool = ShardPool::open(&config).unwrap();

        let counts = pool
            .fan_out(|reader| {
                let mut statement = reader.prepare("SELECT COUNT(*) FROM Documents")?;
                Ok(vec![statement.execute_scalar_int()?])
            })
            .unwrap();
        assert_eq!(counts, vec![0, 0, 0, 0]);
    }

    #[test]
    fn in_memory_reader_sees_writer_data() {
        let pool = memory_pool();
        let shard = pool.shard_for("00").unwrap();
        {
            let writer = shard.writer();
            writer
                .execute_batch(
                    "INSERT INTO Documents (Id, Creator, Created, FileName, State) \
                     VALUES ('00a', 'willi', 0, 'test.xxx', 0)",
                )
                .unwrap();
        }
        let reader = shard.reader();
        let mut statement = reader.prepare("SELECT COUNT(*) FROM Documents").unwrap();
        assert_eq!(statement.execute_scalar_int().unwrap(), 1);
    }
}

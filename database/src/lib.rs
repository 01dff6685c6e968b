use core::ops::Range;
use std::{
    borrow::Cow,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use bytesize::ByteSize;
use im::OrdMap;
use libmdbx::{DatabaseFlags, Environment, Geometry, WriteFlags};
use log::info;
use snap::raw::{Decoder, Encoder};
use unwrap_none::UnwrapNone as _;

const GROWTH_STEP: ByteSize = ByteSize::mib(256);
const MAX_NAMED_DATABASES: usize = 4;

// <https://erthink.github.io/libmdbx/group__c__opening.html#gabb7dd3b10dd31639ba252df545e11768>
#[cfg(target_os = "linux")]
const PERMISSIONS: u32 = 0o600;

#[cfg(not(target_os = "linux"))]
const PERMISSIONS: u16 = 0o600;

/// A set of writes applied in a single transaction.
///
/// Operations are applied in insertion order, so a later `put` wins over an earlier one
/// and a `delete_range` only affects keys written before it.
#[derive(Default)]
pub struct WriteBatch {
    operations: Vec<Operation>,
}

enum Operation {
    Put { key: Vec<u8>, value: Vec<u8> },
    DeleteRange { start: Vec<u8>, end: Vec<u8> },
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.operations.push(Operation::Put {
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
        });
    }

    pub fn delete_range(&mut self, range: Range<impl AsRef<[u8]>>) {
        self.operations.push(Operation::DeleteRange {
            start: range.start.as_ref().to_vec(),
            end: range.end.as_ref().to_vec(),
        });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

pub struct Database(DatabaseKind);

impl Database {
    pub fn persistent(
        name: &str,
        directory: impl AsRef<Path>,
        max_size: ByteSize,
    ) -> Result<Self> {
        fs_err::create_dir_all(&directory)?;

        let environment = Environment::builder()
            .set_max_dbs(MAX_NAMED_DATABASES)
            .set_geometry(Geometry {
                size: Some(..usize::try_from(max_size.as_u64())?),
                growth_step: Some(isize::try_from(GROWTH_STEP.as_u64())?),
                shrink_threshold: None,
                page_size: None,
            })
            .open_with_permissions(directory.as_ref(), PERMISSIONS)?;

        let transaction = environment.begin_rw_txn()?;

        if transaction.open_db(Some(name)).is_err() {
            info!("creating database {name} in {}", directory.as_ref().display());
            transaction.create_db(Some(name), DatabaseFlags::default())?;
        }

        transaction.commit()?;

        Ok(Self(DatabaseKind::Persistent {
            database_name: name.to_owned(),
            environment,
        }))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self(DatabaseKind::InMemory {
            map: Mutex::default(),
        })
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                transaction
                    .get::<Cow<_>>(database.dbi(), key.as_ref())?
                    .map(|compressed| decompress(&compressed))
            }
            DatabaseKind::InMemory { map } => map
                .lock()
                .expect("in-memory database mutex is poisoned")
                .get(key.as_ref())
                .map(|compressed| decompress(compressed)),
        }
        .transpose()
    }

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }

    /// Applies every operation in `batch` or none of them.
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_rw_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                for operation in batch.operations {
                    match operation {
                        Operation::Put { key, value } => {
                            let compressed = compress(&value)?;
                            transaction.put(
                                database.dbi(),
                                key,
                                compressed,
                                WriteFlags::default(),
                            )?;
                        }
                        Operation::DeleteRange { start, end } => {
                            let mut cursor = transaction.cursor(&database)?;

                            let Some((mut key, ())) = cursor.set_range::<Cow<_>, _>(&start)? else {
                                continue;
                            };

                            while *key < *end {
                                cursor.del(WriteFlags::default())?;

                                match cursor.next::<Cow<_>, _>()? {
                                    Some((new_key, ())) => key = new_key,
                                    None => break,
                                }
                            }
                        }
                    }
                }

                transaction.commit()?;
            }
            DatabaseKind::InMemory { map } => {
                // Mutate a copy and swap it in so that a failure halfway through the batch
                // leaves the map untouched.
                let mut map = map.lock().expect("in-memory database mutex is poisoned");
                let mut new_map = map.clone();

                for operation in batch.operations {
                    match operation {
                        Operation::Put { key, value } => {
                            let compressed = compress(&value)?;
                            new_map.insert(key.into(), compressed.into());
                        }
                        Operation::DeleteRange { start, end } => {
                            new_map = delete_range_in_memory(&new_map, &start, &end);
                        }
                    }
                }

                *map = new_map;
            }
        }

        Ok(())
    }

    const fn kind(&self) -> &DatabaseKind {
        &self.0
    }
}

enum DatabaseKind {
    Persistent {
        database_name: String,
        environment: Environment,
    },
    InMemory {
        // `OrdMap` clones its elements when split or cloned, so they should be cheap to clone.
        map: Mutex<InMemoryMap>,
    },
}

type InMemoryMap = OrdMap<Arc<[u8]>, Arc<[u8]>>;

fn delete_range_in_memory(map: &InMemoryMap, start: &[u8], end: &[u8]) -> InMemoryMap {
    let end_pair = map.get_key_value(end);
    let (below, _) = map.clone().split(start);
    let (_, above) = map.clone().split(end);

    let mut new_map = below.union(above);

    if let Some((key, value)) = end_pair {
        new_map
            .insert(Arc::clone(key), Arc::clone(value))
            .expect_none("end_pair should have been discarded by OrdMap::split");
    }

    new_map
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    Encoder::new().compress_vec(data).map_err(Into::into)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    Decoder::new().decompress_vec(data).map_err(Into::into)
}

//! Backup archives.
//!
//! A backup is a gzip-compressed tar archive holding a single
//! `snapshot.json` entry: every row of every table, wrapped in a versioned
//! [`Snapshot`]. The format is the same whichever backend wrote it, so a
//! backup taken from the JSON store can be restored into DuckDB and back.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use thiserror::Error;

use crate::models::{now_utc, Snapshot};
use crate::store::{Store, StoreError};

pub const SNAPSHOT_ENTRY: &str = "snapshot.json";
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid snapshot JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid backup file: {0}")]
    Invalid(String),
}

/// Write a backup archive to `writer`; returns the number of rows exported.
///
/// With `tenant_id` set only that tenant's rows are included.
pub fn write_backup<W: Write>(store: &dyn Store, tenant_id: Option<&str>, writer: W) -> Result<usize, BackupError> {
    let snapshot = Snapshot {
        format_version: SNAPSHOT_FORMAT_VERSION,
        exported_at: now_utc(),
        data: store.export_dataset(tenant_id)?,
    };
    let rows = snapshot.data.row_count();
    let json = serde_json::to_vec_pretty(&snapshot)?;

    let gz = flate2::write::GzEncoder::new(writer, flate2::Compression::default());
    let mut tar = tar::Builder::new(gz);

    let mut header = tar::Header::new_gnu();
    header.set_size(json.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(u64::try_from(snapshot.exported_at.timestamp()).unwrap_or(0));
    header.set_cksum();
    tar.append_data(&mut header, SNAPSHOT_ENTRY, json.as_slice())?;

    tar.into_inner()?.finish()?;
    Ok(rows)
}

/// Export a backup archive to `dest_path`
pub fn export_backup(store: &dyn Store, tenant_id: Option<&str>, dest_path: &Path) -> Result<usize, BackupError> {
    let start = std::time::Instant::now();
    log::info!("Starting backup to {:?}", dest_path);

    let file = fs::File::create(dest_path)?;
    let rows = write_backup(store, tenant_id, file)?;

    log::info!(
        "Backup of {} rows completed in {:.1}s → {:?}",
        rows,
        start.elapsed().as_secs_f64(),
        dest_path
    );
    Ok(rows)
}

/// Unpack and validate a backup archive
pub fn read_backup<R: Read>(reader: R) -> Result<Snapshot, BackupError> {
    let gz = flate2::read::GzDecoder::new(reader);
    let mut archive = tar::Archive::new(gz);

    for entry in archive
        .entries()
        .map_err(|e| BackupError::Invalid(format!("not a backup archive: {}", e)))?
    {
        let mut entry = entry.map_err(|e| BackupError::Invalid(format!("unreadable archive entry: {}", e)))?;
        let is_snapshot = entry
            .path()
            .map(|p| p == Path::new(SNAPSHOT_ENTRY))
            .unwrap_or(false);
        if !is_snapshot {
            continue;
        }

        let mut raw = Vec::new();
        entry.read_to_end(&mut raw)?;
        let snapshot: Snapshot = serde_json::from_slice(&raw)?;
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(BackupError::Invalid(format!(
                "snapshot format {} is newer than supported format {}",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        return Ok(snapshot);
    }

    Err(BackupError::Invalid(format!("missing {}", SNAPSHOT_ENTRY)))
}

/// Upsert a snapshot's rows into the store and describe what was restored.
///
/// With `tenant_id` set, rows belonging to any other tenant are discarded
/// first, so a tenant admin can only ever restore into their own workspace.
/// The restored activity log is trimmed to `activity_cap` entries per tenant.
pub fn restore_snapshot(
    store: &dyn Store,
    mut snapshot: Snapshot,
    tenant_id: Option<&str>,
    activity_cap: usize,
) -> Result<String, BackupError> {
    let start = std::time::Instant::now();
    if let Some(tenant_id) = tenant_id {
        snapshot.data.retain_tenant(tenant_id);
    }

    let summary = store.import_dataset(&snapshot.data, activity_cap)?;
    let msg = format!(
        "Restored {} subscribers, {} payments, {} sales, {} routers, {} packages and {} staff in {:.1}s",
        summary.subscribers,
        summary.payments,
        summary.sales,
        summary.routers,
        summary.packages,
        summary.staff,
        start.elapsed().as_secs_f64()
    );
    log::info!("{}", msg);
    Ok(msg)
}

/// Import a backup file from disk
pub fn import_backup(
    store: &dyn Store,
    src_path: &Path,
    tenant_id: Option<&str>,
    activity_cap: usize,
) -> Result<String, BackupError> {
    log::info!("Starting restore from {:?}", src_path);
    let file = fs::File::open(src_path)?;
    let snapshot = read_backup(file)?;
    restore_snapshot(store, snapshot, tenant_id, activity_cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_store::JsonStore;
    use crate::store::contract;
    use tempfile::tempdir;

    fn seeded() -> (tempfile::TempDir, JsonStore) {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path().to_path_buf()).unwrap();
        store.insert_tenant(&contract::tenant("t1", "one")).unwrap();
        store.insert_tenant(&contract::tenant("t2", "two")).unwrap();
        store.insert_subscriber(&contract::subscriber("t1", "s1", "Ahmad")).unwrap();
        store.insert_subscriber(&contract::subscriber("t2", "s2", "Saeed")).unwrap();
        store.record_payment(&contract::payment("t1", "s1", 80.0, 4)).unwrap();
        (dir, store)
    }

    #[test]
    fn backup_round_trip_through_file() {
        let (dir, source) = seeded();
        let path = dir.path().join("wasla.backup");
        let rows = export_backup(&source, None, &path).unwrap();
        assert_eq!(rows, 5);

        let target_dir = tempdir().unwrap();
        let target = JsonStore::open(target_dir.path().to_path_buf()).unwrap();
        let msg = import_backup(&target, &path, None, 100).unwrap();
        assert!(msg.starts_with("Restored 2 subscribers, 1 payments"));
        assert_eq!(target.get_subscriber("t2", "s2").unwrap().name, "Saeed");
    }

    #[test]
    fn tenant_restore_ignores_other_tenants() {
        let (_dir, source) = seeded();
        let mut buf = Vec::new();
        write_backup(&source, None, &mut buf).unwrap();

        let target_dir = tempdir().unwrap();
        let target = JsonStore::open(target_dir.path().to_path_buf()).unwrap();
        let snapshot = read_backup(buf.as_slice()).unwrap();
        restore_snapshot(&target, snapshot, Some("t1"), 100).unwrap();

        assert_eq!(target.list_subscribers("t1").unwrap().len(), 1);
        assert!(target.list_subscribers("t2").unwrap().is_empty());
        assert!(target.get_tenant("t2").is_err());
    }

    #[test]
    fn tenant_export_is_scoped() {
        let (_dir, source) = seeded();
        let mut buf = Vec::new();
        let rows = write_backup(&source, Some("t2"), &mut buf).unwrap();
        assert_eq!(rows, 2);
        let snapshot = read_backup(buf.as_slice()).unwrap();
        assert_eq!(snapshot.data.subscribers[0].id, "s2");
        assert_eq!(snapshot.format_version, SNAPSHOT_FORMAT_VERSION);
    }

    #[test]
    fn rejects_garbage_and_foreign_archives() {
        let err = read_backup(&b"definitely not gzip"[..]).unwrap_err();
        assert!(matches!(err, BackupError::Invalid(_) | BackupError::Io(_)));

        // a valid tar.gz without a snapshot entry
        let mut buf = Vec::new();
        {
            let gz = flate2::write::GzEncoder::new(&mut buf, flate2::Compression::fast());
            let mut tar = tar::Builder::new(gz);
            let data = b"hello";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            tar.append_data(&mut header, "readme.txt", &data[..]).unwrap();
            tar.into_inner().unwrap().finish().unwrap();
        }
        let err = read_backup(buf.as_slice()).unwrap_err();
        assert!(err.to_string().contains("missing snapshot.json"));
    }
}

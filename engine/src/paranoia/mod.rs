//! Integrity checks, from relational invariants to full end-to-end
//! re-hashing of every stored blob. The engine prefers dying loudly over
//! carrying a corrupted catalog forward, so callers treat any reported
//! violation as fatal.

use std::collections::HashMap;

use futures::TryStreamExt;
use itertools::Itertools;
use shared::constants::SHARE_PREFIX;

use crate::{
    blobpack::read::{expected_sizes, read_blob_verified},
    catalog::{Catalog, Transaction},
    defaults::{Settings, FUTURE_SKEW_SECS, VERIFY_WORKERS},
    log,
    storage::SharedStorage,
};

/// One failed relational check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub check: &'static str,
    pub rows: i64,
}

/// The fixed list of "must return zero rows" queries. Each one verifies an
/// invariant of the data model; a row coming back means the catalog is bad.
const RELATIONAL_CHECKS: &[(&str, &str)] = &[
    (
        "every file content is stored in some blob",
        "select f.hash from files f
         left join blob_entries be on be.hash = f.hash
         where be.hash is null",
    ),
    (
        "no blob entry is orphaned from all files",
        "select be.hash from blob_entries be
         left join files f on f.hash = be.hash
         where f.hash is null",
    ),
    (
        "every blob entry has a sizes row",
        "select be.hash from blob_entries be
         left join sizes s on s.hash = be.hash
         where s.hash is null",
    ),
    (
        "every blob has at least one entry",
        "select b.blob_id from blobs b
         left join blob_entries be on be.blob_id = b.blob_id
         where be.blob_id is null",
    ),
    (
        "every blob is stored in at least one location",
        "select b.blob_id from blobs b
         left join blob_storage bs on bs.blob_id = b.blob_id
         where bs.blob_id is null",
    ),
    (
        "every blob has an entry at offset zero",
        r#"select b.blob_id from blobs b
           where not exists (select 1 from blob_entries be
                             where be.blob_id = b.blob_id and be."offset" = 0)"#,
    ),
    (
        "every encryption key appears under exactly one blob",
        "select encryption_key from blob_entries
         group by encryption_key having count(distinct blob_id) > 1",
    ),
    (
        "non-empty entries have unique offsets within a blob",
        r#"select be.blob_id, be."offset" from blob_entries be
           join sizes s on s.hash = be.hash
           where s.size > 0
           group by be.blob_id, be."offset" having count(*) > 1"#,
    ),
    (
        "at most one zero-length entry exists",
        "select 1 from (select count(*) as c from blob_entries be
                        join sizes s on s.hash = be.hash
                        where s.size = 0)
         where c > 1",
    ),
    (
        "entries are packed contiguously from offset zero",
        r#"select blob_id from blob_entries
           group by blob_id
           having sum(final_size) <> max("offset" + final_size)"#,
    ),
    (
        "no blob reports a non-positive size",
        "select blob_id from blobs where size <= 0",
    ),
    (
        "no content reports a negative size",
        "select hash from sizes where size < 0",
    ),
    (
        "no entry reports a negative size or offset",
        r#"select hash from blob_entries where final_size < 0 or "offset" < 0"#,
    ),
    (
        "closed revisions end after they start",
        r#"select path from files where "end" is not null and "end" <= start"#,
    ),
    (
        "path histories do not overlap and open revisions are last",
        r#"select a.path from files a
           join files b on a.path = b.path and a.start < b.start
           where a."end" is null or a."end" > b.start"#,
    ),
    (
        "no blob mixes shared and per-entry keys",
        "select blob_id from (select blob_id,
                                     count(*) as entries,
                                     count(distinct encryption_key) as keys
                              from blob_entries group by blob_id)
         where keys <> 1 and keys <> entries",
    ),
    (
        "every stored location points at a known blob",
        "select bs.path from blob_storage bs
         left join blobs b on b.blob_id = bs.blob_id
         where b.blob_id is null",
    ),
    (
        "every stored location points at a known storage",
        "select bs.path from blob_storage bs
         left join storage s on s.storage_id = bs.storage_id
         where s.storage_id is null",
    ),
];

/// Padding bounds check, parameterized on the configured knobs. The cast
/// mirrors the integer truncation used when the padding length was sampled.
const PADDING_CHECK: &str = r#"select b.blob_id from blobs b
    join (select blob_id, max("offset" + final_size) as packed
          from blob_entries group by blob_id) p on p.blob_id = b.blob_id
    where (b.size - p.packed) < cast($1 + $2 * p.packed / 100.0 as integer)
       or (b.size - p.packed) > cast($3 + $4 * p.packed / 100.0 as integer)"#;

const FUTURE_START_CHECK: &str = "select path from files where start > $1";

/// Runs every relational check inside the given transaction and returns the
/// violations found. An empty result means the §3 invariants hold.
pub async fn relational_check(
    transaction: &mut Transaction<'_>,
    settings: &Settings,
) -> anyhow::Result<Vec<Violation>> {
    let mut violations = Vec::new();

    for &(check, sql) in RELATIONAL_CHECKS {
        let rows = transaction.raw_rows(sql, &[]).await?;
        if rows > 0 {
            violations.push(Violation { check, rows });
        }
    }

    let rows = transaction
        .raw_rows_with_padding_bounds(
            PADDING_CHECK,
            settings.padding_min_bytes,
            settings.padding_min_percent,
            settings.padding_max_bytes,
            settings.padding_max_percent,
        )
        .await?;
    if rows > 0 {
        violations.push(Violation { check: "padding is within the configured bounds", rows });
    }

    let horizon = Catalog::get_unix_timestamp() + FUTURE_SKEW_SECS;
    let rows = transaction.raw_rows(FUTURE_START_CHECK, &[horizon]).await?;
    if rows > 0 {
        violations.push(Violation { check: "no revision starts in the future", rows });
    }

    Ok(violations)
}

/// Convenience wrapper running the relational checks in their own
/// transaction and failing loudly on any violation.
pub async fn assert_catalog_clean(catalog: &Catalog, settings: &Settings) -> anyhow::Result<()> {
    let mut transaction = catalog.transaction().await?;
    let violations = relational_check(&mut transaction, settings).await?;
    transaction.commit().await?;

    anyhow::ensure!(
        violations.is_empty(),
        "catalog violation: {}",
        violations.iter().map(|v| format!("{} ({} rows)", v.check, v.rows)).join("; ")
    );

    Ok(())
}

/// The outcome of comparing one storage's object listing to the catalog.
#[derive(Debug, Default)]
pub struct StorageReport {
    pub missing: Vec<String>,
    pub mismatched: Vec<String>,
    pub unexpected: Vec<String>,
}

impl StorageReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty() && self.unexpected.is_empty()
    }
}

/// Lists one storage and compares it against the catalog's expected
/// `{path -> (checksum, size)}` map. Unexpected objects are deleted only when
/// asked to. Share files are managed by a separate tool and skipped.
pub async fn check_storage(
    catalog: &Catalog,
    storage: &SharedStorage,
    delete_unexpected: bool,
) -> anyhow::Result<StorageReport> {
    let mut transaction = catalog.transaction().await?;
    let expected: HashMap<String, (String, u64)> = transaction
        .expected_objects(&storage.get_id())
        .await?
        .into_iter()
        .map(|(path, checksum, size)| (path, (checksum, size)))
        .collect();
    transaction.commit().await?;

    let listed = storage.list_blobs().await?;
    let mut report = StorageReport::default();

    let mut seen = HashMap::new();
    for object in &listed {
        seen.insert(object.path.clone(), object);

        match expected.get(&object.path) {
            None => {
                if object.path.starts_with(SHARE_PREFIX) {
                    continue;
                }
                log!("[paranoia] unexpected object {} in storage", object.path);
                report.unexpected.push(object.path.clone());

                if delete_unexpected {
                    storage.delete_blob(&object.path).await?;
                    log!("[paranoia] deleted unexpected object {}", object.path);
                }
            }
            Some((checksum, size)) => {
                let checksum_ok = checksum.is_empty() || checksum == &object.checksum;
                if !checksum_ok || *size != object.size {
                    log!("[paranoia] object {} does not match the catalog", object.path);
                    report.mismatched.push(object.path.clone());
                }
            }
        }
    }

    for path in expected.keys() {
        if !seen.contains_key(path) {
            log!("[paranoia] object {} is missing from storage", path);
            report.missing.push(path.clone());
        }
    }

    report.missing.sort();
    report.mismatched.sort();
    report.unexpected.sort();

    Ok(report)
}

/// Downloads and end-to-end verifies every blob in the catalog. Returns the
/// number of blobs checked; any damage panics the process.
pub async fn verify_all_blobs(
    catalog: &Catalog,
    storages: &[SharedStorage],
) -> anyhow::Result<usize> {
    let by_id: HashMap<_, _> =
        storages.iter().map(|storage| (storage.get_id(), storage.clone())).collect();
    let blob_ids = catalog.all_blob_ids().await?;
    let total = blob_ids.len();

    futures::stream::iter(blob_ids.into_iter().map(anyhow::Ok))
        .try_for_each_concurrent(VERIFY_WORKERS, |blob_id| {
            let by_id = &by_id;
            async move {
                let blob = catalog
                    .get_blob(&blob_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("blob {} vanished", hex::encode(blob_id)))?;
                let entries = catalog.entries_for_blob(&blob_id).await?;
                let sizes = expected_sizes(catalog, &entries).await?;

                let location = catalog
                    .locations_for_blob(&blob_id)
                    .await?
                    .into_iter()
                    .find(|location| by_id.contains_key(&location.storage_id))
                    .ok_or_else(|| {
                        anyhow::anyhow!("no reachable storage holds blob {}", hex::encode(blob_id))
                    })?;

                let storage = &by_id[&location.storage_id];
                let reader = storage.download_section(&location.path, 0, blob.size).await?;
                read_blob_verified(reader, &blob, &entries, &sizes).await?;

                Ok(())
            }
        })
        .await?;

    log!("[paranoia] verified {} blobs end to end", total);
    Ok(total)
}

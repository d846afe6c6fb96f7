//! File growth past the initial mapping, online copies, and whole-file
//! consistency under a mixed workload.

use burrowdb::Db;
use tempfile::TempDir;

fn open_db() -> (TempDir, Db) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("data.db"), 0o600).unwrap();
    (dir, db)
}

fn value_for(i: u32, len: usize) -> Vec<u8> {
    let mut value = vec![0u8; len];
    value[..4].copy_from_slice(&i.to_le_bytes());
    value
}

#[test]
fn grows_past_the_initial_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    let db = Db::open(&path, 0o600).unwrap();

    // ~6 MiB of values pushes the file past the 4 MiB minimum mapping.
    const COUNT: u32 = 768;
    const VALUE_LEN: usize = 8192;
    db.update(|tx| {
        let b = tx.create_bucket("bulk")?;
        for i in 0..COUNT {
            b.put(format!("key{i:06}").as_bytes(), &value_for(i, VALUE_LEN))?;
        }
        Ok(())
    })
    .unwrap();

    assert!(std::fs::metadata(&path).unwrap().len() > 4 << 20);

    db.view(|tx| {
        let b = tx.bucket("bulk")?;
        for i in (0..COUNT).step_by(97) {
            assert_eq!(
                b.get(format!("key{i:06}").as_bytes())?,
                Some(&value_for(i, VALUE_LEN)[..])
            );
        }
        Ok(())
    })
    .unwrap();
    db.check().unwrap();

    // Survives a reopen with the grown file.
    db.close().unwrap();
    drop(db);
    let db = Db::open(&path, 0o600).unwrap();
    db.view(|tx| {
        assert_eq!(
            tx.bucket("bulk")?.get(b"key000000")?,
            Some(&value_for(0, VALUE_LEN)[..])
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn copy_file_produces_an_equal_database() {
    let (dir, db) = open_db();

    db.update(|tx| {
        let b = tx.create_bucket("b")?;
        for i in 0..300u32 {
            b.put(format!("key{i:04}").as_bytes(), &i.to_le_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    let copy_path = dir.path().join("copy.db");
    let copied = db.copy_file(&copy_path).unwrap();
    assert_eq!(std::fs::metadata(&copy_path).unwrap().len(), copied);

    let copy = Db::open(&copy_path, 0o600).unwrap();
    copy.view(|tx| {
        let b = tx.bucket("b")?;
        for i in 0..300u32 {
            assert_eq!(
                b.get(format!("key{i:04}").as_bytes())?,
                Some(&i.to_le_bytes()[..])
            );
        }
        Ok(())
    })
    .unwrap();
    copy.check().unwrap();
}

#[test]
fn copy_is_safe_while_writing() {
    let (dir, db) = open_db();

    db.update(|tx| tx.create_bucket("b")?.put(b"k", b"v")).unwrap();

    // The copy pins a read transaction; a commit in between generations
    // must not disturb it.
    let copy_path = dir.path().join("copy.db");
    db.copy_file(&copy_path).unwrap();
    db.update(|tx| tx.bucket("b")?.put(b"k", b"v2")).unwrap();

    let copy = Db::open(&copy_path, 0o600).unwrap();
    copy.view(|tx| {
        assert_eq!(tx.bucket("b")?.get(b"k")?, Some(&b"v"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn mixed_workload_stays_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    let db = Db::open(&path, 0o600).unwrap();

    db.update(|tx| {
        let a = tx.create_bucket("alpha")?;
        for i in 0..500u32 {
            a.put(format!("key{i:04}").as_bytes(), &value_for(i, 32))?;
        }
        let b = tx.create_bucket("beta")?;
        for i in 0..100u32 {
            b.put(format!("item{i:04}").as_bytes(), b"payload")?;
        }
        Ok(())
    })
    .unwrap();
    db.check().unwrap();

    // Delete most of alpha in batches so rebalancing merges nodes across
    // several commits.
    for batch in 0..4u32 {
        db.update(|tx| {
            let a = tx.bucket("alpha")?;
            for i in (batch * 100)..(batch * 100 + 100) {
                a.delete(format!("key{i:04}").as_bytes())?;
            }
            Ok(())
        })
        .unwrap();
        db.check().unwrap();
    }

    db.view(|tx| {
        let a = tx.bucket("alpha")?;
        let mut remaining = 0;
        a.for_each(|_, _| {
            remaining += 1;
            Ok(())
        })?;
        assert_eq!(remaining, 100);
        for i in 400..500u32 {
            assert_eq!(
                a.get(format!("key{i:04}").as_bytes())?,
                Some(&value_for(i, 32)[..])
            );
        }
        Ok(())
    })
    .unwrap();

    // Reopen and verify the same state from disk.
    db.close().unwrap();
    drop(db);
    let db = Db::open(&path, 0o600).unwrap();
    db.view(|tx| {
        let b = tx.bucket("beta")?;
        assert_eq!(b.get(b"item0099")?, Some(&b"payload"[..]));
        Ok(())
    })
    .unwrap();
    db.check().unwrap();
}

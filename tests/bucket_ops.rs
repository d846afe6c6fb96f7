//! Bucket CRUD behavior across transactions, including the validation
//! errors of the library boundary.

use burrowdb::{Db, Error};
use tempfile::TempDir;

fn open_db() -> (TempDir, Db) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("data.db"), 0o600).unwrap();
    (dir, db)
}

#[test]
fn missing_bucket_is_not_found() {
    let (_dir, db) = open_db();

    let result = db.view(|tx| match tx.bucket("widgets") {
        Err(Error::BucketNotFound) => Ok(()),
        Err(err) => Err(err),
        Ok(_) => Err(Error::BucketExists),
    });
    assert!(result.is_ok());
}

#[test]
fn put_then_get_across_transactions() {
    let (_dir, db) = open_db();

    db.update(|tx| {
        let widgets = tx.create_bucket("widgets")?;
        widgets.put(b"a", b"1")
    })
    .unwrap();

    db.view(|tx| {
        let widgets = tx.bucket("widgets")?;
        assert_eq!(widgets.get(b"a")?, Some(&b"1"[..]));
        assert_eq!(widgets.get(b"missing")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn overwrite_replaces_value() {
    let (_dir, db) = open_db();

    db.update(|tx| {
        let b = tx.create_bucket("b")?;
        b.put(b"foo", b"0")
    })
    .unwrap();
    db.update(|tx| tx.bucket("b")?.put(b"foo", b"3")).unwrap();

    db.view(|tx| {
        assert_eq!(tx.bucket("b")?.get(b"foo")?, Some(&b"3"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_is_idempotent() {
    let (_dir, db) = open_db();

    db.update(|tx| {
        let b = tx.create_bucket("b")?;
        b.put(b"a", b"1")?;
        b.put(b"z", b"26")
    })
    .unwrap();

    db.update(|tx| tx.bucket("b")?.delete(b"a")).unwrap();
    db.view(|tx| {
        assert_eq!(tx.bucket("b")?.get(b"a")?, None);
        assert_eq!(tx.bucket("b")?.get(b"z")?, Some(&b"26"[..]));
        Ok(())
    })
    .unwrap();

    // Deleting a missing key is still a successful no-op.
    db.update(|tx| tx.bucket("b")?.delete(b"a")).unwrap();
    db.view(|tx| {
        assert_eq!(tx.bucket("b")?.get(b"z")?, Some(&b"26"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn bucket_name_validation() {
    let (_dir, db) = open_db();

    let result = db.update(|tx| tx.create_bucket("").map(|_| ()));
    assert!(matches!(result, Err(Error::BucketNameRequired)));

    let long = "x".repeat(256);
    let result = db.update(|tx| tx.create_bucket(&long).map(|_| ()));
    assert!(matches!(result, Err(Error::BucketNameTooLarge)));

    db.update(|tx| tx.create_bucket("dup").map(|_| ())).unwrap();
    let result = db.update(|tx| tx.create_bucket("dup").map(|_| ()));
    assert!(matches!(result, Err(Error::BucketExists)));
}

#[test]
fn key_and_value_validation() {
    let (_dir, db) = open_db();
    db.update(|tx| tx.create_bucket("b").map(|_| ())).unwrap();

    let result = db.update(|tx| tx.bucket("b")?.put(b"", b"v"));
    assert!(matches!(result, Err(Error::KeyRequired)));

    let huge_key = vec![0u8; burrowdb::MAX_KEY_SIZE + 1];
    let result = db.update(|tx| tx.bucket("b")?.put(&huge_key, b"v"));
    assert!(matches!(result, Err(Error::KeyTooLarge)));
}

#[test]
fn read_only_transaction_rejects_writes() {
    let (_dir, db) = open_db();
    db.update(|tx| tx.create_bucket("b").map(|_| ())).unwrap();

    let result = db.view(|tx| tx.bucket("b")?.put(b"k", b"v"));
    assert!(matches!(result, Err(Error::BucketNotWritable)));

    let result = db.view(|tx| tx.bucket("b")?.delete(b"k"));
    assert!(matches!(result, Err(Error::BucketNotWritable)));

    let result = db.view(|tx| tx.create_bucket("c").map(|_| ()));
    assert!(matches!(result, Err(Error::TxNotWritable)));
}

#[test]
fn managed_transactions_reject_manual_commit() {
    let (_dir, db) = open_db();

    db.update(|tx| {
        assert!(matches!(tx.commit(), Err(Error::ManagedTx)));
        assert!(matches!(tx.rollback(), Err(Error::ManagedTx)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn next_sequence_increments_and_persists() {
    let (_dir, db) = open_db();

    db.update(|tx| {
        let b = tx.create_bucket("seq")?;
        assert_eq!(b.next_sequence()?, 1);
        assert_eq!(b.next_sequence()?, 2);
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        assert_eq!(tx.bucket("seq")?.next_sequence()?, 3);
        Ok(())
    })
    .unwrap();
}

#[test]
fn for_each_visits_keys_in_order() {
    let (_dir, db) = open_db();

    db.update(|tx| {
        let b = tx.create_bucket("b")?;
        b.put(b"foo", b"0")?;
        b.put(b"baz", b"2")?;
        b.put(b"bar", b"1")
    })
    .unwrap();

    db.view(|tx| {
        let mut seen = Vec::new();
        tx.bucket("b")?.for_each(|k, v| {
            seen.push((k.to_vec(), v.to_vec()));
            Ok(())
        })?;
        assert_eq!(
            seen,
            vec![
                (b"bar".to_vec(), b"1".to_vec()),
                (b"baz".to_vec(), b"2".to_vec()),
                (b"foo".to_vec(), b"0".to_vec()),
            ]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_first_next_seek() {
    let (_dir, db) = open_db();

    db.update(|tx| {
        let b = tx.create_bucket("b")?;
        for key in ["b", "d", "f"] {
            b.put(key.as_bytes(), key.as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let b = tx.bucket("b")?;
        let mut c = b.cursor()?;

        assert_eq!(c.first()?, Some((&b"b"[..], &b"b"[..])));
        assert_eq!(c.next()?, Some((&b"d"[..], &b"d"[..])));
        assert_eq!(c.next()?, Some((&b"f"[..], &b"f"[..])));
        assert_eq!(c.next()?, None);

        // Seek lands on the exact key, or the next key after it.
        assert_eq!(c.seek(b"d")?, Some((&b"d"[..], &b"d"[..])));
        assert_eq!(c.seek(b"c")?, Some((&b"d"[..], &b"d"[..])));
        assert_eq!(c.seek(b"zzz")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_bucket_frees_its_tree() {
    let (_dir, db) = open_db();

    db.update(|tx| {
        let b = tx.create_bucket("doomed")?;
        for i in 0..50u32 {
            b.put(format!("key{i:04}").as_bytes(), &i.to_le_bytes())?;
        }
        tx.create_bucket("kept")?.put(b"a", b"1")
    })
    .unwrap();

    db.update(|tx| tx.delete_bucket("doomed")).unwrap();

    let result = db.view(|tx| match tx.bucket("doomed") {
        Err(Error::BucketNotFound) => Ok(()),
        Err(err) => Err(err),
        Ok(_) => Err(Error::BucketExists),
    });
    assert!(result.is_ok());

    db.view(|tx| {
        assert_eq!(tx.bucket("kept")?.get(b"a")?, Some(&b"1"[..]));
        Ok(())
    })
    .unwrap();
    db.check().unwrap();
}

#[test]
fn buckets_lists_names_in_order() {
    let (_dir, db) = open_db();

    db.update(|tx| {
        tx.create_bucket("beta")?;
        tx.create_bucket("alpha")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        assert_eq!(tx.buckets()?, vec!["alpha".to_string(), "beta".to_string()]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn bucket_stat_reports_pages_and_keys() {
    let (_dir, db) = open_db();

    db.update(|tx| {
        let b = tx.create_bucket("b")?;
        for i in 0..10u32 {
            b.put(format!("k{i}").as_bytes(), b"value")?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let stat = tx.bucket("b")?.stat()?;
        assert_eq!(stat.key_count, 10);
        assert_eq!(stat.leaf_page_count, 1);
        assert_eq!(stat.max_depth, 1);
        Ok(())
    })
    .unwrap();

    let stats = db.stats();
    assert!(stats.tx_stats.page_count > 0);
    assert!(stats.tx_stats.spill > 0);
}

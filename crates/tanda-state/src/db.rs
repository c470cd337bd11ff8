use std::path::Path;

use sled::Transactional;

use tanda_core::{
    AuditEvent, Error, Group, GroupId, Lease, LockKind, Member, MemberId, Transaction,
    TransactionId,
};

/// Persistent state database backed by sled (pure-Rust, no C/LLVM deps).
///
/// Named trees:
///   group               — GroupId bytes                  → bincode(Group)
///   member              — MemberId bytes                 → bincode(Member)
///   member_by_group     — GroupId bytes ++ MemberId bytes → []  (scan index)
///   transaction         — TransactionId bytes             → bincode(Transaction)
///   transaction_by_group— GroupId bytes ++ TxId bytes     → []  (scan index)
///   lease               — "{kind}:{resource}" utf8        → bincode(Lease)
///   audit_event         — event uuid bytes                → bincode(AuditEvent)
///
/// Conditional ("CAS") writes on `group`/`member`/`transaction` use
/// `sled::Tree::compare_and_swap`: a caller passes the value it last
/// observed, and the write only lands if the stored bytes still match. A
/// mismatch is surfaced as `Error::Stale` with zero rows affected, matching
/// the `StateStore` port's `write(...) -> rows_affected` contract described
/// in SPEC_FULL.md §6.
pub struct StateDb {
    _db: sled::Db,
    group: sled::Tree,
    member: sled::Tree,
    member_by_group: sled::Tree,
    transaction: sled::Tree,
    transaction_by_group: sled::Tree,
    lease: sled::Tree,
    audit_event: sled::Tree,
}

fn storage_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Storage(e.to_string())
}

fn ser<T: serde::Serialize>(v: &T) -> Result<Vec<u8>, Error> {
    bincode::serialize(v).map_err(|e| Error::Serialization(e.to_string()))
}

fn de<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

fn lease_key(kind: LockKind, resource: &str) -> Vec<u8> {
    format!("{}:{}", kind.as_str(), resource).into_bytes()
}

impl StateDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let db = sled::open(path).map_err(storage_err)?;
        let group = db.open_tree("group").map_err(storage_err)?;
        let member = db.open_tree("member").map_err(storage_err)?;
        let member_by_group = db.open_tree("member_by_group").map_err(storage_err)?;
        let transaction = db.open_tree("transaction").map_err(storage_err)?;
        let transaction_by_group = db.open_tree("transaction_by_group").map_err(storage_err)?;
        let lease = db.open_tree("lease").map_err(storage_err)?;
        let audit_event = db.open_tree("audit_event").map_err(storage_err)?;
        Ok(Self {
            _db: db,
            group,
            member,
            member_by_group,
            transaction,
            transaction_by_group,
            lease,
            audit_event,
        })
    }

    pub fn flush(&self) -> Result<(), Error> {
        self._db.flush().map_err(storage_err)?;
        Ok(())
    }

    // ── Group ────────────────────────────────────────────────────────────

    pub fn get_group(&self, id: &GroupId) -> Result<Option<Group>, Error> {
        match self.group.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_group(&self, group: &Group) -> Result<(), Error> {
        let bytes = ser(group)?;
        self.group.insert(group.id.as_bytes(), bytes).map_err(storage_err)?;
        Ok(())
    }

    /// Conditional write: succeeds only if the currently stored group is
    /// byte-identical to `expected`. Returns `false` (0 rows affected) on
    /// mismatch — the caller should treat this as `Error::Stale`.
    pub fn cas_put_group(&self, expected: &Group, new: &Group) -> Result<bool, Error> {
        let old_bytes = ser(expected)?;
        let new_bytes = ser(new)?;
        match self
            .group
            .compare_and_swap(expected.id.as_bytes(), Some(old_bytes), Some(new_bytes))
            .map_err(storage_err)?
        {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Scans every group row in the store. Used by the consistency auditor,
    /// which must examine groups system-wide rather than one at a time.
    pub fn iter_groups(&self) -> Result<Vec<Group>, Error> {
        let mut out = Vec::new();
        for kv in self.group.iter() {
            let (_, bytes) = kv.map_err(storage_err)?;
            out.push(de(&bytes)?);
        }
        Ok(out)
    }

    // ── Member ───────────────────────────────────────────────────────────

    pub fn get_member(&self, id: &MemberId) -> Result<Option<Member>, Error> {
        match self.member.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_member(&self, member: &Member) -> Result<(), Error> {
        let bytes = ser(member)?;
        self.member.insert(member.id.as_bytes(), bytes).map_err(storage_err)?;
        let mut idx_key = member.group_id.as_bytes().to_vec();
        idx_key.extend_from_slice(member.id.as_bytes());
        self.member_by_group.insert(idx_key, &[]).map_err(storage_err)?;
        Ok(())
    }

    pub fn cas_put_member(&self, expected: &Member, new: &Member) -> Result<bool, Error> {
        let old_bytes = ser(expected)?;
        let new_bytes = ser(new)?;
        match self
            .member
            .compare_and_swap(expected.id.as_bytes(), Some(old_bytes), Some(new_bytes.clone()))
            .map_err(storage_err)?
        {
            Ok(()) => {
                let mut idx_key = new.group_id.as_bytes().to_vec();
                idx_key.extend_from_slice(new.id.as_bytes());
                self.member_by_group.insert(idx_key, &[]).map_err(storage_err)?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    pub fn iter_members_by_group(&self, group_id: &GroupId) -> Result<Vec<Member>, Error> {
        let mut out = Vec::new();
        let prefix = group_id.as_bytes().to_vec();
        for kv in self.member_by_group.scan_prefix(&prefix) {
            let (key, _) = kv.map_err(storage_err)?;
            let member_id_bytes = &key[prefix.len()..];
            if let Some(bytes) = self.member.get(member_id_bytes).map_err(storage_err)? {
                out.push(de(&bytes)?);
            }
        }
        Ok(out)
    }

    /// Scans every member row in the store, regardless of group. Used by
    /// the consistency auditor to find orphaned members (group deleted or
    /// never existed) that a by-group scan would never surface.
    pub fn iter_all_members(&self) -> Result<Vec<Member>, Error> {
        let mut out = Vec::new();
        for kv in self.member.iter() {
            let (_, bytes) = kv.map_err(storage_err)?;
            out.push(de(&bytes)?);
        }
        Ok(out)
    }

    // ── Transaction ──────────────────────────────────────────────────────

    pub fn get_transaction(&self, id: &TransactionId) -> Result<Option<Transaction>, Error> {
        match self.transaction.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_transaction(&self, tx: &Transaction) -> Result<(), Error> {
        let bytes = ser(tx)?;
        self.transaction.insert(tx.id.as_bytes(), bytes).map_err(storage_err)?;
        let mut idx_key = tx.group_id.as_bytes().to_vec();
        idx_key.extend_from_slice(tx.id.as_bytes());
        self.transaction_by_group.insert(idx_key, &[]).map_err(storage_err)?;
        Ok(())
    }

    pub fn cas_put_transaction(&self, expected: &Transaction, new: &Transaction) -> Result<bool, Error> {
        let old_bytes = ser(expected)?;
        let new_bytes = ser(new)?;
        match self
            .transaction
            .compare_and_swap(expected.id.as_bytes(), Some(old_bytes), Some(new_bytes))
            .map_err(storage_err)?
        {
            Ok(()) => {
                let mut idx_key = new.group_id.as_bytes().to_vec();
                idx_key.extend_from_slice(new.id.as_bytes());
                self.transaction_by_group.insert(idx_key, &[]).map_err(storage_err)?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    pub fn iter_transactions_by_group(&self, group_id: &GroupId) -> Result<Vec<Transaction>, Error> {
        let mut out = Vec::new();
        let prefix = group_id.as_bytes().to_vec();
        for kv in self.transaction_by_group.scan_prefix(&prefix) {
            let (key, _) = kv.map_err(storage_err)?;
            let tx_id_bytes = &key[prefix.len()..];
            if let Some(bytes) = self.transaction.get(tx_id_bytes).map_err(storage_err)? {
                out.push(de(&bytes)?);
            }
        }
        Ok(out)
    }

    /// Scans every transaction row in the store, regardless of group.
    pub fn iter_all_transactions(&self) -> Result<Vec<Transaction>, Error> {
        let mut out = Vec::new();
        for kv in self.transaction.iter() {
            let (_, bytes) = kv.map_err(storage_err)?;
            out.push(de(&bytes)?);
        }
        Ok(out)
    }

    // ── Lease ────────────────────────────────────────────────────────────

    pub fn get_lease(&self, kind: LockKind, resource: &str) -> Result<Option<Lease>, Error> {
        match self.lease.get(lease_key(kind, resource)).map_err(storage_err)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Inserts a lease only if no row currently exists for (kind, resource).
    /// Returns `false` if one is already present (caller should surface
    /// `Error::AlreadyHeld`), matching the at-most-one-lease invariant.
    pub fn put_lease_if_absent(&self, lease: &Lease) -> Result<bool, Error> {
        let key = lease_key(lease.kind, &lease.resource);
        let bytes = ser(lease)?;
        match self.lease.compare_and_swap(key, None::<Vec<u8>>, Some(bytes)).map_err(storage_err)? {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Overwrites an expired lease with a new claim, predicated on the
    /// expired row still being exactly what was read.
    pub fn cas_replace_lease(&self, expected: &Lease, new: &Lease) -> Result<bool, Error> {
        let key = lease_key(expected.kind, &expected.resource);
        let old_bytes = ser(expected)?;
        let new_bytes = ser(new)?;
        match self.lease.compare_and_swap(key, Some(old_bytes), Some(new_bytes)).map_err(storage_err)? {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Deletes a lease only if its holder_id still matches, so a caller can
    /// never release a lease that has since been reassigned.
    pub fn delete_lease_if_holder(&self, kind: LockKind, resource: &str, holder_id: &str) -> Result<bool, Error> {
        let key = lease_key(kind, resource);
        match self.lease.get(&key).map_err(storage_err)? {
            Some(bytes) => {
                let current: Lease = de(&bytes)?;
                if current.holder_id != holder_id {
                    return Ok(false);
                }
                match self.lease.compare_and_swap(key, Some(bytes), None::<Vec<u8>>).map_err(storage_err)? {
                    Ok(()) => Ok(true),
                    Err(_) => Ok(false),
                }
            }
            None => Ok(false),
        }
    }

    pub fn iter_expired_leases(&self, now: tanda_core::Timestamp) -> Result<Vec<Lease>, Error> {
        let mut out = Vec::new();
        for kv in self.lease.iter() {
            let (_, bytes) = kv.map_err(storage_err)?;
            let lease: Lease = de(&bytes)?;
            if lease.is_expired(now) {
                out.push(lease);
            }
        }
        Ok(out)
    }

    pub fn delete_lease_key(&self, kind: LockKind, resource: &str) -> Result<(), Error> {
        self.lease.remove(lease_key(kind, resource)).map_err(storage_err)?;
        Ok(())
    }

    // ── Cycle close (atomic multi-tree write) ───────────────────────────

    /// Writes the new `Group` row, every updated `Member` row, and every
    /// `deposit_return` `Transaction` row as a single sled transaction
    /// spanning the `group`, `member`, and `transaction` trees: either all
    /// of cycle close's step 2-4 writes land, or none do, so no partial
    /// return state is ever visible to a reader (SPEC_FULL.md §4.6 step 5).
    pub fn close_cycle_atomically(
        &self,
        new_group: &Group,
        member_updates: &[Member],
        return_txs: &[Transaction],
    ) -> Result<(), Error> {
        let trees = (&self.group, &self.member, &self.transaction);
        trees
            .transaction(|(gt, mt, tt)| {
                let group_bytes = bincode::serialize(new_group)
                    .map_err(|e| sled::transaction::ConflictableTransactionError::Abort(Error::Serialization(e.to_string())))?;
                gt.insert(new_group.id.as_bytes(), group_bytes)?;

                for m in member_updates {
                    let bytes = bincode::serialize(m)
                        .map_err(|e| sled::transaction::ConflictableTransactionError::Abort(Error::Serialization(e.to_string())))?;
                    mt.insert(m.id.as_bytes(), bytes)?;
                }

                for tx in return_txs {
                    let bytes = bincode::serialize(tx)
                        .map_err(|e| sled::transaction::ConflictableTransactionError::Abort(Error::Serialization(e.to_string())))?;
                    tt.insert(tx.id.as_bytes(), bytes)?;
                }

                Ok(())
            })
            .map_err(|e: sled::transaction::TransactionError<Error>| match e {
                sled::transaction::TransactionError::Abort(err) => err,
                sled::transaction::TransactionError::Storage(se) => Error::Storage(se.to_string()),
            })?;

        // The group_id/tx_id scan indices are advisory and rebuildable; they
        // are maintained best-effort outside the atomic write.
        for tx in return_txs {
            let mut idx_key = tx.group_id.as_bytes().to_vec();
            idx_key.extend_from_slice(tx.id.as_bytes());
            self.transaction_by_group.insert(idx_key, &[]).map_err(storage_err)?;
        }
        Ok(())
    }

    // ── Audit log ────────────────────────────────────────────────────────

    pub fn append_audit_event(&self, event: &AuditEvent) -> Result<(), Error> {
        let bytes = ser(event)?;
        self.audit_event.insert(event.id.as_bytes(), bytes).map_err(storage_err)?;
        Ok(())
    }

    pub fn iter_audit_events(&self) -> Result<Vec<AuditEvent>, Error> {
        let mut out = Vec::new();
        for kv in self.audit_event.iter() {
            let (_, bytes) = kv.map_err(storage_err)?;
            out.push(de(&bytes)?);
        }
        Ok(out)
    }
}

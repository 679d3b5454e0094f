use crate::{hash::default_hash, Record};
use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::{Hash, Hasher},
    sync::Arc,
};

/// Identity of a group: the projection of an input record onto the
/// configured key fields.
///
/// Keys are immutable and cheap to clone.  The xxh3 fingerprint of the
/// projection is computed once at construction and reused for hashing and
/// shard selection.
#[derive(Clone)]
pub struct GroupKey {
    record: Arc<Record>,
    fingerprint: u64,
}

impl GroupKey {
    /// Projects `record` onto `key_fields`.  Fields missing from `record`
    /// are left out of the key.
    pub fn project<S>(record: &Record, key_fields: &[S]) -> Self
    where
        S: AsRef<str>,
    {
        Self::from_record(record.project(key_fields))
    }

    /// Uses `record` as a key as is.
    pub fn from_record(record: Record) -> Self {
        let fingerprint = default_hash(&record);
        Self {
            record: Arc::new(record),
            fingerprint,
        }
    }

    pub fn as_record(&self) -> &Record {
        &self.record
    }

    /// Returns a deep copy of the key fields.
    pub fn to_record(&self) -> Record {
        (*self.record).clone()
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
            && (Arc::ptr_eq(&self.record, &other.record) || self.record == other.record)
    }
}

impl Eq for GroupKey {}

impl Hash for GroupKey {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        state.write_u64(self.fingerprint);
    }
}

impl Debug for GroupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GroupKey").field(&*self.record).finish()
    }
}

impl Display for GroupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&*self.record, f)
    }
}

#[cfg(test)]
mod test {
    use super::GroupKey;
    use crate::record;

    #[test]
    fn keys_compare_by_projection() {
        let k1 = GroupKey::project(&record! { "text" => "two", "n" => 1 }, &["text"]);
        let k2 = GroupKey::project(&record! { "n" => 2, "text" => "two" }, &["text"]);
        let k3 = GroupKey::project(&record! { "text" => "three" }, &["text"]);

        assert_eq!(k1, k2);
        assert_eq!(k1.fingerprint(), k2.fingerprint());
        assert_ne!(k1, k3);
        assert_eq!(k1.to_record(), record! { "text" => "two" });
    }

    #[test]
    fn missing_fields_are_omitted() {
        let k1 = GroupKey::project(&record! { "a" => 1 }, &["a", "b"]);
        let k2 = GroupKey::project(&record! { "a" => 1, "c" => 3 }, &["a", "b"]);
        let k3 = GroupKey::project(&record! { "a" => 1, "b" => 2 }, &["a", "b"]);

        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1.as_record().len(), 1);
    }
}

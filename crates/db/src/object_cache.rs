// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The in-memory object graph cache: per-kind maps from (object, field) - or
//! (object, field, writing system) for multilingual alternates - to values.
//!
//! Key presence is the "loaded" bit. The stored value carries present-or-null
//! separately: an atomic reference caches `None` for "loaded, and it is null",
//! and a vector caches the empty vec for "loaded, and it is empty". That keeps
//! "cached as empty" and "never loaded" distinguishable everywhere.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;

use ahash::AHasher;
use cellar_common::model::ids::{FLID_CLASS, FLID_GUID, FLID_OWNER, FLID_OWN_FLID, FLID_OWN_ORD};
use cellar_common::{ClassId, FieldId, Hvo, RichString, TextProps, WsId};
use uuid::Uuid;

use crate::CacheStats;

type Map<K, V> = HashMap<K, V, BuildHasherDefault<AHasher>>;

type Key = (Hvo, FieldId);
type MlKey = (Hvo, FieldId, WsId);

/// A change to an externally observable property value. For vector
/// properties, `iv_min`/`cv_ins`/`cv_del` describe the splice; for scalars
/// they are 0/0/0 by convention. A freshly-loaded (previously uncached)
/// vector reports `cv_del = 0` - nothing observable was there before.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropChange {
    pub hvo: Hvo,
    pub tag: FieldId,
    pub iv_min: usize,
    pub cv_ins: usize,
    pub cv_del: usize,
}

/// Dependent views register one of these to invalidate on cache writes.
pub trait ChangeListener {
    fn prop_changed(&mut self, change: &PropChange);
}

#[derive(Default)]
pub struct ObjectGraphCache {
    ints: Map<Key, i64>,
    int64s: Map<Key, i64>,
    guids: Map<Key, Uuid>,
    binaries: Map<Key, Vec<u8>>,
    strings: Map<Key, RichString>,
    unicodes: Map<Key, String>,
    multi_strings: Map<MlKey, RichString>,
    multi_unicodes: Map<MlKey, String>,
    objects: Map<Key, Option<Hvo>>,
    vectors: Map<Key, Vec<Hvo>>,
    text_props: Map<Key, TextProps>,
    /// Opaque per-object row timestamps, compared but never decoded.
    timestamps: Map<Hvo, Vec<u8>>,
    /// Out-of-band "extra" strings carried by individual reference-sequence
    /// entries, keyed by (source, field, destination).
    rel_extras: Map<(Hvo, FieldId, Hvo), String>,

    pub stats: CacheStats,
}

impl ObjectGraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn hit_or_miss<T>(&self, v: Option<T>) -> Option<T> {
        if v.is_some() {
            self.stats.hit();
        } else {
            self.stats.miss();
        }
        v
    }

    // Scalar kinds. Get returns None for "never loaded"; the inner value is
    // the loaded state.

    pub fn get_int(&self, hvo: Hvo, tag: FieldId) -> Option<i64> {
        self.hit_or_miss(self.ints.get(&(hvo, tag)).copied())
    }

    pub fn set_int(&mut self, hvo: Hvo, tag: FieldId, n: i64) {
        self.ints.insert((hvo, tag), n);
    }

    pub fn get_int64(&self, hvo: Hvo, tag: FieldId) -> Option<i64> {
        self.hit_or_miss(self.int64s.get(&(hvo, tag)).copied())
    }

    pub fn set_int64(&mut self, hvo: Hvo, tag: FieldId, n: i64) {
        self.int64s.insert((hvo, tag), n);
    }

    pub fn get_guid(&self, hvo: Hvo, tag: FieldId) -> Option<Uuid> {
        self.hit_or_miss(self.guids.get(&(hvo, tag)).copied())
    }

    pub fn set_guid(&mut self, hvo: Hvo, tag: FieldId, guid: Uuid) {
        self.guids.insert((hvo, tag), guid);
    }

    pub fn get_binary(&self, hvo: Hvo, tag: FieldId) -> Option<&Vec<u8>> {
        self.hit_or_miss(self.binaries.get(&(hvo, tag)))
    }

    pub fn set_binary(&mut self, hvo: Hvo, tag: FieldId, bytes: Vec<u8>) {
        self.binaries.insert((hvo, tag), bytes);
    }

    pub fn get_string(&self, hvo: Hvo, tag: FieldId) -> Option<&RichString> {
        self.hit_or_miss(self.strings.get(&(hvo, tag)))
    }

    pub fn set_string(&mut self, hvo: Hvo, tag: FieldId, s: RichString) {
        self.strings.insert((hvo, tag), s);
    }

    pub fn get_unicode(&self, hvo: Hvo, tag: FieldId) -> Option<&String> {
        self.hit_or_miss(self.unicodes.get(&(hvo, tag)))
    }

    pub fn set_unicode(&mut self, hvo: Hvo, tag: FieldId, s: String) {
        self.unicodes.insert((hvo, tag), s);
    }

    pub fn get_multi_string(&self, hvo: Hvo, tag: FieldId, ws: WsId) -> Option<&RichString> {
        self.hit_or_miss(self.multi_strings.get(&(hvo, tag, ws)))
    }

    pub fn set_multi_string(&mut self, hvo: Hvo, tag: FieldId, ws: WsId, s: RichString) {
        self.multi_strings.insert((hvo, tag, ws), s);
    }

    pub fn get_multi_unicode(&self, hvo: Hvo, tag: FieldId, ws: WsId) -> Option<&String> {
        self.hit_or_miss(self.multi_unicodes.get(&(hvo, tag, ws)))
    }

    pub fn set_multi_unicode(&mut self, hvo: Hvo, tag: FieldId, ws: WsId, s: String) {
        self.multi_unicodes.insert((hvo, tag, ws), s);
    }

    pub fn get_text_props(&self, hvo: Hvo, tag: FieldId) -> Option<&TextProps> {
        self.hit_or_miss(self.text_props.get(&(hvo, tag)))
    }

    pub fn set_text_props(&mut self, hvo: Hvo, tag: FieldId, props: TextProps) {
        self.text_props.insert((hvo, tag), props);
    }

    // Object references. The outer Option is "loaded at all"; the inner is
    // "present or null".

    pub fn get_object(&self, hvo: Hvo, tag: FieldId) -> Option<Option<Hvo>> {
        self.hit_or_miss(self.objects.get(&(hvo, tag)).copied())
    }

    pub fn set_object(&mut self, hvo: Hvo, tag: FieldId, value: Option<Hvo>) {
        self.objects.insert((hvo, tag), value);
    }

    pub fn get_vector(&self, hvo: Hvo, tag: FieldId) -> Option<&Vec<Hvo>> {
        self.hit_or_miss(self.vectors.get(&(hvo, tag)))
    }

    pub fn set_vector(&mut self, hvo: Hvo, tag: FieldId, items: Vec<Hvo>) {
        self.vectors.insert((hvo, tag), items);
    }

    pub fn vector_len(&self, hvo: Hvo, tag: FieldId) -> Option<usize> {
        self.hit_or_miss(self.vectors.get(&(hvo, tag)).map(|v| v.len()))
    }

    pub fn vector_item(&self, hvo: Hvo, tag: FieldId, index: usize) -> Option<Option<Hvo>> {
        self.hit_or_miss(
            self.vectors
                .get(&(hvo, tag))
                .map(|v| v.get(index).copied()),
        )
    }

    // Timestamps.

    pub fn get_timestamp(&self, hvo: Hvo) -> Option<&Vec<u8>> {
        self.timestamps.get(&hvo)
    }

    pub fn set_timestamp(&mut self, hvo: Hvo, stamp: Vec<u8>) {
        self.timestamps.insert(hvo, stamp);
    }

    pub fn has_timestamp(&self, hvo: Hvo) -> bool {
        self.timestamps.contains_key(&hvo)
    }

    // Relation extras.

    pub fn get_rel_extra(&self, src: Hvo, tag: FieldId, dst: Hvo) -> Option<&String> {
        self.rel_extras.get(&(src, tag, dst))
    }

    pub fn set_rel_extra(&mut self, src: Hvo, tag: FieldId, dst: Hvo, extra: String) {
        self.rel_extras.insert((src, tag, dst), extra);
    }

    // Object-row conveniences built on the well-known base fields.

    pub fn set_object_info(
        &mut self,
        hvo: Hvo,
        clid: ClassId,
        guid: Option<Uuid>,
        owner: Option<Hvo>,
        own_flid: Option<FieldId>,
        own_ord: Option<i32>,
    ) {
        self.set_int(hvo, FLID_CLASS, clid.0 as i64);
        if let Some(g) = guid {
            self.set_guid(hvo, FLID_GUID, g);
        }
        self.set_object(hvo, FLID_OWNER, owner);
        if let Some(f) = own_flid {
            self.set_int(hvo, FLID_OWN_FLID, f.id() as i64);
        }
        if let Some(o) = own_ord {
            self.set_int(hvo, FLID_OWN_ORD, o as i64);
        }
    }

    pub fn get_class(&self, hvo: Hvo) -> Option<ClassId> {
        self.ints
            .get(&(hvo, FLID_CLASS))
            .map(|n| ClassId(*n as u32))
    }

    pub fn get_owner(&self, hvo: Hvo) -> Option<Option<Hvo>> {
        self.objects.get(&(hvo, FLID_OWNER)).copied()
    }

    pub fn set_owner_link(&mut self, hvo: Hvo, owner: Hvo, own_flid: FieldId) {
        self.set_object(hvo, FLID_OWNER, Some(owner));
        self.set_int(hvo, FLID_OWN_FLID, own_flid.id() as i64);
    }

    /// Drop every cached property keyed by this object, including its
    /// timestamp and any relation extras it sources.
    pub fn remove_object(&mut self, hvo: Hvo) {
        self.ints.retain(|k, _| k.0 != hvo);
        self.int64s.retain(|k, _| k.0 != hvo);
        self.guids.retain(|k, _| k.0 != hvo);
        self.binaries.retain(|k, _| k.0 != hvo);
        self.strings.retain(|k, _| k.0 != hvo);
        self.unicodes.retain(|k, _| k.0 != hvo);
        self.multi_strings.retain(|k, _| k.0 != hvo);
        self.multi_unicodes.retain(|k, _| k.0 != hvo);
        self.objects.retain(|k, _| k.0 != hvo);
        self.vectors.retain(|k, _| k.0 != hvo);
        self.text_props.retain(|k, _| k.0 != hvo);
        self.timestamps.remove(&hvo);
        self.rel_extras.retain(|k, _| k.0 != hvo);
    }

    /// Purge every cached reference to any of the given objects: entries in
    /// reference vectors, atomic references, and relation extras pointing at
    /// them. This is the expensive path; callers skip it when the store
    /// reports no incoming references.
    pub fn remove_incoming_refs(&mut self, deleted: &[Hvo]) {
        for items in self.vectors.values_mut() {
            items.retain(|h| !deleted.contains(h));
        }
        for target in self.objects.values_mut() {
            if let Some(t) = target {
                if deleted.contains(t) {
                    *target = None;
                }
            }
        }
        self.rel_extras.retain(|k, _| !deleted.contains(&k.2));
    }

    pub fn clear(&mut self) {
        *self = ObjectGraphCache {
            stats: std::mem::take(&mut self.stats),
            ..Default::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loaded_empty_vs_never_loaded() {
        let mut cache = ObjectGraphCache::new();
        let (h, t) = (Hvo::new(1), FieldId::new(2001));
        assert_eq!(cache.get_vector(h, t), None);
        cache.set_vector(h, t, vec![]);
        assert_eq!(cache.get_vector(h, t), Some(&vec![]));

        assert_eq!(cache.get_object(h, t), None);
        cache.set_object(h, t, None);
        assert_eq!(cache.get_object(h, t), Some(None));
    }

    #[test]
    fn test_remove_object_drops_all_keys() {
        let mut cache = ObjectGraphCache::new();
        let h = Hvo::new(9);
        cache.set_int(h, FieldId::new(1), 5);
        cache.set_unicode(h, FieldId::new(2), "x".into());
        cache.set_vector(h, FieldId::new(3), vec![Hvo::new(10)]);
        cache.set_timestamp(h, vec![0; 8]);
        cache.remove_object(h);
        assert_eq!(cache.get_int(h, FieldId::new(1)), None);
        assert_eq!(cache.get_unicode(h, FieldId::new(2)), None);
        assert_eq!(cache.get_vector(h, FieldId::new(3)), None);
        assert!(!cache.has_timestamp(h));
    }

    #[test]
    fn test_remove_incoming_refs() {
        let mut cache = ObjectGraphCache::new();
        let dead = Hvo::new(50);
        cache.set_vector(
            Hvo::new(1),
            FieldId::new(7),
            vec![Hvo::new(49), dead, Hvo::new(51)],
        );
        cache.set_object(Hvo::new(2), FieldId::new(8), Some(dead));
        cache.remove_incoming_refs(&[dead]);
        assert_eq!(
            cache.get_vector(Hvo::new(1), FieldId::new(7)),
            Some(&vec![Hvo::new(49), Hvo::new(51)])
        );
        assert_eq!(cache.get_object(Hvo::new(2), FieldId::new(8)), Some(None));
    }
}

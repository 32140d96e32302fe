//! Bidirectional map
//!
//! Every key on either side maps to exactly one key on the other side.
//! Inserting a pair evicts any pair that shared either key.

use std::collections::HashMap;
use std::collections::hash_map::Iter;
use std::hash::Hash;

pub enum Either<L, R> {
    Left(L),
    Right(R),
}

pub struct BiMap<K1, K2> {
    forward_map: HashMap<K1, K2>,
    backward_map: HashMap<K2, K1>,
}

impl<K1, K2> BiMap<K1, K2>
where
    K1: Hash + Eq + Clone,
    K2: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        BiMap {
            forward_map: HashMap::new(),
            backward_map: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key1: K1, key2: K2) {
        if let Some(old) = self.forward_map.remove(&key1) {
            self.backward_map.remove(&old);
        }
        if let Some(old) = self.backward_map.remove(&key2) {
            self.forward_map.remove(&old);
        }
        self.forward_map.insert(key1.clone(), key2.clone());
        self.backward_map.insert(key2, key1);
    }

    pub fn contains(&self, key: Either<&K1, &K2>) -> bool {
        match key {
            Either::Left(key1) => self.forward_map.contains_key(key1),
            Either::Right(key2) => self.backward_map.contains_key(key2),
        }
    }

    pub fn get_by_left(&self, key: &K1) -> Option<&K2> {
        self.forward_map.get(key)
    }

    pub fn get_by_right(&self, key: &K2) -> Option<&K1> {
        self.backward_map.get(key)
    }

    /// Remove the pair holding `key`, returning it as (left, right).
    pub fn remove(&mut self, key: Either<&K1, &K2>) -> Option<(K1, K2)> {
        match key {
            Either::Left(key1) => {
                let value = self.forward_map.remove(key1)?;
                let left = self.backward_map.remove(&value)?;
                Some((left, value))
            }
            Either::Right(key2) => {
                let value = self.backward_map.remove(key2)?;
                let right = self.forward_map.remove(&value)?;
                Some((value, right))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.forward_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward_map.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, K1, K2> {
        self.forward_map.iter()
    }
}

impl<K1, K2> Default for BiMap<K1, K2>
where
    K1: Hash + Eq + Clone,
    K2: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

//! The `Marshallable` capability and its stock implementations.
//!
//! Containers are a u32 element count followed by each element in iteration
//! order. Maps encode as a sequence of (key, value) pairs. `HashMap` order
//! is whatever the map iterates in, so two encodings of equal hash maps
//! need not be byte-identical.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;

use crate::error::{Result, WireError};
use crate::pack::Pack;
use crate::unpack::Unpack;

/// A value that can write itself to a `Pack` and read itself back.
pub trait Marshallable {
    fn marshal(&self, p: &mut Pack) -> Result<()>;
    fn unmarshal(&mut self, u: &mut Unpack<'_>) -> Result<()>;
}

/// Encode `value` into a fresh buffer.
pub fn to_bytes<T: Marshallable + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut p = Pack::new();
    value.marshal(&mut p)?;
    Ok(p.into_vec())
}

/// Decode a `T` that must consume all of `bytes`.
pub fn from_bytes<T: Marshallable + Default>(bytes: &[u8]) -> Result<T> {
    let mut u = Unpack::new(bytes);
    let mut value = T::default();
    value.unmarshal(&mut u)?;
    u.finish()?;
    Ok(value)
}

/// Raw bytes carried with a u16 length prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Varstr(pub Vec<u8>);

/// Raw bytes carried with a u32 length prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Varstr32(pub Vec<u8>);

macro_rules! scalar_marshal {
    ($($ty:ty => $push:ident, $pop:ident;)*) => {
        $(
            impl Marshallable for $ty {
                #[inline]
                fn marshal(&self, p: &mut Pack) -> Result<()> {
                    p.$push(*self).map(|_| ())
                }

                #[inline]
                fn unmarshal(&mut self, u: &mut Unpack<'_>) -> Result<()> {
                    *self = u.$pop()?;
                    Ok(())
                }
            }
        )*
    };
}

scalar_marshal! {
    u8 => push_u8, pop_u8;
    u16 => push_u16, pop_u16;
    u32 => push_u32, pop_u32;
    u64 => push_u64, pop_u64;
    i64 => push_i64, pop_i64;
    f64 => push_f64, pop_f64;
    bool => push_bool, pop_bool;
}

impl Marshallable for () {
    fn marshal(&self, _p: &mut Pack) -> Result<()> {
        Ok(())
    }

    fn unmarshal(&mut self, _u: &mut Unpack<'_>) -> Result<()> {
        Ok(())
    }
}

impl Marshallable for String {
    fn marshal(&self, p: &mut Pack) -> Result<()> {
        p.push_str(self).map(|_| ())
    }

    fn unmarshal(&mut self, u: &mut Unpack<'_>) -> Result<()> {
        let s = u.pop_str()?;
        self.clear();
        self.push_str(s);
        Ok(())
    }
}

impl Marshallable for Varstr {
    fn marshal(&self, p: &mut Pack) -> Result<()> {
        p.push_varstr(&self.0).map(|_| ())
    }

    fn unmarshal(&mut self, u: &mut Unpack<'_>) -> Result<()> {
        self.0 = u.pop_varstr()?.to_vec();
        Ok(())
    }
}

impl Marshallable for Varstr32 {
    fn marshal(&self, p: &mut Pack) -> Result<()> {
        p.push_varstr32(&self.0).map(|_| ())
    }

    fn unmarshal(&mut self, u: &mut Unpack<'_>) -> Result<()> {
        self.0 = u.pop_varstr32()?.to_vec();
        Ok(())
    }
}

impl<A: Marshallable, B: Marshallable> Marshallable for (A, B) {
    fn marshal(&self, p: &mut Pack) -> Result<()> {
        self.0.marshal(p)?;
        self.1.marshal(p)
    }

    fn unmarshal(&mut self, u: &mut Unpack<'_>) -> Result<()> {
        self.0.unmarshal(u)?;
        self.1.unmarshal(u)
    }
}

// ── containers ──

fn push_count(p: &mut Pack, len: usize) -> Result<()> {
    let n = u32::try_from(len).map_err(|_| WireError::BufferOverflow {
        limit: u32::MAX as usize,
        requested: len,
    })?;
    p.push_u32(n).map(|_| ())
}

fn pop_one<T: Marshallable + Default>(u: &mut Unpack<'_>) -> Result<T> {
    let mut item = T::default();
    item.unmarshal(u)?;
    Ok(item)
}

/// The count prefix is untrusted: never preallocate more slots than there
/// are bytes left.
fn capacity_hint(count: u32, u: &Unpack<'_>) -> usize {
    (count as usize).min(u.remaining())
}

impl<T: Marshallable + Default> Marshallable for Vec<T> {
    fn marshal(&self, p: &mut Pack) -> Result<()> {
        push_count(p, self.len())?;
        self.iter().try_for_each(|item| item.marshal(p))
    }

    fn unmarshal(&mut self, u: &mut Unpack<'_>) -> Result<()> {
        let count = u.pop_u32()?;
        self.clear();
        self.reserve(capacity_hint(count, u));
        for _ in 0..count {
            self.push(pop_one(u)?);
        }
        Ok(())
    }
}

impl<T: Marshallable + Default + Ord> Marshallable for BTreeSet<T> {
    fn marshal(&self, p: &mut Pack) -> Result<()> {
        push_count(p, self.len())?;
        self.iter().try_for_each(|item| item.marshal(p))
    }

    fn unmarshal(&mut self, u: &mut Unpack<'_>) -> Result<()> {
        let count = u.pop_u32()?;
        self.clear();
        for _ in 0..count {
            self.insert(pop_one(u)?);
        }
        Ok(())
    }
}

impl<K, V> Marshallable for BTreeMap<K, V>
where
    K: Marshallable + Default + Ord,
    V: Marshallable + Default,
{
    fn marshal(&self, p: &mut Pack) -> Result<()> {
        push_count(p, self.len())?;
        for (k, v) in self {
            k.marshal(p)?;
            v.marshal(p)?;
        }
        Ok(())
    }

    fn unmarshal(&mut self, u: &mut Unpack<'_>) -> Result<()> {
        let count = u.pop_u32()?;
        self.clear();
        for _ in 0..count {
            let k: K = pop_one(u)?;
            let v: V = pop_one(u)?;
            self.insert(k, v);
        }
        Ok(())
    }
}

impl<K, V> Marshallable for HashMap<K, V>
where
    K: Marshallable + Default + Eq + Hash,
    V: Marshallable + Default,
{
    fn marshal(&self, p: &mut Pack) -> Result<()> {
        push_count(p, self.len())?;
        for (k, v) in self {
            k.marshal(p)?;
            v.marshal(p)?;
        }
        Ok(())
    }

    fn unmarshal(&mut self, u: &mut Unpack<'_>) -> Result<()> {
        let count = u.pop_u32()?;
        self.clear();
        self.reserve(capacity_hint(count, u));
        for _ in 0..count {
            let k: K = pop_one(u)?;
            let v: V = pop_one(u)?;
            self.insert(k, v);
        }
        Ok(())
    }
}

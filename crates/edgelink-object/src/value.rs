use crate::{Arena, Error, Result};

/// Maximum nesting depth for value traversal (claim, canonicalize, JSON).
/// Deep enough for any configuration key path the runtime serves.
pub const MAX_OBJECT_DEPTH: usize = 15;

/// Maximum recursive subobject count accepted by bounded traversals.
pub const MAX_OBJECT_SUBOBJECTS: usize = 64;

/// Self-describing dynamic value carried in IPC payloads.
///
/// Byte storage (`Buf` contents and map keys) is borrowed — typically from a
/// receive buffer or an [`Arena`] — while list and map storage is owned.
/// [`Value::claim`] re-homes all borrowed bytes into an arena, detaching the
/// value from its source buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value<'a> {
    #[default]
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Buf(&'a [u8]),
    List(Vec<Value<'a>>),
    Map(Vec<Kv<'a>>),
}

/// A single map entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Kv<'a> {
    pub key: &'a [u8],
    pub value: Value<'a>,
}

impl<'a> Kv<'a> {
    #[inline]
    pub fn new(key: &'a [u8], value: Value<'a>) -> Self {
        Self { key, value }
    }
}

/// First entry with `key`, if any (maps are searched in insertion order).
pub fn map_get<'v, 'a>(pairs: &'v [Kv<'a>], key: &[u8]) -> Option<&'v Value<'a>> {
    pairs.iter().find(|kv| kv.key == key).map(|kv| &kv.value)
}

impl<'a> Value<'a> {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::I64(_) => "i64",
            Self::F64(_) => "f64",
            Self::Buf(_) => "buffer",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(i) => Some(*i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(f) => Some(*f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_buf(&self) -> Option<&'a [u8]> {
        match self {
            Self::Buf(b) => Some(b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_list(&self) -> Option<&[Value<'a>]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    #[inline]
    pub fn as_map(&self) -> Option<&[Kv<'a>]> {
        match self {
            Self::Map(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Bytes required to re-home all of this value's borrowed byte storage
    /// into a fresh arena. Byte allocations are alignment-1, so the figure is
    /// exact: [`Value::claim`] into an arena with at least this much room
    /// left succeeds, and with less fails with `NoMem`.
    pub fn mem_usage(&self) -> Result<usize> {
        self.mem_usage_at(0)
    }

    fn mem_usage_at(&self, depth: usize) -> Result<usize> {
        if depth > MAX_OBJECT_DEPTH {
            return Err(Error::Range);
        }
        match self {
            Self::Null | Self::Bool(_) | Self::I64(_) | Self::F64(_) => Ok(0),
            Self::Buf(b) => Ok(b.len()),
            Self::List(items) => {
                let mut total = 0usize;
                for item in items {
                    total += item.mem_usage_at(depth + 1)?;
                }
                Ok(total)
            }
            Self::Map(pairs) => {
                let mut total = 0usize;
                for kv in pairs {
                    total += kv.key.len();
                    total += kv.value.mem_usage_at(depth + 1)?;
                }
                Ok(total)
            }
        }
    }

    /// Deep-copies all borrowed byte storage into `arena`, returning a value
    /// that no longer aliases its source buffer.
    ///
    /// Bytes the arena already owns are reused without copying. Fails with
    /// `NoMem` when the arena cannot hold the remaining storage; the arena
    /// may be partially consumed in that case.
    pub fn claim<'m>(&self, arena: &mut Arena<'m>) -> Result<Value<'m>> {
        self.claim_at(arena, 0)
    }

    fn claim_at<'m>(&self, arena: &mut Arena<'m>, depth: usize) -> Result<Value<'m>> {
        if depth > MAX_OBJECT_DEPTH {
            return Err(Error::Range);
        }
        Ok(match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::I64(i) => Value::I64(*i),
            Self::F64(f) => Value::F64(*f),
            Self::Buf(b) => Value::Buf(claim_bytes(b, arena)?),
            Self::List(items) => {
                let mut claimed = Vec::with_capacity(items.len());
                for item in items {
                    claimed.push(item.claim_at(arena, depth + 1)?);
                }
                Value::List(claimed)
            }
            Self::Map(pairs) => {
                let mut claimed = Vec::with_capacity(pairs.len());
                for kv in pairs {
                    claimed.push(Kv::new(
                        claim_bytes(kv.key, arena)?,
                        kv.value.claim_at(arena, depth + 1)?,
                    ));
                }
                Value::Map(claimed)
            }
        })
    }
}

fn claim_bytes<'m>(bytes: &[u8], arena: &mut Arena<'m>) -> Result<&'m [u8]> {
    if arena.owns(bytes.as_ptr()) {
        // Already in this arena's backing region, which lives for 'm.
        return Ok(unsafe { core::slice::from_raw_parts(bytes.as_ptr(), bytes.len()) });
    }
    arena.alloc_copy(bytes)
}

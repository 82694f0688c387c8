//! The tuple-shaped entry stored under every managed key.
//!
//! An envelope is persisted as an ordered sequence of two or three elements:
//! `[processing, soft_expiry]` for a lock placeholder, or
//! `[processing, soft_expiry, value]` for a valued entry. The two-element
//! form exists so a lock can be taken on a key that has no prior value.
//! Anything else under a managed key is a codec error — this layer does not
//! interoperate with raw values.

use std::fmt;
use std::marker::PhantomData;

use serde::de::{self, DeserializeOwned, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// A cache entry managed by the coordination protocol.
///
/// `soft_expiry` is the protocol-level expiration (absolute Unix seconds,
/// fractional) at which recomputation should be initiated. It is strictly
/// earlier than the Memcached-level TTL on the entry, which gives a stale
/// value a bounded afterlife while one caller recomputes.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<V> {
    /// `true` while some caller has claimed the right to recompute.
    pub processing: bool,
    /// Absolute Unix timestamp (seconds) at which the value turns stale.
    pub soft_expiry: f64,
    /// The cached payload. Absent on lock placeholders.
    pub value: Option<V>,
}

impl Envelope<()> {
    /// The lock placeholder: `(true, 0)`, no value.
    ///
    /// Marks both first-insertion locks and re-computation locks. A CAS
    /// re-lock writes this same shape, deliberately dropping the prior
    /// value — the lock is brief, and readers that land in the window
    /// between the `cas` and the holder's `set` route to the waiter.
    pub fn placeholder() -> Self {
        Envelope {
            processing: true,
            soft_expiry: 0.0,
            value: None,
        }
    }
}

impl<V> Envelope<V> {
    /// A freshly computed entry: flag cleared, value authoritative.
    pub fn fresh(soft_expiry: f64, value: V) -> Self {
        Envelope {
            processing: false,
            soft_expiry,
            value: Some(value),
        }
    }

    /// Whether the value is still within its soft-expiry window.
    pub fn is_fresh(&self, now: f64) -> bool {
        self.soft_expiry > now
    }
}

impl<V: Serialize> Envelope<V> {
    /// Encodes the envelope into its wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<V: DeserializeOwned> Envelope<V> {
    /// Decodes an envelope read back from the store.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl<V: Serialize> Serialize for Envelope<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.value.is_some() { 3 } else { 2 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.processing)?;
        seq.serialize_element(&self.soft_expiry)?;
        if let Some(value) = &self.value {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for Envelope<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EnvelopeVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for EnvelopeVisitor<V> {
            type Value = Envelope<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a cache envelope sequence of length 2 or 3")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let processing = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let soft_expiry = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let value = seq.next_element()?;
                if seq.next_element::<de::IgnoredAny>()?.is_some() {
                    return Err(de::Error::invalid_length(4, &self));
                }
                Ok(Envelope {
                    processing,
                    soft_expiry,
                    value,
                })
            }
        }

        deserializer.deserialize_seq(EnvelopeVisitor(PhantomData))
    }
}

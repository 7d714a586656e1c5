use std::marker::PhantomData;
use serde::ser::{Serialize, Serializer, SerializeTuple};
use serde::de::{Deserialize, Deserializer, SeqAccess, Visitor, Error};

/// Copiable, serializable fixed-size array.
/// Serde only provides implementations for arrays of up to 32 elements; the
/// on-disk superblock carries padding regions well beyond that.
#[derive(Clone, Copy, Debug, Eq)]
pub struct Array<T, const C: usize>(pub [T; C]);

impl<T, const C: usize> Default for Array<T, C>
where
    T: Default + Copy
{
    fn default() -> Self
    {
        Self([T::default(); C])
    }
}

impl<T, const C: usize> PartialEq for Array<T, C>
where
    T: PartialEq
{
    fn eq(&self, other: &Self) -> bool
    {
        self.0.eq(&other.0)
    }
}

impl<T, const C: usize> Serialize for Array<T, C>
where
    T: Serialize
{
    #[inline]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer
    {
        let mut seq = serializer.serialize_tuple(C)?;
        for elem in &self.0 {
            seq.serialize_element(elem)?;
        }

        seq.end()
    }
}

impl<'de, T, const C: usize> Deserialize<'de> for Array<T, C>
where
    T: Deserialize<'de> + Default + Copy
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>
    {
        deserializer.deserialize_tuple(C, ArrayVisitor { marker: PhantomData })
    }
}

#[derive(Debug)]
struct ArrayVisitor<A> {
    marker: PhantomData<A>,
}

impl<'de, T, const C: usize> Visitor<'de> for ArrayVisitor<Array<T, C>>
where
    T: Deserialize<'de> + Default + Copy
{
    type Value = Array<T, C>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result
    {
        write!(formatter, "an array of {} elements", C)
    }

    #[inline]
    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>
    {
        let mut arr = Array([T::default(); C]);

        for i in 0..C {
            arr.0[i] = match seq.next_element()? {
                Some(v) => v,
                None => return Err(Error::invalid_length(i, &self)),
            }
        }

        Ok(arr)
    }
}

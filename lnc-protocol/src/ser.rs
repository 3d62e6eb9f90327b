use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;
use bitcoin::ScriptBuf;

use crate::error::{Error, Result};

/// Appends big-endian encoded fields to a buffer
#[derive(Default)]
pub struct Writer(Vec<u8>);

impl Writer {
    /// Create an empty writer
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append raw bytes
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    /// Append a u16 length followed by the bytes
    pub fn put_var_bytes(&mut self, bytes: &[u8]) {
        // callers bound their payloads by MAX_MESSAGE_SIZE
        self.put_slice(&(bytes.len() as u16).to_be_bytes());
        self.put_slice(bytes);
    }

    /// The encoded bytes
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

/// Reads big-endian encoded fields from a byte slice
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Start reading at the beginning of `buf`
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Whether everything has been consumed
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Read exactly `len` bytes
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let rest = self.remaining();
        if rest.is_empty() && len > 0 {
            return Err(Error::Eof);
        }
        if rest.len() < len {
            return Err(Error::ShortRead);
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    /// Read a fixed-size array
    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    /// Read a u16 length followed by that many bytes
    pub fn take_var_bytes(&mut self) -> Result<&'a [u8]> {
        let len = u16::read_from(self)?;
        self.take(len as usize)
    }
}

/// A field that has a fixed wire encoding
pub trait WireField: Sized {
    /// Append the encoding of this field
    fn write_to(&self, w: &mut Writer);
    /// Decode this field
    fn read_from(r: &mut Reader) -> Result<Self>;
}

macro_rules! int_field {
    ($($t:ty),*) => {
        $(
            impl WireField for $t {
                fn write_to(&self, w: &mut Writer) {
                    w.put_slice(&self.to_be_bytes());
                }

                fn read_from(r: &mut Reader) -> Result<Self> {
                    Ok(<$t>::from_be_bytes(r.take_array()?))
                }
            }
        )*
    };
}

int_field!(u8, u16, u32, u64);

impl WireField for [u8; 32] {
    fn write_to(&self, w: &mut Writer) {
        w.put_slice(self);
    }

    fn read_from(r: &mut Reader) -> Result<Self> {
        r.take_array()
    }
}

impl WireField for PublicKey {
    fn write_to(&self, w: &mut Writer) {
        w.put_slice(&self.serialize());
    }

    fn read_from(r: &mut Reader) -> Result<Self> {
        let bytes: [u8; 33] = r.take_array()?;
        PublicKey::from_slice(&bytes).map_err(|_| Error::InvalidPublicKey)
    }
}

impl WireField for Signature {
    fn write_to(&self, w: &mut Writer) {
        w.put_slice(&self.serialize_compact());
    }

    fn read_from(r: &mut Reader) -> Result<Self> {
        let bytes: [u8; 64] = r.take_array()?;
        Signature::from_compact(&bytes).map_err(|_| Error::InvalidSignature)
    }
}

impl WireField for Vec<u8> {
    fn write_to(&self, w: &mut Writer) {
        w.put_var_bytes(self);
    }

    fn read_from(r: &mut Reader) -> Result<Self> {
        Ok(r.take_var_bytes()?.to_vec())
    }
}

impl WireField for ScriptBuf {
    fn write_to(&self, w: &mut Writer) {
        w.put_var_bytes(self.as_bytes());
    }

    fn read_from(r: &mut Reader) -> Result<Self> {
        Ok(ScriptBuf::from_bytes(r.take_var_bytes()?.to_vec()))
    }
}

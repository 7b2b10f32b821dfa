use std::io::{Read, Write};

pub const MAGIC: &[u8; 6] = b"SPKG01";
pub const VERSION: u16 = 1;
pub const HEADER_LEN: u64 = 6 + 2 + 2 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub version: u16,
    pub flags: u16,
    /// Byte length of the CBOR meta that follows the header.
    pub meta_len: u64,
}

impl Superblock {
    /// Offset of the first entry.
    pub fn entries_off(&self) -> u64 {
        HEADER_LEN + self.meta_len
    }

    pub fn write_to(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_all(&self.version.to_le_bytes())?;
        w.write_all(&self.flags.to_le_bytes())?;
        w.write_all(&self.meta_len.to_le_bytes())?;
        Ok(())
    }

    pub fn read_from(mut r: impl Read) -> std::io::Result<Self> {
        let mut magic = [0u8; 6];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "not a siteport package",
            ));
        }
        let mut v = [0u8; 2];
        r.read_exact(&mut v)?;
        let version = u16::from_le_bytes(v);
        if version != VERSION {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported package version {version}"),
            ));
        }
        let mut fl = [0u8; 2];
        r.read_exact(&mut fl)?;
        let mut ml = [0u8; 8];
        r.read_exact(&mut ml)?;
        Ok(Self {
            version,
            flags: u16::from_le_bytes(fl),
            meta_len: u64::from_le_bytes(ml),
        })
    }
}

//! Minimal class file reader
//!
//! Reads just enough of a JVM class file to find the symbols it references
//! and to patch access flags in place: the constant pool, the class access
//! flags, and the access flags of every field and method. Everything else
//! is skipped by length.

use std::fmt;

const MAGIC: u32 = 0xCAFE_BABE;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_PROTECTED: u16 = 0x0004;

/// Why bytes could not be read as a class file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassFormatError {
    pub offset: usize,
    pub reason: &'static str,
}

impl fmt::Display for ClassFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.reason, self.offset)
    }
}

impl std::error::Error for ClassFormatError {}

type ParseResult<T> = Result<T, ClassFormatError>;

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> ParseResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(ClassFormatError {
                offset: self.pos,
                reason: "unexpected end of class file",
            }),
        }
    }

    fn u1(&mut self) -> ParseResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u2(&mut self) -> ParseResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u4(&mut self) -> ParseResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[derive(Debug, Clone)]
enum Constant {
    Utf8(String),
    Class { name: u16 },
    MemberRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    Other,
}

/// Kind of class member
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemberKind {
    Field,
    Method,
}

/// A field or method declared by the class
#[derive(Debug, Clone)]
pub struct Member {
    pub kind: MemberKind,
    pub name: String,
    pub descriptor: String,
    pub access: u16,
    access_offset: usize,
}

/// A field or method of some class referenced from the constant pool
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

/// Parsed view over the bytes of one class file
#[derive(Debug, Clone)]
pub struct ClassFile {
    pool: Vec<Constant>,
    this_class: u16,
    access: u16,
    access_offset: usize,
    members: Vec<Member>,
}

impl ClassFile {
    /// Parse the parts of a class file needed for visibility patching
    pub fn parse(bytes: &[u8]) -> ParseResult<Self> {
        let mut cur = Cursor { bytes, pos: 0 };

        if cur.u4()? != MAGIC {
            return Err(ClassFormatError {
                offset: 0,
                reason: "bad magic",
            });
        }
        cur.take(4)?; // minor + major version

        let count = cur.u2()? as usize;
        // Index 0 is unused; long and double take two slots.
        let mut pool = vec![Constant::Other; count.max(1)];
        let mut i = 1;
        while i < count {
            let tag = cur.u1()?;
            let mut wide = false;
            let constant = match tag {
                1 => {
                    let len = cur.u2()? as usize;
                    Constant::Utf8(String::from_utf8_lossy(cur.take(len)?).into_owned())
                }
                3 | 4 => {
                    cur.take(4)?;
                    Constant::Other
                }
                5 | 6 => {
                    cur.take(8)?;
                    wide = true;
                    Constant::Other
                }
                7 => Constant::Class { name: cur.u2()? },
                8 | 16 | 19 | 20 => {
                    cur.take(2)?;
                    Constant::Other
                }
                9..=11 => Constant::MemberRef {
                    class: cur.u2()?,
                    name_and_type: cur.u2()?,
                },
                12 => Constant::NameAndType {
                    name: cur.u2()?,
                    descriptor: cur.u2()?,
                },
                15 => {
                    cur.take(3)?;
                    Constant::Other
                }
                17 | 18 => {
                    cur.take(4)?;
                    Constant::Other
                }
                _ => {
                    return Err(ClassFormatError {
                        offset: cur.pos - 1,
                        reason: "unknown constant pool tag",
                    })
                }
            };
            pool[i] = constant;
            i += if wide { 2 } else { 1 };
        }

        let access_offset = cur.pos;
        let access = cur.u2()?;
        let this_class = cur.u2()?;
        cur.take(2)?; // super_class
        let interfaces = cur.u2()? as usize;
        cur.take(interfaces * 2)?;

        let mut class = Self {
            pool,
            this_class,
            access,
            access_offset,
            members: Vec::new(),
        };

        for kind in [MemberKind::Field, MemberKind::Method] {
            let count = cur.u2()?;
            for _ in 0..count {
                let access_offset = cur.pos;
                let access = cur.u2()?;
                let name = class.utf8(cur.u2()?)?.to_string();
                let descriptor = class.utf8(cur.u2()?)?.to_string();
                skip_attributes(&mut cur)?;
                class.members.push(Member {
                    kind,
                    name,
                    descriptor,
                    access,
                    access_offset,
                });
            }
        }

        class.this_name()?;
        Ok(class)
    }

    fn utf8(&self, index: u16) -> ParseResult<&str> {
        match self.pool.get(index as usize) {
            Some(Constant::Utf8(s)) => Ok(s),
            _ => Err(ClassFormatError {
                offset: self.access_offset,
                reason: "constant is not a UTF-8 entry",
            }),
        }
    }

    fn class_name(&self, index: u16) -> ParseResult<&str> {
        match self.pool.get(index as usize) {
            Some(Constant::Class { name }) => self.utf8(*name),
            _ => Err(ClassFormatError {
                offset: self.access_offset,
                reason: "constant is not a class entry",
            }),
        }
    }

    /// Internal name of the class itself, e.g. `com/example/Foo`
    pub fn this_name(&self) -> ParseResult<&str> {
        self.class_name(self.this_class)
    }

    /// Class access flags
    pub fn access(&self) -> u16 {
        self.access
    }

    /// Declared fields and methods
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Every class named by a class constant, excluding array descriptors
    pub fn class_refs(&self) -> Vec<&str> {
        self.pool
            .iter()
            .filter_map(|c| match c {
                Constant::Class { name } => self.utf8(*name).ok(),
                _ => None,
            })
            .filter(|name| !name.starts_with('['))
            .collect()
    }

    /// Every field and method reference in the constant pool
    pub fn member_refs(&self) -> Vec<MemberRef> {
        self.pool
            .iter()
            .filter_map(|c| {
                let Constant::MemberRef {
                    class,
                    name_and_type,
                } = c
                else {
                    return None;
                };
                let owner = self.class_name(*class).ok()?;
                let Some(Constant::NameAndType { name, descriptor }) =
                    self.pool.get(*name_and_type as usize)
                else {
                    return None;
                };
                Some(MemberRef {
                    owner: owner.to_string(),
                    name: self.utf8(*name).ok()?.to_string(),
                    descriptor: self.utf8(*descriptor).ok()?.to_string(),
                })
            })
            .collect()
    }
}

impl Member {
    /// Byte offset of the member's access flags in the class file
    pub fn access_offset(&self) -> usize {
        self.access_offset
    }
}

impl ClassFile {
    /// Byte offset of the class access flags
    pub fn access_offset(&self) -> usize {
        self.access_offset
    }
}

fn skip_attributes(cur: &mut Cursor<'_>) -> ParseResult<()> {
    let count = cur.u2()?;
    for _ in 0..count {
        cur.take(2)?;
        let len = cur.u4()? as usize;
        cur.take(len)?;
    }
    Ok(())
}

/// Access flags widened to public: private and protected are cleared
pub fn widen(access: u16) -> u16 {
    (access & !(ACC_PRIVATE | ACC_PROTECTED)) | ACC_PUBLIC
}

/// Overwrite a big-endian u16 in place
pub fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Assemble class files for tests
#[cfg(test)]
pub(crate) mod testing {
    /// Builder for a small but well-formed class file
    pub struct ClassBuilder {
        pool: Vec<Vec<u8>>,
        access: u16,
        this_class: u16,
        super_class: u16,
        fields: Vec<(u16, u16, u16)>,
        methods: Vec<(u16, u16, u16)>,
    }

    impl ClassBuilder {
        pub fn new(name: &str, access: u16) -> Self {
            let mut b = Self {
                pool: Vec::new(),
                access,
                this_class: 0,
                super_class: 0,
                fields: Vec::new(),
                methods: Vec::new(),
            };
            b.this_class = b.class(name);
            b.super_class = b.class("java/lang/Object");
            b
        }

        fn push(&mut self, entry: Vec<u8>) -> u16 {
            self.pool.push(entry);
            self.pool.len() as u16
        }

        pub fn utf8(&mut self, s: &str) -> u16 {
            let mut e = vec![1];
            e.extend_from_slice(&(s.len() as u16).to_be_bytes());
            e.extend_from_slice(s.as_bytes());
            self.push(e)
        }

        pub fn class(&mut self, name: &str) -> u16 {
            let n = self.utf8(name);
            let mut e = vec![7];
            e.extend_from_slice(&n.to_be_bytes());
            self.push(e)
        }

        /// Add a `Fieldref` (tag 9) or `Methodref` (tag 10)
        pub fn member_ref(&mut self, tag: u8, owner: &str, name: &str, desc: &str) -> u16 {
            let c = self.class(owner);
            let n = self.utf8(name);
            let d = self.utf8(desc);
            let mut nt = vec![12];
            nt.extend_from_slice(&n.to_be_bytes());
            nt.extend_from_slice(&d.to_be_bytes());
            let nt = self.push(nt);
            let mut e = vec![tag];
            e.extend_from_slice(&c.to_be_bytes());
            e.extend_from_slice(&nt.to_be_bytes());
            self.push(e)
        }

        /// Add a long constant, which occupies two pool slots
        pub fn long(&mut self, value: i64) {
            let mut e = vec![5];
            e.extend_from_slice(&value.to_be_bytes());
            self.pool.push(e);
            self.pool.push(Vec::new());
        }

        pub fn field(mut self, access: u16, name: &str, desc: &str) -> Self {
            let n = self.utf8(name);
            let d = self.utf8(desc);
            self.fields.push((access, n, d));
            self
        }

        pub fn method(mut self, access: u16, name: &str, desc: &str) -> Self {
            let n = self.utf8(name);
            let d = self.utf8(desc);
            self.methods.push((access, n, d));
            self
        }

        pub fn build(&self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
            out.extend_from_slice(&[0, 0, 0, 61]);
            out.extend_from_slice(&((self.pool.len() + 1) as u16).to_be_bytes());
            for entry in &self.pool {
                out.extend_from_slice(entry);
            }
            out.extend_from_slice(&self.access.to_be_bytes());
            out.extend_from_slice(&self.this_class.to_be_bytes());
            out.extend_from_slice(&self.super_class.to_be_bytes());
            out.extend_from_slice(&0u16.to_be_bytes());
            for members in [&self.fields, &self.methods] {
                out.extend_from_slice(&(members.len() as u16).to_be_bytes());
                for (access, name, desc) in members.iter() {
                    out.extend_from_slice(&access.to_be_bytes());
                    out.extend_from_slice(&name.to_be_bytes());
                    out.extend_from_slice(&desc.to_be_bytes());
                    // one opaque attribute, skipped by length
                    out.extend_from_slice(&1u16.to_be_bytes());
                    out.extend_from_slice(&name.to_be_bytes());
                    out.extend_from_slice(&3u32.to_be_bytes());
                    out.extend_from_slice(&[0xde, 0xad, 0x00]);
                }
            }
            out.extend_from_slice(&0u16.to_be_bytes());
            out
        }
    }
}
